//! Tether: a cross-heap object lifetime bridge.
//!
//! Tether lets a managed (handle/finalizer based) runtime and a native
//! reference-counted, vtable-dispatched object model share objects
//! safely under concurrent mutation and collection:
//!
//! - **Export** wraps a managed object so native callers can hold,
//!   refcount, and query it through an ABI-stable dispatch table.
//! - **Import** wraps a native object so managed code can hold it
//!   through a proxy.
//! - Both directions are deduplicated: repeated requests for the same
//!   identity return the same wrapper.
//! - A cooperative reference-tracker protocol lets a host walk
//!   cross-heap reference graphs during collection pauses to find
//!   cycles that neither side can see alone.
//!
//! # Architecture
//!
//! - [`refcount`]: the split lock-free reference count (native refs and
//!   tracker refs packed into one word with a destroy sentinel)
//! - [`dispatch`]: aligned dispatch sections with O(1) owner recovery
//! - [`exported`] + [`abi`]: the native-facing wrapper and its ABI
//! - [`imported`]: the managed-facing wrapper and its tracker link
//! - [`coordinator`]: the [`Bridge`] registry orchestrating both
//!   directions and their caches
//! - [`tracker`]: the reference-tracker host/target protocol
//! - [`registry`]: process-wide bridge registrations and marshalling
//! - [`weakref`]: weak-reference token bridging
//!
//! # Example
//!
//! ```ignore
//! use tether_bridge::{Bridge, BridgeHost, ExportFlags};
//!
//! let bridge = Bridge::new(MyHost);
//! let native = bridge.export(&instance, ExportFlags::empty())?;
//! // hand `native` to non-managed code; it releases through the ABI
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod abi;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod exported;
pub mod imported;
pub mod refcount;
pub mod registry;
pub mod tracker;
pub mod weakref;

mod identity_cache;
#[cfg(test)]
mod testsupport;
mod weak_set;

pub use abi::{dispatch_from_unknown, object_from_unknown, TAGGED_IID};
pub use coordinator::{native_for_object, Bridge, BridgeHost};
pub use error::BridgeError;
pub use exported::{ExportFlags, ExportedHolder};
pub use imported::ImportFlags;
pub use refcount::SplitRefCount;
