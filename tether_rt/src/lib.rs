//! Managed-runtime facade for the tether bridge.
//!
//! The bridge cooperates with a managed object runtime through a small
//! surface: handles (weak, resurrection-tracking weak, and ref-counted
//! with a rootedness predicate), re-armable finalizers, and a collection
//! cycle that consults registered pause hooks before reclaiming anything.
//!
//! # Architecture
//!
//! - [`object`]: the `ManagedObject` trait and the `Obj` alias every
//!   managed instance travels as
//! - [`handles`]: the process-wide handle table
//! - [`finalize`]: the finalizer queue with resurrection-safe re-arming
//! - [`collect`]: the collection driver and its pause hooks
//!
//! This crate is both the specification of what a real collector must
//! provide and a working in-process implementation: embedders without a
//! tracing collector drive [`collect::Runtime::collect`] explicitly
//! (allocation pressure hints help decide when), and the test suites use
//! it to exercise every teardown path deterministically.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collect;
pub mod finalize;
pub mod handles;
pub mod object;

pub use collect::{runtime, CollectionHooks, Runtime};
pub use finalize::{finalizers, Finalize, FinalizerQueue};
pub use handles::{handles, Handle, HandleTable};
pub use object::{object_identity, ManagedObject, Obj};
