//! Process-wide bridge registrations.
//!
//! Two registration slots exist, each filled at most once for the life
//! of the process:
//!
//! - **tracker support**: the bridge used when the tracker host needs to
//!   round-trip an identity into a peggable target or release a thread's
//!   tracked objects;
//! - **marshalling**: the single coordinator ambient marshalling goes
//!   through.
//!
//! Registration is compare-and-swap shaped: the first caller wins,
//! repeat registration is an error, and the slots are never reassigned.

use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use tether_rt::Obj;

use tether_core::unknown;
use tether_core::InterfaceId;

use crate::coordinator::Bridge;
use crate::dispatch;
use crate::error::BridgeError;
use crate::exported::ExportFlags;
use crate::imported::ImportFlags;
use crate::tracker::tracker_registry;

struct Registrations {
    tracker_support: OnceLock<Arc<Bridge>>,
    marshalling: OnceLock<Arc<Bridge>>,
}

fn registrations() -> &'static Registrations {
    static SLOTS: OnceLock<Registrations> = OnceLock::new();
    SLOTS.get_or_init(|| Registrations {
        tracker_support: OnceLock::new(),
        marshalling: OnceLock::new(),
    })
}

/// Register the bridge used for reference-tracker support. May be called
/// once per process.
pub fn register_for_tracker_support(bridge: Arc<Bridge>) -> Result<(), BridgeError> {
    registrations()
        .tracker_support
        .set(bridge)
        .map_err(|_| BridgeError::AlreadyRegistered("tracker-support"))
}

/// Register the bridge used for ambient marshalling. May be called once
/// per process.
pub fn register_for_marshalling(bridge: Arc<Bridge>) -> Result<(), BridgeError> {
    registrations()
        .marshalling
        .set(bridge)
        .map_err(|_| BridgeError::AlreadyRegistered("marshalling"))
}

/// The registered tracker-support bridge.
pub fn tracker_support_bridge() -> Option<Arc<Bridge>> {
    registrations().tracker_support.get().cloned()
}

/// The registered marshalling bridge.
pub fn marshalling_bridge() -> Option<Arc<Bridge>> {
    registrations().marshalling.get().cloned()
}

/// Export `instance` through the marshalling bridge.
pub fn native_for_instance(instance: &Obj) -> Result<*mut c_void, BridgeError> {
    let bridge = marshalling_bridge().ok_or(BridgeError::NotRegistered("marshalling"))?;
    bridge.export(instance, ExportFlags::empty())
}

/// Export `instance` and select `iid` on it, releasing the intermediate
/// base reference. The returned pointer carries one reference.
pub fn native_for_instance_with_interface(
    instance: &Obj,
    iid: &InterfaceId,
) -> Result<*mut c_void, BridgeError> {
    let unknown_ptr = native_for_instance(instance)?;
    let result = unsafe {
        let wrapper = dispatch::wrapper_from_slot(unknown_ptr);
        let result = (*wrapper).query_interface(iid);
        unknown::release(unknown_ptr);
        result
    };
    result.map_err(|_| BridgeError::InterfaceNotSupported)
}

/// Import `external` through the marshalling bridge, with the tracker
/// and unwrap semantics ambient marshalling expects.
pub fn instance_for_native(external: *mut c_void) -> Result<Obj, BridgeError> {
    let bridge = marshalling_bridge().ok_or(BridgeError::NotRegistered("marshalling"))?;
    bridge.import(external, ImportFlags::TRACKER_OBJECT | ImportFlags::UNWRAP)
}

/// Round-trip `external` through the tracker-support bridge into a
/// peggable tracker target: import it as a tracked proxy, then export
/// that proxy with tracker support.
pub fn get_or_create_tracker_target(external: *mut c_void) -> Result<*mut c_void, BridgeError> {
    let bridge = tracker_support_bridge().ok_or(BridgeError::NotRegistered("tracker-support"))?;
    let proxy = bridge.import(external, ImportFlags::TRACKER_OBJECT)?;
    bridge.export(&proxy, ExportFlags::TRACKER_SUPPORT)
}

/// The calling thread is done with reference tracking: disconnect its
/// tracked wrappers and bulk-release the surviving proxies.
pub fn release_external_objects_from_current_thread() -> Result<(), BridgeError> {
    let bridge = tracker_support_bridge().ok_or(BridgeError::NotRegistered("tracker-support"))?;
    tracker_registry().release_for_thread(&bridge);
    Ok(())
}

/// Re-import `external` through the bridge identified by `bridge_id`,
/// used when resolving weak-reference tokens. Returns `None` when the id
/// matches neither registered bridge.
pub(crate) fn object_from_bridge_id(bridge_id: u64, external: *mut c_void) -> Option<Obj> {
    if let Some(bridge) = tracker_support_bridge() {
        if bridge.id() == bridge_id {
            return bridge.import(external, ImportFlags::TRACKER_OBJECT).ok();
        }
    }
    if let Some(bridge) = marshalling_bridge() {
        if bridge.id() == bridge_id {
            return instance_for_native(external).ok();
        }
    }
    None
}
