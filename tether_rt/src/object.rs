//! The managed object trait.

use std::any::Any;
use std::sync::Arc;

use tether_core::CustomQueryInterface;

/// A managed instance the bridge can export or hand back from an import.
///
/// Objects are shared (`Arc`) and identified by allocation address, so a
/// given instance has exactly one identity for the lifetime of its
/// allocation.
pub trait ManagedObject: Any + Send + Sync {
    /// Downcast access to the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Optional interface-query extension point consulted before the
    /// user-defined entry scan. The default (no extension) is cached per
    /// wrapper after the first probe.
    fn custom_query_interface(&self) -> Option<&dyn CustomQueryInterface> {
        None
    }
}

/// Shared handle to a managed instance.
pub type Obj = Arc<dyn ManagedObject>;

/// Stable identity of a managed instance: its allocation address.
#[inline]
pub fn object_identity(obj: &Obj) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}
