//! Interface identifiers and dispatch entries.
//!
//! An [`InterfaceId`] is the 128-bit key a native caller hands to
//! `query_interface` to select a dispatch table. The layout matches the
//! conventional GUID wire shape so identifiers can be compared and passed
//! across the ABI by value.

use std::ffi::c_void;
use std::fmt;

/// 128-bit interface identifier.
///
/// Field split follows the conventional GUID layout so that identifiers
/// defined in native headers compare bit-for-bit with identifiers defined
/// here.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceId {
    /// First 32 bits.
    pub data1: u32,
    /// Next 16 bits.
    pub data2: u16,
    /// Next 16 bits.
    pub data3: u16,
    /// Final 64 bits, byte-ordered.
    pub data4: [u8; 8],
}

impl InterfaceId {
    /// Build an identifier from its four GUID components.
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    /// The canonical base-interface identifier every native object answers:
    /// `00000000-0000-0000-C000-000000000046`.
    pub const UNKNOWN: InterfaceId = InterfaceId::new(
        0x0000_0000,
        0x0000,
        0x0000,
        [0xc0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x46],
    );
}

impl fmt::Debug for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

/// One user-supplied interface implementation: the identifier a caller
/// will ask for and the vtable that services it.
///
/// The vtable memory is owned by the caller and must outlive every
/// wrapper built from this entry.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterfaceEntry {
    /// Identifier the entry answers to.
    pub iid: InterfaceId,
    /// Pointer to the first function slot of the vtable.
    pub vtable: *const c_void,
}

// Safety: an entry is an id plus a pointer to immutable static-lifetime
// vtable memory.
unsafe impl Send for InterfaceEntry {}
unsafe impl Sync for InterfaceEntry {}

/// Result of a custom interface-query probe.
pub enum CustomQueryOutcome {
    /// The object produced an interface pointer itself; the pointer
    /// already carries a reference.
    Handled(*mut c_void),
    /// The object does not handle this identifier; fall through to the
    /// user-defined entry scan.
    NotHandled,
    /// The object vetoes the query; surface an invalid-cast to the caller.
    Failed,
}

/// Extension point letting a managed object intercept interface queries
/// before the user-defined entry scan runs.
///
/// A negative probe (the object does not implement this trait) is cached
/// on the wrapper so the probe happens at most once per wrapper.
pub trait CustomQueryInterface: Send + Sync {
    /// Try to produce an interface pointer for `iid`.
    fn get_interface(&self, iid: &InterfaceId) -> CustomQueryOutcome;
}
