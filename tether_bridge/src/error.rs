//! Managed-side error taxonomy.
//!
//! Protocol failures surface as values here; at the ABI boundary they are
//! converted to raw statuses. Contract violations (releasing past zero,
//! registering a mismatched wrapper) are debug assertions, not errors.

use std::fmt;

use tether_core::status::{self, RawStatus};

/// Errors surfaced to managed callers of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    /// A required pointer or object argument was null.
    NullArgument(&'static str),
    /// An inner pointer was supplied without the aggregation flag.
    InnerRequiresAggregation,
    /// The requested interface is not implemented by the target.
    InterfaceNotSupported,
    /// The host collaborator declined to create a proxy for an identity.
    ProxyCreationFailed,
    /// The supplied proxy is already bound to a different native identity.
    ProxyAlreadyRegistered,
    /// A process-wide registration slot was already filled.
    AlreadyRegistered(&'static str),
    /// A process-wide registration slot required by the call is empty.
    NotRegistered(&'static str),
    /// A native call across the boundary failed with the given status.
    NativeFailure(RawStatus),
}

impl BridgeError {
    /// Raw status equivalent for the native side of the boundary.
    pub fn to_raw_status(self) -> RawStatus {
        match self {
            BridgeError::NullArgument(_) => status::INVALID_ARGUMENT,
            BridgeError::InnerRequiresAggregation => status::INVALID_ARGUMENT,
            BridgeError::InterfaceNotSupported => status::INVALID_CAST,
            BridgeError::ProxyCreationFailed => status::INVALID_ARGUMENT,
            BridgeError::ProxyAlreadyRegistered => status::FAIL,
            BridgeError::AlreadyRegistered(_) | BridgeError::NotRegistered(_) => status::FAIL,
            BridgeError::NativeFailure(raw) => raw,
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::NullArgument(name) => write!(f, "argument `{name}` must not be null"),
            BridgeError::InnerRequiresAggregation => {
                write!(f, "a supplied inner requires the aggregation flag")
            }
            BridgeError::InterfaceNotSupported => write!(f, "interface not supported"),
            BridgeError::ProxyCreationFailed => {
                write!(f, "the bridge host could not create a proxy for the identity")
            }
            BridgeError::ProxyAlreadyRegistered => {
                write!(f, "proxy is already registered for a different native identity")
            }
            BridgeError::AlreadyRegistered(slot) => {
                write!(f, "global {slot} bridge is already registered")
            }
            BridgeError::NotRegistered(slot) => {
                write!(f, "no global {slot} bridge is registered")
            }
            BridgeError::NativeFailure(raw) => write!(f, "native call failed: {raw:#010x}"),
        }
    }
}

impl std::error::Error for BridgeError {}
