//! Error taxonomy for the bridge.

use thiserror::Error;

use crate::foreign::NativeHandle;
use crate::trampoline::Slot;

/// Error raised by a host handler. Any error type converts into it with `?`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Every trampoline ordinal is already bound.
    #[error("trampoline table exhausted: all {capacity} slots are bound")]
    TableExhausted { capacity: usize },

    /// A trampoline fired for a slot nothing was registered on.
    #[error("trampoline fired for unbound slot {0}")]
    UnboundSlot(Slot),

    /// The handler returned an error or panicked; already raised in the VM.
    #[error("handler on slot {slot} failed: {message}")]
    HandlerFault { slot: Slot, message: String },

    #[error("foreign object lifecycle failure: {0}")]
    LifecycleFault(String),

    #[error("stale foreign handle {0}")]
    StaleHandle(NativeHandle),

    #[error("foreign object does not hold a `{expected}`")]
    ForeignTypeMismatch { expected: &'static str },

    /// The slot map is read-only while finalizers run.
    #[error("cannot register handlers during a collection pass")]
    CollectionInProgress,

    #[error("no bridge attached to this VM")]
    NotAttached,

    #[error("configuration error: {0}")]
    Config(String),

    /// The worker pool could not start or accept work.
    #[error("worker pool error: {0}")]
    TaskPool(String),
}

impl BridgeError {
    /// Whether the error signals a broken internal invariant rather than a
    /// condition a caller can recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::UnboundSlot(_) | BridgeError::NotAttached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            BridgeError::TableExhausted { capacity: 4 }.to_string(),
            "trampoline table exhausted: all 4 slots are bound"
        );
        assert_eq!(
            BridgeError::UnboundSlot(Slot::new(7)).to_string(),
            "trampoline fired for unbound slot 7"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(BridgeError::UnboundSlot(Slot::new(0)).is_fatal());
        assert!(BridgeError::NotAttached.is_fatal());
        assert!(!BridgeError::TableExhausted { capacity: 1 }.is_fatal());
        assert!(!BridgeError::HandlerFault {
            slot: Slot::new(1),
            message: "x".into()
        }
        .is_fatal());
    }
}
