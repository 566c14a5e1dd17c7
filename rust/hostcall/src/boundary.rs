//! Panic containment at the native boundary.
//!
//! Nothing may unwind out of an `extern "C"` entry point. Every place the
//! bridge runs host-supplied code (handlers, allocators, finalizer hooks,
//! diagnostic sinks) goes through [`catch_panic`] and turns the payload into
//! a message the VM or the log can carry.

use std::any::Any;
use std::fmt;
use std::panic::{self, UnwindSafe};

/// A panic caught at the boundary.
#[derive(Debug, Clone)]
pub struct PanicError {
    message: String,
}

impl PanicError {
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

impl std::error::Error for PanicError {}

/// Run `f`, converting a panic into `Err(PanicError)`.
pub fn catch_panic<T>(f: impl FnOnce() -> T + UnwindSafe) -> Result<T, PanicError> {
    panic::catch_unwind(f).map_err(PanicError::from_payload)
}
