//! Hostcall
//!
//! Routes native calls from an embedded scripting VM to host closures.
//!
//! The VM's native-extension API accepts only bare function pointers with no
//! per-binding context. This crate hands out entries from a build-time table
//! of trampolines, each hard-wired to one slot ordinal, and routes every call
//! through the [`Bridge`] stored in the VM's user data to the closure bound to
//! that slot. Foreign objects are backed by a per-VM generational heap, and
//! script output and errors go to a configurable [`DiagnosticSink`].
//!
//! Long-running work goes to a [`WorkerPool`]; scripts reach its futures
//! through the `Async` class in [`builtin`], next to the `math`, `strings`
//! and `strconv` modules.

pub mod binder;
pub mod builtin;
pub mod boundary;
pub mod bridge;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod foreign;
pub mod router;
pub mod tasks;
pub mod testing;
pub mod trampoline;
pub mod vm;

pub use bridge::{bind_class_entry, bind_method_entry, Bridge, ForeignClassMethods};
pub use config::{BridgeConfig, TaskConfig};
pub use diagnostics::{error_entry, write_entry, Diagnostic, DiagnosticSink, ErrorKind, MemorySink, SinkKind};
pub use error::{BridgeError, HandlerError};
pub use foreign::{finalize_entry, handle_of, with_foreign, ForeignClass, NativeHandle};
pub use router::Router;
pub use tasks::{CancelToken, FutureId, FutureState, TaskFuture, TaskResult, WorkerPool};
pub use trampoline::{Slot, TABLE_SIZE};
pub use vm::{CallContext, FinalizerFn, ForeignMethodFn, SlotType, SlotValue, VmApi};
