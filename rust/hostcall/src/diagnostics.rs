//! Script output and error reporting.
//!
//! The VM hands over two kinds of text: raw output chunks produced by the
//! script, and structured error notifications. Output is forwarded verbatim
//! and in order; errors are rendered in the VM's reference layout before they
//! reach the sink.

use std::cell::RefCell;
use std::ffi::{c_char, c_int, CStr};
use std::fmt;
use std::io::{self, Write};
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::boundary::catch_panic;
use crate::bridge::Bridge;
use crate::vm::{c_str_lossy, VmApi};

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CompileError,
    RuntimeError,
    StackTraceFrame,
}

impl ErrorKind {
    /// Decode the VM's error type: 0 compile, 1 runtime, 2 stack trace.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(ErrorKind::CompileError),
            1 => Some(ErrorKind::RuntimeError),
            2 => Some(ErrorKind::StackTraceFrame),
            _ => None,
        }
    }
}

/// One error notification from the VM.
///
/// `Display` produces the exact line existing log consumers expect,
/// trailing newline included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostic<'a> {
    pub kind: ErrorKind,
    pub module: &'a str,
    pub line: i32,
    pub message: &'a str,
}

impl fmt::Display for Diagnostic<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::CompileError => {
                writeln!(f, "[{} line {}] [Error] {}", self.module, self.line, self.message)
            }
            ErrorKind::StackTraceFrame => {
                writeln!(f, "[{} line {}] in {}", self.module, self.line, self.message)
            }
            ErrorKind::RuntimeError => writeln!(f, "[Runtime Error] {}", self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination for script output and diagnostics.
pub trait DiagnosticSink {
    /// Forward one output chunk exactly as produced.
    fn write(&mut self, bytes: &[u8]);

    fn report(&mut self, diagnostic: &Diagnostic<'_>);
}

/// Output to stdout, diagnostics to stderr; nothing is held back.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioSink;

impl DiagnosticSink for StdioSink {
    fn write(&mut self, bytes: &[u8]) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(bytes);
        let _ = out.flush();
    }

    fn report(&mut self, diagnostic: &Diagnostic<'_>) {
        let _ = io::stderr().lock().write_all(diagnostic.to_string().as_bytes());
    }
}

/// Collects everything in memory. Clones share the same buffers.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    output: Rc<RefCell<Vec<u8>>>,
    errors: Rc<RefCell<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output.borrow()).into_owned()
    }

    pub fn output_bytes(&self) -> Vec<u8> {
        self.output.borrow().clone()
    }

    pub fn errors(&self) -> String {
        self.errors.borrow().clone()
    }

    pub fn clear(&self) {
        self.output.borrow_mut().clear();
        self.errors.borrow_mut().clear();
    }
}

impl DiagnosticSink for MemorySink {
    fn write(&mut self, bytes: &[u8]) {
        self.output.borrow_mut().extend_from_slice(bytes);
    }

    fn report(&mut self, diagnostic: &Diagnostic<'_>) {
        use std::fmt::Write as _;
        let _ = write!(self.errors.borrow_mut(), "{diagnostic}");
    }
}

/// Routes output and diagnostics into `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn write(&mut self, bytes: &[u8]) {
        info!(target: "hostcall::script", "{}", String::from_utf8_lossy(bytes));
    }

    fn report(&mut self, d: &Diagnostic<'_>) {
        match d.kind {
            ErrorKind::CompileError => {
                error!(target: "hostcall::script", module = d.module, line = d.line, "{}", d.message)
            }
            ErrorKind::RuntimeError => error!(target: "hostcall::script", "{}", d.message),
            ErrorKind::StackTraceFrame => {
                warn!(target: "hostcall::script", module = d.module, line = d.line, "in {}", d.message)
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn write(&mut self, _bytes: &[u8]) {}
    fn report(&mut self, _diagnostic: &Diagnostic<'_>) {}
}

/// Sink selected by configuration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Stdio,
    Tracing,
    Discard,
}

impl SinkKind {
    pub fn build(self) -> Box<dyn DiagnosticSink> {
        match self {
            SinkKind::Stdio => Box::new(StdioSink),
            SinkKind::Tracing => Box::new(TracingSink),
            SinkKind::Discard => Box::new(NullSink),
        }
    }
}

// ---------------------------------------------------------------------------
// VM callbacks
// ---------------------------------------------------------------------------

/// Output callback for the VM.
///
/// Forwards to the attached bridge's sink, or to stdout when no bridge is
/// attached.
///
/// # Safety
/// `vm` must be a live VM handle and `text` null or a NUL-terminated string.
pub unsafe extern "C" fn write_entry<V: VmApi>(vm: *mut V::Raw, text: *const c_char) {
    if text.is_null() {
        return;
    }
    let bytes = CStr::from_ptr(text).to_bytes();
    let outcome = catch_panic(AssertUnwindSafe(|| match Bridge::<V>::from_vm(vm) {
        Some(bridge) => bridge.write(bytes),
        None => StdioSink.write(bytes),
    }));
    if let Err(panic) = outcome {
        error!(error = %panic, "output sink panicked");
    }
}

/// Error callback for the VM.
///
/// # Safety
/// `vm` must be a live VM handle; `module` and `message` null or
/// NUL-terminated strings.
pub unsafe extern "C" fn error_entry<V: VmApi>(
    vm: *mut V::Raw,
    kind: c_int,
    module: *const c_char,
    line: c_int,
    message: *const c_char,
) {
    let Some(kind) = ErrorKind::from_raw(kind) else {
        warn!(kind, "unknown error kind from VM");
        return;
    };
    let module = c_str_lossy(module);
    let message = c_str_lossy(message);
    let diagnostic = Diagnostic {
        kind,
        module: &module,
        line,
        message: &message,
    };
    let outcome = catch_panic(AssertUnwindSafe(|| match Bridge::<V>::from_vm(vm) {
        Some(bridge) => bridge.report(&diagnostic),
        None => StdioSink.report(&diagnostic),
    }));
    if let Err(panic) = outcome {
        error!(error = %panic, "diagnostic sink panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(kind: ErrorKind, module: &str, line: i32, message: &str) -> String {
        Diagnostic {
            kind,
            module,
            line,
            message,
        }
        .to_string()
    }

    #[test]
    fn test_compile_error_format() {
        assert_eq!(
            render(ErrorKind::CompileError, "main", 3, "bad"),
            "[main line 3] [Error] bad\n"
        );
    }

    #[test]
    fn test_stack_trace_format() {
        assert_eq!(
            render(ErrorKind::StackTraceFrame, "lib/util", 12, "Foo.bar(_)"),
            "[lib/util line 12] in Foo.bar(_)\n"
        );
    }

    #[test]
    fn test_runtime_error_ignores_location() {
        assert_eq!(
            render(ErrorKind::RuntimeError, "main", 99, "boom"),
            "[Runtime Error] boom\n"
        );
        assert_eq!(render(ErrorKind::RuntimeError, "", -1, "boom"), "[Runtime Error] boom\n");
    }

    #[test]
    fn test_error_kind_from_raw() {
        assert_eq!(ErrorKind::from_raw(0), Some(ErrorKind::CompileError));
        assert_eq!(ErrorKind::from_raw(1), Some(ErrorKind::RuntimeError));
        assert_eq!(ErrorKind::from_raw(2), Some(ErrorKind::StackTraceFrame));
        assert_eq!(ErrorKind::from_raw(3), None);
    }

    #[test]
    fn test_memory_sink_preserves_order_and_bytes() {
        let mut sink = MemorySink::new();
        let view = sink.clone();
        sink.write(b"a");
        sink.write(b"b");
        sink.write(b"c");
        sink.write(b"");
        sink.write(b"\n\xff");
        assert_eq!(view.output_bytes(), b"abc\n\xff");
    }

    #[test]
    fn test_memory_sink_collects_reports() {
        let mut sink = MemorySink::new();
        sink.report(&Diagnostic {
            kind: ErrorKind::RuntimeError,
            module: "main",
            line: 1,
            message: "x",
        });
        sink.report(&Diagnostic {
            kind: ErrorKind::StackTraceFrame,
            module: "main",
            line: 1,
            message: "(script)",
        });
        assert_eq!(sink.errors(), "[Runtime Error] x\n[main line 1] in (script)\n");
        sink.clear();
        assert!(sink.errors().is_empty());
    }

    #[test]
    fn test_sink_kind_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            sink: SinkKind,
        }
        let w: Wrapper = toml::from_str("sink = \"tracing\"").unwrap();
        assert_eq!(w.sink, SinkKind::Tracing);
    }
}
