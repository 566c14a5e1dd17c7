//! The per-VM bridge object.
//!
//! A [`Bridge`] lives exactly as long as its VM instance and is reachable
//! from the VM through the user-data pointer. It owns the router, the
//! foreign heap, the declaration tables and the diagnostic sink, so two VM
//! instances never share routing state.

use std::cell::RefCell;
use std::ffi::{c_char, c_void};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use tracing::{debug, error};

use crate::binder::{Binder, ClassKey, MethodKey};
use crate::config::BridgeConfig;
use crate::diagnostics::{Diagnostic, DiagnosticSink, ErrorKind};
use crate::error::{BridgeError, HandlerError};
use crate::foreign::{finalize_entry, ForeignClass, ForeignHeap};
use crate::router::Router;
use crate::trampoline::{self, Slot};
use crate::vm::{c_str_lossy, CallContext, FinalizerFn, ForeignMethodFn, VmApi};

/// Allocate/finalize pair handed to the VM for one foreign class.
#[repr(C)]
pub struct ForeignClassMethods<V: VmApi> {
    pub allocate: Option<ForeignMethodFn<V>>,
    pub finalize: Option<FinalizerFn>,
}

impl<V: VmApi> ForeignClassMethods<V> {
    /// No hooks: the VM treats the class as undeclared.
    pub fn none() -> Self {
        Self {
            allocate: None,
            finalize: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.allocate.is_some()
    }
}

impl<V: VmApi> Clone for ForeignClassMethods<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V: VmApi> Copy for ForeignClassMethods<V> {}

impl<V: VmApi> fmt::Debug for ForeignClassMethods<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignClassMethods")
            .field("allocate", &self.allocate.is_some())
            .field("finalize", &self.finalize.is_some())
            .finish()
    }
}

pub struct Bridge<V: VmApi> {
    config: BridgeConfig,
    router: Router,
    heap: Rc<ForeignHeap>,
    binder: RefCell<Binder>,
    sink: RefCell<Box<dyn DiagnosticSink>>,
    _vm: PhantomData<fn(*mut V::Raw)>,
}

impl<V: VmApi> Bridge<V> {
    /// Boxed so the address stored in the VM stays put.
    pub fn new(config: BridgeConfig) -> Box<Self> {
        Self::with_router(config, Router::new())
    }

    /// Bridge whose router may claim at most `capacity` slots.
    pub fn with_capacity(config: BridgeConfig, capacity: usize) -> Box<Self> {
        Self::with_router(config, Router::with_capacity(capacity))
    }

    fn with_router(config: BridgeConfig, router: Router) -> Box<Self> {
        let heap = Rc::new(ForeignHeap::new(router.collection_flag()));
        let sink = config.diagnostics.sink.build();
        Box::new(Self {
            config,
            router,
            heap,
            binder: RefCell::new(Binder::new()),
            sink: RefCell::new(sink),
            _vm: PhantomData,
        })
    }

    pub fn set_sink(&self, sink: impl DiagnosticSink + 'static) {
        *self.sink.borrow_mut() = Box::new(sink);
    }

    /// Point the VM's user data at this bridge.
    ///
    /// # Safety
    /// `vm` must be a live VM handle, and the bridge must outlive every
    /// native call the VM makes afterwards.
    pub unsafe fn attach(&self, vm: *mut V::Raw) {
        V::set_user_data(vm, self as *const Self as *mut c_void);
        debug!(bound = self.router.len(), "bridge attached to VM");
    }

    /// Clear the VM's user data.
    ///
    /// # Safety
    /// `vm` must be a live VM handle.
    pub unsafe fn detach(vm: *mut V::Raw) {
        V::set_user_data(vm, std::ptr::null_mut());
    }

    /// The bridge attached to `vm`, if any.
    ///
    /// # Safety
    /// `vm` must be a live VM handle whose user data is null or was set by
    /// [`Bridge::attach`] with the same `V`.
    pub unsafe fn from_vm<'a>(vm: *mut V::Raw) -> Option<&'a Self> {
        let data = V::user_data(vm);
        if data.is_null() {
            None
        } else {
            Some(&*(data as *const Self))
        }
    }

    /// Like [`Bridge::from_vm`], failing with [`BridgeError::NotAttached`].
    ///
    /// # Safety
    /// Same as [`Bridge::from_vm`].
    pub unsafe fn attached<'a>(vm: *mut V::Raw) -> Result<&'a Self, BridgeError> {
        Self::from_vm(vm).ok_or(BridgeError::NotAttached)
    }

    // --- registration ---

    /// Register `handler` and return its slot together with the entry point
    /// to install in the VM.
    pub fn register<F>(&self, handler: F) -> Result<(Slot, ForeignMethodFn<V>), BridgeError>
    where
        F: Fn(&mut dyn CallContext) -> Result<(), HandlerError> + 'static,
    {
        let slot = self.router.register(handler)?;
        let entry = trampoline::entry::<V>(slot).ok_or(BridgeError::TableExhausted {
            capacity: trampoline::TABLE_SIZE,
        })?;
        Ok((slot, entry))
    }

    pub fn define_method<F>(&self, module: &str, class: &str, is_static: bool, signature: &str, handler: F)
    where
        F: Fn(&mut dyn CallContext) -> Result<(), HandlerError> + 'static,
    {
        let key = MethodKey::new(module, class, is_static, signature);
        debug!(%key, "declared foreign method");
        self.binder.borrow_mut().define_method(key, handler);
    }

    pub fn define_class(&self, module: &str, class: ForeignClass) {
        let key = ClassKey::new(module, class.name());
        debug!(%key, "declared foreign class");
        self.binder.borrow_mut().define_class(key, class);
    }

    // --- VM bind callbacks ---

    /// Entry point for a `foreign` method the VM is linking, or `None` when
    /// nothing is declared for it or the table is full.
    pub fn bind_foreign_method(
        &self,
        module: &str,
        class: &str,
        is_static: bool,
        signature: &str,
    ) -> Option<ForeignMethodFn<V>> {
        let key = MethodKey::new(module, class, is_static, signature);
        match self.binder.borrow_mut().bind_method(&key, &self.router) {
            Ok(Some(slot)) => {
                debug!(%key, %slot, "bound foreign method");
                trampoline::entry::<V>(slot)
            }
            Ok(None) => {
                debug!(%key, "no foreign method declared");
                None
            }
            Err(err) => {
                error!(%key, error = %err, "cannot bind foreign method");
                None
            }
        }
    }

    /// Allocate/finalize hooks for a `foreign class` the VM is linking.
    pub fn bind_foreign_class(&self, module: &str, class: &str) -> ForeignClassMethods<V> {
        let key = ClassKey::new(module, class);
        let mut binder = self.binder.borrow_mut();
        let (class, bound) = match binder.class(&key) {
            Some((class, bound)) => (class.clone(), bound),
            None => {
                debug!(%key, "no foreign class declared");
                return ForeignClassMethods::none();
            }
        };

        let slot = match bound {
            Some(slot) => slot,
            None => {
                let heap = Rc::clone(&self.heap);
                let registered = self.router.register(move |ctx: &mut dyn CallContext| {
                    heap.allocate(&class, ctx)?;
                    Ok(())
                });
                match registered {
                    Ok(slot) => {
                        binder.mark_class_bound(&key, slot);
                        slot
                    }
                    Err(err) => {
                        error!(%key, error = %err, "cannot bind foreign class");
                        return ForeignClassMethods::none();
                    }
                }
            }
        };
        debug!(%key, %slot, "bound foreign class");
        ForeignClassMethods {
            allocate: trampoline::entry::<V>(slot),
            finalize: Some(finalize_entry as FinalizerFn),
        }
    }

    // --- diagnostics ---

    pub fn write(&self, bytes: &[u8]) {
        self.sink.borrow_mut().write(bytes);
    }

    pub fn report(&self, diagnostic: &Diagnostic<'_>) {
        self.sink.borrow_mut().report(diagnostic);
    }

    pub fn report_error(&self, kind: ErrorKind, module: &str, line: i32, message: &str) {
        self.report(&Diagnostic {
            kind,
            module,
            line,
            message,
        });
    }

    // --- accessors ---

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn heap(&self) -> &Rc<ForeignHeap> {
        &self.heap
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

impl<V: VmApi> fmt::Debug for Bridge<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("router", &self.router)
            .field("heap", &self.heap)
            .field("binder", &self.binder.borrow())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// C-string bind callbacks
// ---------------------------------------------------------------------------

/// Method-binding callback for the VM.
///
/// # Safety
/// `vm` must be a live VM handle; the strings null or NUL-terminated.
pub unsafe extern "C" fn bind_method_entry<V: VmApi>(
    vm: *mut V::Raw,
    module: *const c_char,
    class: *const c_char,
    is_static: bool,
    signature: *const c_char,
) -> Option<ForeignMethodFn<V>> {
    let bridge = Bridge::<V>::from_vm(vm)?;
    let (module, class, signature) = (c_str_lossy(module), c_str_lossy(class), c_str_lossy(signature));
    bridge.bind_foreign_method(&module, &class, is_static, &signature)
}

/// Class-binding callback for the VM.
///
/// # Safety
/// `vm` must be a live VM handle; the strings null or NUL-terminated.
pub unsafe extern "C" fn bind_class_entry<V: VmApi>(
    vm: *mut V::Raw,
    module: *const c_char,
    class: *const c_char,
) -> ForeignClassMethods<V> {
    match Bridge::<V>::from_vm(vm) {
        Some(bridge) => bridge.bind_foreign_class(&c_str_lossy(module), &c_str_lossy(class)),
        None => ForeignClassMethods::none(),
    }
}
