//! Slot → handler routing.
//!
//! The [`Router`] owns every registration of one VM instance. Registrations
//! are append-only: a slot, once bound, keeps its handler until the router is
//! dropped. [`dispatch`] is the single place every trampoline lands.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use tracing::{debug, error, warn};

use crate::boundary::catch_panic;
use crate::bridge::Bridge;
use crate::error::{BridgeError, HandlerError};
use crate::trampoline::{Slot, SlotCursor};
use crate::vm::{CallContext, VmApi};

/// A host function callable from script code.
pub type HostHandler = Rc<dyn Fn(&mut dyn CallContext) -> Result<(), HandlerError>>;

struct Bindings {
    cursor: SlotCursor,
    handlers: Vec<HostHandler>,
}

pub struct Router {
    bindings: RefCell<Bindings>,
    collecting: Rc<Cell<bool>>,
}

impl Router {
    /// Router over the full trampoline table.
    pub fn new() -> Self {
        Self::from_cursor(SlotCursor::new())
    }

    /// Router limited to the first `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_cursor(SlotCursor::with_capacity(capacity))
    }

    fn from_cursor(cursor: SlotCursor) -> Self {
        Self {
            bindings: RefCell::new(Bindings {
                cursor,
                handlers: Vec::new(),
            }),
            collecting: Rc::new(Cell::new(false)),
        }
    }

    /// Bind `handler` to the next free slot.
    pub fn register<F>(&self, handler: F) -> Result<Slot, BridgeError>
    where
        F: Fn(&mut dyn CallContext) -> Result<(), HandlerError> + 'static,
    {
        self.register_shared(Rc::new(handler))
    }

    /// Bind an already shared handler to the next free slot. Registering the
    /// same handler twice yields two slots.
    pub fn register_shared(&self, handler: HostHandler) -> Result<Slot, BridgeError> {
        if self.collecting.get() {
            return Err(BridgeError::CollectionInProgress);
        }
        let mut bindings = self.bindings.borrow_mut();
        let slot = bindings.cursor.assign()?;
        debug_assert_eq!(slot.index(), bindings.handlers.len());
        bindings.handlers.push(handler);
        debug!(%slot, "registered host handler");
        Ok(slot)
    }

    /// Run the handler bound to `slot`.
    ///
    /// A failing or panicking handler is reported to the script through
    /// [`CallContext::raise`] and comes back as [`BridgeError::HandlerFault`].
    pub fn invoke(&self, ctx: &mut dyn CallContext, slot: Slot) -> Result<(), BridgeError> {
        // Clone out so the handler may register more handlers while it runs.
        let handler = self
            .bindings
            .borrow()
            .handlers
            .get(slot.index())
            .cloned()
            .ok_or(BridgeError::UnboundSlot(slot))?;

        let message = match catch_panic(AssertUnwindSafe(|| (*handler)(&mut *ctx))) {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err.to_string(),
            Err(panic) => panic.to_string(),
        };
        warn!(%slot, %message, "host handler failed");
        ctx.raise(&message);
        Err(BridgeError::HandlerFault { slot, message })
    }

    pub fn is_bound(&self, slot: Slot) -> bool {
        slot.index() < self.len()
    }

    /// Number of bound slots.
    pub fn len(&self) -> usize {
        self.bindings.borrow().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.bindings.borrow().cursor.capacity()
    }

    /// Flag raised while a collection pass runs; shared with the foreign heap.
    pub(crate) fn collection_flag(&self) -> Rc<Cell<bool>> {
        Rc::clone(&self.collecting)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("bound", &self.len())
            .field("capacity", &self.capacity())
            .field("collecting", &self.collecting.get())
            .finish()
    }
}

/// Entry point shared by every trampoline.
///
/// Recovers the bridge from the VM user data and invokes the handler bound to
/// `slot`. A missing bridge or an unbound slot means a trampoline was handed
/// out without a registration behind it; both abort the process.
///
/// # Safety
/// `vm` must be a live VM handle currently executing a native call.
pub unsafe fn dispatch<V: VmApi>(vm: *mut V::Raw, slot: Slot) {
    let bridge = match Bridge::<V>::attached(vm) {
        Ok(bridge) => bridge,
        Err(err) => {
            error!(%slot, error = %err, "trampoline fired without a bridge");
            std::process::abort();
        }
    };
    let mut ctx = V::context(vm);
    match bridge.router().invoke(&mut ctx, slot) {
        Ok(()) | Err(BridgeError::HandlerFault { .. }) => {}
        Err(err) => {
            error!(%slot, error = %err, "dispatch invariant violated");
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockVm;
    use crate::vm::SlotValue;

    fn returning(value: f64) -> impl Fn(&mut dyn CallContext) -> Result<(), HandlerError> {
        move |ctx: &mut dyn CallContext| {
            ctx.set_double(0, value);
            Ok(())
        }
    }

    #[test]
    fn test_register_assigns_sequential_slots() {
        let router = Router::new();
        for n in 0..5u16 {
            assert_eq!(router.register(returning(0.0)).unwrap(), Slot::new(n));
        }
        assert_eq!(router.len(), 5);
    }

    #[test]
    fn test_invoke_reaches_bound_handler() {
        let router = Router::new();
        let a = router.register(returning(1.0)).unwrap();
        let b = router.register(returning(2.0)).unwrap();
        let mut vm = MockVm::with_slots(1);

        router.invoke(&mut vm, b).unwrap();
        assert_eq!(vm.get_double(0), 2.0);
        router.invoke(&mut vm, a).unwrap();
        assert_eq!(vm.get_double(0), 1.0);
    }

    #[test]
    fn test_invoke_unbound_slot() {
        let router = Router::new();
        router.register(returning(1.0)).unwrap();
        let mut vm = MockVm::with_slots(1);
        let err = router.invoke(&mut vm, Slot::new(1)).unwrap_err();
        assert!(matches!(err, BridgeError::UnboundSlot(s) if s == Slot::new(1)));
        assert!(vm.fiber_error().is_none());
    }

    #[test]
    fn test_exhaustion_keeps_prior_bindings() {
        let router = Router::with_capacity(2);
        let a = router.register(returning(10.0)).unwrap();
        let b = router.register(returning(20.0)).unwrap();
        assert!(matches!(
            router.register(returning(30.0)),
            Err(BridgeError::TableExhausted { capacity: 2 })
        ));
        assert_eq!(router.len(), 2);

        let mut vm = MockVm::with_slots(1);
        router.invoke(&mut vm, a).unwrap();
        assert_eq!(vm.get_double(0), 10.0);
        router.invoke(&mut vm, b).unwrap();
        assert_eq!(vm.get_double(0), 20.0);
    }

    #[test]
    fn test_handler_error_is_raised_in_vm() {
        let router = Router::new();
        let bad = router
            .register(|_ctx: &mut dyn CallContext| Err("division by zero".into()))
            .unwrap();
        let good = router.register(returning(5.0)).unwrap();

        let mut vm = MockVm::with_slots(1);
        let err = router.invoke(&mut vm, bad).unwrap_err();
        assert!(matches!(err, BridgeError::HandlerFault { ref message, .. } if message == "division by zero"));
        assert_eq!(vm.fiber_error(), Some("division by zero"));

        let mut vm = MockVm::with_slots(1);
        router.invoke(&mut vm, good).unwrap();
        assert_eq!(vm.get_double(0), 5.0);
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let router = Router::new();
        let slot = router
            .register(|_ctx: &mut dyn CallContext| panic!("handler blew up"))
            .unwrap();
        let mut vm = MockVm::with_slots(1);
        let err = router.invoke(&mut vm, slot).unwrap_err();
        assert!(matches!(err, BridgeError::HandlerFault { .. }));
        assert_eq!(vm.fiber_error(), Some("panic: handler blew up"));
    }

    #[test]
    fn test_handler_may_register_while_running() {
        let router = Rc::new(Router::new());
        let inner = Rc::clone(&router);
        let slot = router
            .register(move |ctx: &mut dyn CallContext| {
                let nested = inner.register(|_ctx: &mut dyn CallContext| Ok(()))?;
                ctx.set_double(0, nested.index() as f64);
                Ok(())
            })
            .unwrap();
        let mut vm = MockVm::with_slots(1);
        router.invoke(&mut vm, slot).unwrap();
        assert_eq!(vm.get_value(0), Some(SlotValue::Num(1.0)));
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn test_same_handler_registered_twice() {
        let router = Router::new();
        let shared: HostHandler = Rc::new(returning(3.0));
        let a = router.register_shared(Rc::clone(&shared)).unwrap();
        let b = router.register_shared(shared).unwrap();
        assert_ne!(a, b);
        assert!(router.is_bound(a) && router.is_bound(b));
    }

    #[test]
    fn test_registration_refused_during_collection() {
        let router = Router::new();
        let flag = router.collection_flag();
        flag.set(true);
        assert!(matches!(
            router.register(returning(0.0)),
            Err(BridgeError::CollectionInProgress)
        ));
        flag.set(false);
        assert!(router.register(returning(0.0)).is_ok());
    }
}
