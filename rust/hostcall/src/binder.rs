//! Declarations the VM resolves when it meets a `foreign` method or class.
//!
//! The embedder declares handlers up front, keyed the way the VM asks for
//! them: `(module, class, signature)` for methods, with static methods
//! prefixed `"static "`, and `(module, class)` for classes. A declaration only
//! claims a trampoline slot the first time the VM binds it; later binds of the
//! same key reuse that slot.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{BridgeError, HandlerError};
use crate::foreign::ForeignClass;
use crate::router::{HostHandler, Router};
use crate::trampoline::Slot;
use crate::vm::CallContext;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    module: String,
    class: String,
    signature: String,
}

impl MethodKey {
    pub fn new(module: &str, class: &str, is_static: bool, signature: &str) -> Self {
        let signature = if is_static {
            format!("static {signature}")
        } else {
            signature.to_string()
        };
        Self {
            module: module.to_string(),
            class: class.to_string(),
            signature,
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}.{}", self.module, self.class, self.signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassKey {
    module: String,
    class: String,
}

impl ClassKey {
    pub fn new(module: &str, class: &str) -> Self {
        Self {
            module: module.to_string(),
            class: class.to_string(),
        }
    }
}

impl fmt::Display for ClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module, self.class)
    }
}

struct Declared<T> {
    item: T,
    bound: Option<Slot>,
}

/// Declared foreign methods and classes of one VM instance.
#[derive(Default)]
pub struct Binder {
    methods: HashMap<MethodKey, Declared<HostHandler>>,
    classes: HashMap<ClassKey, Declared<ForeignClass>>,
}

impl Binder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare (or redeclare) a foreign method. A redeclaration takes effect
    /// at the next bind; slots already handed to the VM keep their handler.
    pub fn define_method<F>(&mut self, key: MethodKey, handler: F)
    where
        F: Fn(&mut dyn CallContext) -> Result<(), HandlerError> + 'static,
    {
        self.methods.insert(
            key,
            Declared {
                item: Rc::new(handler),
                bound: None,
            },
        );
    }

    pub fn define_class(&mut self, key: ClassKey, class: ForeignClass) {
        self.classes.insert(
            key,
            Declared {
                item: class,
                bound: None,
            },
        );
    }

    /// Slot for a declared method, registering it on first use.
    /// `Ok(None)` when nothing is declared under `key`.
    pub fn bind_method(&mut self, key: &MethodKey, router: &Router) -> Result<Option<Slot>, BridgeError> {
        let Some(declared) = self.methods.get_mut(key) else {
            return Ok(None);
        };
        if let Some(slot) = declared.bound {
            return Ok(Some(slot));
        }
        let slot = router.register_shared(Rc::clone(&declared.item))?;
        declared.bound = Some(slot);
        Ok(Some(slot))
    }

    /// Declared class under `key` and the slot of its allocator, if already
    /// registered.
    pub fn class(&self, key: &ClassKey) -> Option<(&ForeignClass, Option<Slot>)> {
        self.classes.get(key).map(|d| (&d.item, d.bound))
    }

    pub fn mark_class_bound(&mut self, key: &ClassKey, slot: Slot) {
        if let Some(declared) = self.classes.get_mut(key) {
            declared.bound = Some(slot);
        }
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }
}

impl fmt::Debug for Binder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binder")
            .field("methods", &self.methods.len())
            .field("classes", &self.classes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockVm;

    fn ok(_ctx: &mut dyn CallContext) -> Result<(), HandlerError> {
        Ok(())
    }

    #[test]
    fn test_static_prefix_in_key() {
        let key = MethodKey::new("main", "Math", true, "add(_,_)");
        assert_eq!(key.signature(), "static add(_,_)");
        assert_eq!(key.to_string(), "main::Math.static add(_,_)");
        assert_ne!(key, MethodKey::new("main", "Math", false, "add(_,_)"));
    }

    #[test]
    fn test_undeclared_method_binds_to_nothing() {
        let mut binder = Binder::new();
        let router = Router::new();
        let key = MethodKey::new("main", "Math", true, "add(_,_)");
        assert_eq!(binder.bind_method(&key, &router).unwrap(), None);
        assert!(router.is_empty());
    }

    #[test]
    fn test_repeated_bind_reuses_slot() {
        let mut binder = Binder::new();
        let router = Router::new();
        let key = MethodKey::new("main", "Math", true, "add(_,_)");
        binder.define_method(key.clone(), ok);

        let first = binder.bind_method(&key, &router).unwrap();
        let second = binder.bind_method(&key, &router).unwrap();
        assert_eq!(first, second);
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_static_and_instance_bind_separately() {
        let mut binder = Binder::new();
        let router = Router::new();
        let stat = MethodKey::new("main", "Vec", true, "len");
        let inst = MethodKey::new("main", "Vec", false, "len");
        binder.define_method(stat.clone(), |ctx: &mut dyn CallContext| {
            ctx.set_double(0, 1.0);
            Ok(())
        });
        binder.define_method(inst.clone(), |ctx: &mut dyn CallContext| {
            ctx.set_double(0, 2.0);
            Ok(())
        });
        let s = binder.bind_method(&stat, &router).unwrap().unwrap();
        let i = binder.bind_method(&inst, &router).unwrap().unwrap();
        assert_ne!(s, i);

        let mut vm = MockVm::with_slots(1);
        router.invoke(&mut vm, i).unwrap();
        assert_eq!(vm.get_double(0), 2.0);
    }

    #[test]
    fn test_redeclaration_gets_a_new_slot() {
        let mut binder = Binder::new();
        let router = Router::new();
        let key = MethodKey::new("main", "Greeter", true, "greet(_)");
        binder.define_method(key.clone(), ok);
        let old = binder.bind_method(&key, &router).unwrap().unwrap();
        binder.define_method(key.clone(), ok);
        let new = binder.bind_method(&key, &router).unwrap().unwrap();
        assert_ne!(old, new);
        assert!(router.is_bound(old));
    }

    #[test]
    fn test_bind_propagates_exhaustion() {
        let mut binder = Binder::new();
        let router = Router::with_capacity(1);
        let a = MethodKey::new("main", "A", true, "f()");
        let b = MethodKey::new("main", "B", true, "f()");
        binder.define_method(a.clone(), ok);
        binder.define_method(b.clone(), ok);
        binder.bind_method(&a, &router).unwrap();
        assert!(matches!(
            binder.bind_method(&b, &router),
            Err(BridgeError::TableExhausted { .. })
        ));
        // A later bind of the already-bound key still succeeds.
        assert!(binder.bind_method(&a, &router).unwrap().is_some());
    }
}
