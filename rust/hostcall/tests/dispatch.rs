//! Registration and dispatch through the compiled trampolines.
//!
//! Every call here goes VM → `extern "C"` entry → bridge in user data →
//! router → handler, using `MockVm` as the VM.

use hostcall::testing::MockVm;
use hostcall::{
    Bridge, BridgeConfig, BridgeError, CallContext, HandlerError, SinkKind, Slot, SlotValue, TABLE_SIZE,
};

type TestBridge = Bridge<hostcall::testing::MockApi>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("hostcall=debug")
        .try_init();
}

fn bridge(capacity: usize) -> Box<TestBridge> {
    init_tracing();
    let mut config = BridgeConfig::default();
    config.diagnostics.sink = SinkKind::Discard;
    TestBridge::with_capacity(config, capacity)
}

fn returning(value: f64) -> impl Fn(&mut dyn CallContext) -> Result<(), HandlerError> {
    move |ctx: &mut dyn CallContext| {
        ctx.set_double(0, value);
        Ok(())
    }
}

#[test]
fn test_slots_assigned_in_order_until_exhausted() {
    let bridge = bridge(3);
    let mut vm = MockVm::new();
    unsafe { bridge.attach(vm.as_ptr()) };

    let mut entries = Vec::new();
    for n in 0..3u16 {
        let (slot, entry) = bridge.register(returning(f64::from(n) * 10.0)).unwrap();
        assert_eq!(slot, Slot::new(n));
        entries.push(entry);
    }
    let err = bridge.register(returning(99.0)).unwrap_err();
    assert!(matches!(err, BridgeError::TableExhausted { capacity: 3 }));

    // Call in reverse to show routing does not depend on registration order.
    for (n, entry) in entries.iter().enumerate().rev() {
        assert_eq!(vm.call(*entry, &[]), Ok(Some(SlotValue::Num(n as f64 * 10.0))));
    }
}

#[test]
fn test_full_table_then_one_more() {
    let bridge = bridge(TABLE_SIZE);
    let mut vm = MockVm::new();
    unsafe { bridge.attach(vm.as_ptr()) };

    let entries: Vec<_> = (0..TABLE_SIZE)
        .map(|n| bridge.register(returning(n as f64)).unwrap().1)
        .collect();
    assert!(matches!(
        bridge.register(returning(0.0)),
        Err(BridgeError::TableExhausted { capacity }) if capacity == TABLE_SIZE
    ));

    let first = vm.call(entries[0], &[]);
    let last = vm.call(entries[TABLE_SIZE - 1], &[]);
    assert_eq!(first, Ok(Some(SlotValue::Num(0.0))));
    assert_eq!(last, Ok(Some(SlotValue::Num((TABLE_SIZE - 1) as f64))));
}

#[test]
fn test_handler_reads_arguments() {
    let bridge = bridge(TABLE_SIZE);
    let mut vm = MockVm::new();
    unsafe { bridge.attach(vm.as_ptr()) };

    let (_, concat) = bridge
        .register(|ctx: &mut dyn CallContext| {
            let joined = format!("{}-{}", ctx.get_string(1), ctx.get_double(2));
            ctx.set_string(0, &joined);
            Ok(())
        })
        .unwrap();
    let result = vm.call(concat, &[SlotValue::from("id"), SlotValue::from(7.0)]);
    assert_eq!(result, Ok(Some(SlotValue::Str("id-7".into()))));
}

#[test]
fn test_fault_becomes_runtime_error_and_others_survive() {
    let bridge = bridge(TABLE_SIZE);
    let mut vm = MockVm::new();
    unsafe { bridge.attach(vm.as_ptr()) };

    let (_, ok) = bridge.register(returning(1.0)).unwrap();
    let (_, failing) = bridge
        .register(|ctx: &mut dyn CallContext| {
            let divisor = ctx.get_double(1);
            if divisor == 0.0 {
                return Err("division by zero".into());
            }
            ctx.set_double(0, 1.0 / divisor);
            Ok(())
        })
        .unwrap();
    let (_, panicking) = bridge
        .register(|_ctx: &mut dyn CallContext| panic!("index out of range"))
        .unwrap();

    assert_eq!(vm.call(failing, &[SlotValue::Num(0.0)]), Err("division by zero".to_string()));
    assert_eq!(vm.call(panicking, &[]), Err("panic: index out of range".to_string()));
    // A handler that reads the wrong slot type panics inside the VM double.
    assert!(vm.call(failing, &[SlotValue::from("x")]).is_err());

    assert_eq!(vm.call(ok, &[]), Ok(Some(SlotValue::Num(1.0))));
    assert_eq!(vm.call(failing, &[SlotValue::Num(4.0)]), Ok(Some(SlotValue::Num(0.25))));
    assert!(vm.fiber_error().is_none());
}

#[test]
fn test_bound_methods_reuse_slots() {
    let bridge = bridge(TABLE_SIZE);
    bridge.define_method("main", "Math", true, "add(_,_)", |ctx: &mut dyn CallContext| {
        let sum = ctx.get_double(1) + ctx.get_double(2);
        ctx.set_double(0, sum);
        Ok(())
    });

    let first = bridge.bind_foreign_method("main", "Math", true, "add(_,_)").unwrap();
    let again = bridge.bind_foreign_method("main", "Math", true, "add(_,_)").unwrap();
    assert_eq!(first as usize, again as usize);
    assert_eq!(bridge.router().len(), 1);

    assert!(bridge.bind_foreign_method("main", "Math", false, "add(_,_)").is_none());
    assert!(bridge.bind_foreign_method("other", "Math", true, "add(_,_)").is_none());
}

#[test]
fn test_static_and_instance_methods_bind_separately() {
    let bridge = bridge(TABLE_SIZE);
    let mut vm = MockVm::new();
    unsafe { bridge.attach(vm.as_ptr()) };

    bridge.define_method("main", "Counter", true, "count", |ctx: &mut dyn CallContext| {
        ctx.set_string(0, "static");
        Ok(())
    });
    bridge.define_method("main", "Counter", false, "count", |ctx: &mut dyn CallContext| {
        ctx.set_string(0, "instance");
        Ok(())
    });

    let stat = bridge.bind_foreign_method("main", "Counter", true, "count").unwrap();
    let inst = bridge.bind_foreign_method("main", "Counter", false, "count").unwrap();
    assert_ne!(stat as usize, inst as usize);
    assert_eq!(vm.call(stat, &[]), Ok(Some(SlotValue::from("static"))));
    assert_eq!(vm.call(inst, &[]), Ok(Some(SlotValue::from("instance"))));
}

#[test]
fn test_bind_fails_soft_when_table_is_full() {
    let bridge = bridge(1);
    bridge.define_method("main", "A", true, "f()", returning(1.0));
    bridge.define_method("main", "B", true, "f()", returning(2.0));

    assert!(bridge.bind_foreign_method("main", "A", true, "f()").is_some());
    assert!(bridge.bind_foreign_method("main", "B", true, "f()").is_none());
    assert!(bridge.bind_foreign_method("main", "A", true, "f()").is_some());
}
