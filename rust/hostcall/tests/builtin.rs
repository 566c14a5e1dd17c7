//! The `math`, `strings` and `strconv` modules as a script calls them.

use hostcall::builtin::declare_standard;
use hostcall::testing::{MockApi, MockVm};
use hostcall::{Bridge, BridgeConfig, CallContext, ForeignMethodFn, SinkKind, SlotValue};

struct Harness {
    vm: MockVm,
    bridge: Box<Bridge<MockApi>>,
}

impl Harness {
    fn new() -> Self {
        let mut config = BridgeConfig::default();
        config.diagnostics.sink = SinkKind::Discard;
        let bridge = Bridge::new(config);
        declare_standard(&bridge);
        let mut vm = MockVm::new();
        unsafe { bridge.attach(vm.as_ptr()) };
        Self { vm, bridge }
    }

    fn method(&self, module: &str, class: &str, signature: &str) -> ForeignMethodFn<MockApi> {
        self.bridge
            .bind_foreign_method(module, class, true, signature)
            .unwrap_or_else(|| panic!("{class}.{signature} not declared in {module}"))
    }

    fn math(&mut self, signature: &str, args: &[SlotValue]) -> Result<Option<SlotValue>, String> {
        let method = self.method("math", "Math", signature);
        self.vm.call(method, args)
    }

    fn strings(&mut self, signature: &str, args: &[SlotValue]) -> Result<Option<SlotValue>, String> {
        let method = self.method("strings", "Strings", signature);
        self.vm.call(method, args)
    }

    fn strconv(&mut self, signature: &str, args: &[SlotValue]) -> Result<Option<SlotValue>, String> {
        let method = self.method("strconv", "StrConv", signature);
        self.vm.call(method, args)
    }
}

fn num(n: f64) -> SlotValue {
    SlotValue::Num(n)
}

fn text(s: &str) -> SlotValue {
    SlotValue::from(s)
}

#[test]
fn test_math() {
    let mut h = Harness::new();
    assert_eq!(h.math("sqrt(_)", &[num(9.0)]), Ok(Some(num(3.0))));
    assert_eq!(h.math("pow(_,_)", &[num(2.0), num(10.0)]), Ok(Some(num(1024.0))));
    assert_eq!(h.math("abs(_)", &[num(-4.5)]), Ok(Some(num(4.5))));
    assert_eq!(h.math("max(_,_)", &[num(1.0), num(7.0)]), Ok(Some(num(7.0))));
    assert_eq!(h.math("min(_,_)", &[num(1.0), num(7.0)]), Ok(Some(num(1.0))));
    assert_eq!(h.math("sin(_)", &[num(0.0)]), Ok(Some(num(0.0))));
    assert_eq!(h.math("cos(_)", &[num(0.0)]), Ok(Some(num(1.0))));
    assert_eq!(h.math("pi", &[]), Ok(Some(num(std::f64::consts::PI))));
}

#[test]
fn test_math_rejects_bad_input() {
    let mut h = Harness::new();
    assert_eq!(h.math("sqrt(_)", &[num(-1.0)]), Err("sqrt of negative number".to_string()));
    let err = h.math("abs(_)", &[text("x")]).unwrap_err();
    assert!(err.contains("must be a number"), "{err}");
}

#[test]
fn test_string_transforms() {
    let mut h = Harness::new();
    assert_eq!(h.strings("upper(_)", &[text("héllo")]), Ok(Some(text("HÉLLO"))));
    assert_eq!(h.strings("lower(_)", &[text("MiXeD")]), Ok(Some(text("mixed"))));
    assert_eq!(h.strings("trim(_)", &[text("\t padded \n")]), Ok(Some(text("padded"))));
    assert_eq!(
        h.strings("contains(_,_)", &[text("haystack"), text("st")]),
        Ok(Some(SlotValue::Bool(true)))
    );
    assert_eq!(
        h.strings("contains(_,_)", &[text("haystack"), text("needle")]),
        Ok(Some(SlotValue::Bool(false)))
    );
}

#[test]
fn test_split_returns_a_list() {
    let mut h = Harness::new();
    // Lists are not plain values, so slot 0 reads back as `None`.
    assert_eq!(h.strings("split(_,_)", &[text("a,b,,c"), text(",")]), Ok(None));
    assert_eq!(
        h.vm.list_values(0),
        Some(vec![Some(text("a")), Some(text("b")), Some(text("")), Some(text("c"))])
    );

    h.strings("split(_,_)", &[text("añb"), text("")]).unwrap();
    assert_eq!(
        h.vm.list_values(0),
        Some(vec![Some(text("a")), Some(text("ñ")), Some(text("b"))])
    );
}

#[test]
fn test_join_reads_a_list() {
    let mut h = Harness::new();
    let join = h.method("strings", "Strings", "join(_,_)");
    let result = h.vm.call_with(join, |vm| {
        vm.set_new_list(1);
        for part in ["x", "y", "z"] {
            vm.set_string(3, part);
            vm.insert_in_list(1, -1, 3);
        }
        vm.set_string(2, " - ");
    });
    assert_eq!(result, Ok(Some(text("x - y - z"))));

    let result = h.vm.call_with(join, |vm| {
        vm.set_new_list(1);
        vm.set_double(3, 1.0);
        vm.insert_in_list(1, -1, 3);
        vm.set_string(2, ",");
    });
    assert_eq!(result, Err("join: element 0 is not a string".to_string()));

    assert_eq!(
        h.strings("join(_,_)", &[text("a,b"), text(",")]),
        Err("join expects a list".to_string())
    );
}

#[test]
fn test_strconv_numbers() {
    let mut h = Harness::new();
    assert_eq!(h.strconv("atoi(_)", &[text("-42")]), Ok(Some(num(-42.0))));
    assert_eq!(h.strconv("parseFloat(_)", &[text("2.5")]), Ok(Some(num(2.5))));
    assert_eq!(h.strconv("itoa(_)", &[num(7.9)]), Ok(Some(text("7"))));
    assert_eq!(h.strconv("formatFloat(_,_)", &[num(3.14159), num(3.0)]), Ok(Some(text("3.142"))));

    let err = h.strconv("atoi(_)", &[text("4x")]).unwrap_err();
    assert!(err.starts_with("atoi: parsing \"4x\""), "{err}");
    let err = h.strconv("parseFloat(_)", &[text("")]).unwrap_err();
    assert!(err.starts_with("parseFloat: parsing"), "{err}");
}

#[test]
fn test_strconv_bools() {
    let mut h = Harness::new();
    assert_eq!(h.strconv("parseBool(_)", &[text("T")]), Ok(Some(SlotValue::Bool(true))));
    assert_eq!(h.strconv("parseBool(_)", &[text("0")]), Ok(Some(SlotValue::Bool(false))));
    assert_eq!(
        h.strconv("parseBool(_)", &[text("maybe")]),
        Err("parseBool: parsing \"maybe\": invalid syntax".to_string())
    );
    assert_eq!(h.strconv("formatBool(_)", &[SlotValue::Bool(true)]), Ok(Some(text("true"))));
    assert!(h.strconv("formatBool(_)", &[num(1.0)]).is_err());
}

#[test]
fn test_modules_are_separate() {
    let h = Harness::new();
    assert!(h.bridge.bind_foreign_method("math", "Strings", true, "upper(_)").is_none());
    assert!(h.bridge.bind_foreign_method("strings", "Math", true, "pi").is_none());
    assert!(h.bridge.bind_foreign_method("math", "Math", false, "pi").is_none());
}
