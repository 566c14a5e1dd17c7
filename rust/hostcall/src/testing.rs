//! An in-process VM double.
//!
//! [`MockVm`] keeps a slot array, a user-data pointer, a fiber error, lists,
//! maps, module variables and foreign objects with real, separately
//! allocated storage. It calls entry points the way a VM would: slot 0
//! receiver, arguments after it, and finalizers run when objects are
//! collected or the VM is freed.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::{self, NonNull};

use crate::bridge::ForeignClassMethods;
use crate::vm::{CallContext, FinalizerFn, ForeignMethodFn, SlotType, SlotValue, VmApi};

/// [`VmApi`] binding for [`MockVm`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MockApi;

impl VmApi for MockApi {
    type Raw = MockVm;
    type Context<'a> = &'a mut MockVm;

    unsafe fn user_data(vm: *mut MockVm) -> *mut c_void {
        (*vm).user_data
    }

    unsafe fn set_user_data(vm: *mut MockVm, data: *mut c_void) {
        (*vm).user_data = data;
    }

    unsafe fn context<'a>(vm: *mut MockVm) -> &'a mut MockVm {
        &mut *vm
    }
}

/// A foreign object created by [`MockVm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(usize);

#[derive(Debug, Clone, PartialEq)]
enum MockValue {
    Plain(SlotValue),
    Foreign(ObjectId),
    List(usize),
    Map(usize),
}

const NULL: MockValue = MockValue::Plain(SlotValue::Null);

/// Resolve a VM-style element index against `count`; `None` when out of
/// range.
fn resolve_index(index: i32, count: usize) -> Option<usize> {
    let index = i64::from(index);
    let count = count as i64;
    let resolved = if index < 0 { count + index } else { index };
    (0..count).contains(&resolved).then_some(resolved as usize)
}

struct MockObject {
    storage: NonNull<u64>,
    words: usize,
    finalizer: Option<FinalizerFn>,
    reachable: bool,
    finalized: bool,
}

impl MockObject {
    fn new(size: usize, finalizer: Option<FinalizerFn>) -> Self {
        let words = size.div_ceil(8).max(1);
        let raw = Box::into_raw(vec![0u64; words].into_boxed_slice());
        Self {
            // SAFETY: Box::into_raw never returns null.
            storage: unsafe { NonNull::new_unchecked(raw.cast::<u64>()) },
            words,
            finalizer,
            reachable: true,
            finalized: false,
        }
    }

    fn data(&self) -> *mut c_void {
        self.storage.as_ptr().cast()
    }
}

impl Drop for MockObject {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` as a boxed slice of `words` elements.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.storage.as_ptr(),
                self.words,
            )))
        };
    }
}

pub struct MockVm {
    user_data: *mut c_void,
    slots: Vec<MockValue>,
    fiber_error: Option<String>,
    objects: Vec<MockObject>,
    pending_finalizer: Option<FinalizerFn>,
    refuse_storage: bool,
    lists: Vec<Vec<MockValue>>,
    maps: Vec<Vec<(MockValue, MockValue)>>,
    modules: HashMap<String, HashMap<String, MockValue>>,
}

impl MockVm {
    pub fn new() -> Self {
        Self::with_slots(0)
    }

    pub fn with_slots(count: usize) -> Self {
        Self {
            user_data: ptr::null_mut(),
            slots: vec![NULL; count],
            fiber_error: None,
            objects: Vec::new(),
            pending_finalizer: None,
            refuse_storage: false,
            lists: Vec::new(),
            maps: Vec::new(),
            modules: HashMap::new(),
        }
    }

    /// Make `set_new_foreign` fail from now on, as a VM out of memory would.
    pub fn refuse_storage(&mut self, refuse: bool) {
        self.refuse_storage = refuse;
    }

    /// Define top-level variable `name` in `module`, importing the module.
    pub fn define_variable(&mut self, module: &str, name: &str, value: SlotValue) {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), MockValue::Plain(value));
    }

    /// Plain elements of the list in `slot`; lists, maps and foreign
    /// objects nested inside read as `None`.
    pub fn list_values(&self, slot: usize) -> Option<Vec<Option<SlotValue>>> {
        match self.slot(slot) {
            MockValue::List(id) => Some(
                self.lists[*id]
                    .iter()
                    .map(|v| match v {
                        MockValue::Plain(plain) => Some(plain.clone()),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Handle to pass to entry points and [`crate::Bridge::attach`].
    pub fn as_ptr(&mut self) -> *mut MockVm {
        self
    }

    /// Error the last call aborted its fiber with.
    pub fn fiber_error(&self) -> Option<&str> {
        self.fiber_error.as_deref()
    }

    /// Foreign objects created so far, collected or not.
    pub fn foreign_count(&self) -> usize {
        self.objects.len()
    }

    /// Call a static method: null receiver, `args` in slots 1.. .
    pub fn call(&mut self, method: ForeignMethodFn<MockApi>, args: &[SlotValue]) -> Result<Option<SlotValue>, String> {
        self.load(NULL, args);
        self.run(method)
    }

    /// Call an instance method on `receiver`.
    pub fn call_on(
        &mut self,
        receiver: ObjectId,
        method: ForeignMethodFn<MockApi>,
        args: &[SlotValue],
    ) -> Result<Option<SlotValue>, String> {
        self.load(MockValue::Foreign(receiver), args);
        self.run(method)
    }

    /// Call a static method whose arguments `fill` writes through the slot
    /// API, for arguments that are lists or maps.
    pub fn call_with(
        &mut self,
        method: ForeignMethodFn<MockApi>,
        fill: impl FnOnce(&mut MockVm),
    ) -> Result<Option<SlotValue>, String> {
        self.load(NULL, &[]);
        fill(self);
        self.run(method)
    }

    /// Construct an instance of a foreign class the way the VM does: run the
    /// allocator with the constructor arguments and pick the new object out
    /// of slot 0.
    pub fn construct(&mut self, class: &ForeignClassMethods<MockApi>, args: &[SlotValue]) -> Result<ObjectId, String> {
        let Some(allocate) = class.allocate else {
            return Err("class has no allocator".to_string());
        };
        self.load(NULL, args);
        self.pending_finalizer = class.finalize;
        let outcome = self.run(allocate);
        self.pending_finalizer = None;
        outcome?;
        match self.slots.first() {
            Some(MockValue::Foreign(id)) => Ok(*id),
            _ => Err("allocator did not create a foreign object".to_string()),
        }
    }

    /// Drop the script's last reference to `id`.
    pub fn release(&mut self, id: ObjectId) {
        if let Some(object) = self.objects.get_mut(id.0) {
            object.reachable = false;
        }
    }

    /// Finalize every unreachable object; returns how many were finalized.
    pub fn collect(&mut self) -> usize {
        let mut finalized = 0;
        for index in 0..self.objects.len() {
            let object = &mut self.objects[index];
            if object.reachable || object.finalized {
                continue;
            }
            object.finalized = true;
            let (data, finalizer) = (object.data(), object.finalizer);
            if let Some(finalizer) = finalizer {
                // SAFETY: `data` is the storage this finalizer was paired with.
                unsafe { finalizer(data) };
            }
            finalized += 1;
        }
        finalized
    }

    /// Tear down like the VM's free: every remaining object is finalized.
    pub fn free(&mut self) -> usize {
        for object in &mut self.objects {
            object.reachable = false;
        }
        self.collect()
    }

    pub fn is_finalized(&self, id: ObjectId) -> bool {
        self.objects.get(id.0).is_some_and(|o| o.finalized)
    }

    fn load(&mut self, receiver: MockValue, args: &[SlotValue]) {
        self.fiber_error = None;
        self.slots.clear();
        self.slots.push(receiver);
        self.slots.extend(args.iter().cloned().map(MockValue::Plain));
    }

    fn run(&mut self, method: ForeignMethodFn<MockApi>) -> Result<Option<SlotValue>, String> {
        // SAFETY: `self` is a live VM handle for the duration of the call.
        unsafe { method(self as *mut MockVm) };
        match &self.fiber_error {
            Some(message) => Err(message.clone()),
            None => Ok(self.get_value(0)),
        }
    }

    fn slot(&self, slot: usize) -> &MockValue {
        self.slots
            .get(slot)
            .unwrap_or_else(|| panic!("slot {slot} out of range ({} slots)", self.slots.len()))
    }

    fn put(&mut self, slot: usize, value: MockValue) {
        self.ensure_slots(slot + 1);
        self.slots[slot] = value;
    }

    fn list_id(&self, slot: usize) -> usize {
        match self.slot(slot) {
            MockValue::List(id) => *id,
            other => panic!("slot {slot} holds {other:?}, not a list"),
        }
    }

    fn map_id(&self, slot: usize) -> usize {
        match self.slot(slot) {
            MockValue::Map(id) => *id,
            other => panic!("slot {slot} holds {other:?}, not a map"),
        }
    }

    fn map_position(&self, map_slot: usize, key_slot: usize) -> Option<usize> {
        let key = self.slot(key_slot);
        self.maps[self.map_id(map_slot)].iter().position(|(k, _)| k == key)
    }
}

impl Default for MockVm {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MockVm {
    fn drop(&mut self) {
        self.free();
    }
}

impl CallContext for MockVm {
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn ensure_slots(&mut self, count: usize) {
        if self.slots.len() < count {
            self.slots.resize(count, NULL);
        }
    }

    fn slot_type(&self, slot: usize) -> SlotType {
        match self.slot(slot) {
            MockValue::Foreign(_) => SlotType::Foreign,
            MockValue::List(_) => SlotType::List,
            MockValue::Map(_) => SlotType::Map,
            MockValue::Plain(SlotValue::Null) => SlotType::Null,
            MockValue::Plain(SlotValue::Bool(_)) => SlotType::Bool,
            MockValue::Plain(SlotValue::Num(_)) => SlotType::Num,
            MockValue::Plain(SlotValue::Str(_) | SlotValue::Bytes(_)) => SlotType::String,
        }
    }

    fn get_bool(&self, slot: usize) -> bool {
        match self.slot(slot) {
            MockValue::Plain(SlotValue::Bool(b)) => *b,
            other => panic!("slot {slot} holds {other:?}, not a bool"),
        }
    }

    fn get_double(&self, slot: usize) -> f64 {
        match self.slot(slot) {
            MockValue::Plain(SlotValue::Num(n)) => *n,
            other => panic!("slot {slot} holds {other:?}, not a number"),
        }
    }

    fn get_string(&self, slot: usize) -> String {
        match self.slot(slot) {
            MockValue::Plain(SlotValue::Str(s)) => s.clone(),
            MockValue::Plain(SlotValue::Bytes(b)) => String::from_utf8_lossy(b).into_owned(),
            other => panic!("slot {slot} holds {other:?}, not a string"),
        }
    }

    fn get_bytes(&self, slot: usize) -> Vec<u8> {
        match self.slot(slot) {
            MockValue::Plain(SlotValue::Str(s)) => s.as_bytes().to_vec(),
            MockValue::Plain(SlotValue::Bytes(b)) => b.clone(),
            other => panic!("slot {slot} holds {other:?}, not a string"),
        }
    }

    fn get_foreign(&self, slot: usize) -> *mut c_void {
        match self.slot(slot) {
            MockValue::Foreign(id) => self.objects[id.0].data(),
            _ => ptr::null_mut(),
        }
    }

    fn set_bool(&mut self, slot: usize, value: bool) {
        self.put(slot, MockValue::Plain(SlotValue::Bool(value)));
    }

    fn set_double(&mut self, slot: usize, value: f64) {
        self.put(slot, MockValue::Plain(SlotValue::Num(value)));
    }

    fn set_string(&mut self, slot: usize, text: &str) {
        self.put(slot, MockValue::Plain(SlotValue::Str(text.to_string())));
    }

    fn set_bytes(&mut self, slot: usize, bytes: &[u8]) {
        self.put(slot, MockValue::Plain(SlotValue::Bytes(bytes.to_vec())));
    }

    fn set_null(&mut self, slot: usize) {
        self.put(slot, MockValue::Plain(SlotValue::Null));
    }

    fn set_new_foreign(&mut self, slot: usize, _class_slot: usize, size: usize) -> *mut c_void {
        if self.refuse_storage {
            return ptr::null_mut();
        }
        let object = MockObject::new(size, self.pending_finalizer);
        let data = object.data();
        let id = ObjectId(self.objects.len());
        self.objects.push(object);
        self.put(slot, MockValue::Foreign(id));
        data
    }

    fn abort_fiber(&mut self, slot: usize) {
        let message = match self.slot(slot) {
            MockValue::Plain(SlotValue::Str(s)) => s.clone(),
            other => format!("{other:?}"),
        };
        self.fiber_error = Some(message);
    }

    fn set_new_list(&mut self, slot: usize) {
        self.lists.push(Vec::new());
        self.put(slot, MockValue::List(self.lists.len() - 1));
    }

    fn list_count(&self, slot: usize) -> usize {
        self.lists[self.list_id(slot)].len()
    }

    fn get_list_element(&mut self, list_slot: usize, index: i32, element_slot: usize) {
        let list = &self.lists[self.list_id(list_slot)];
        let at = resolve_index(index, list.len())
            .unwrap_or_else(|| panic!("list index {index} out of bounds ({} elements)", list.len()));
        let value = list[at].clone();
        self.put(element_slot, value);
    }

    fn set_list_element(&mut self, list_slot: usize, index: i32, element_slot: usize) {
        let value = self.slot(element_slot).clone();
        let id = self.list_id(list_slot);
        let list = &mut self.lists[id];
        let at = resolve_index(index, list.len())
            .unwrap_or_else(|| panic!("list index {index} out of bounds ({} elements)", list.len()));
        list[at] = value;
    }

    fn insert_in_list(&mut self, list_slot: usize, index: i32, element_slot: usize) {
        let value = self.slot(element_slot).clone();
        let id = self.list_id(list_slot);
        let list = &mut self.lists[id];
        // One past the end is a valid position, so -1 appends.
        let at = resolve_index(index, list.len() + 1)
            .unwrap_or_else(|| panic!("insert index {index} out of bounds ({} elements)", list.len()));
        list.insert(at, value);
    }

    fn set_new_map(&mut self, slot: usize) {
        self.maps.push(Vec::new());
        self.put(slot, MockValue::Map(self.maps.len() - 1));
    }

    fn map_count(&self, slot: usize) -> usize {
        self.maps[self.map_id(slot)].len()
    }

    fn map_contains_key(&self, map_slot: usize, key_slot: usize) -> bool {
        self.map_position(map_slot, key_slot).is_some()
    }

    fn get_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize) {
        let value = match self.map_position(map_slot, key_slot) {
            Some(at) => {
                let id = self.map_id(map_slot);
                self.maps[id][at].1.clone()
            }
            None => NULL,
        };
        self.put(value_slot, value);
    }

    fn set_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize) {
        let key = self.slot(key_slot).clone();
        let value = self.slot(value_slot).clone();
        let position = self.map_position(map_slot, key_slot);
        let id = self.map_id(map_slot);
        let map = &mut self.maps[id];
        match position {
            Some(at) => map[at].1 = value,
            None => map.push((key, value)),
        }
    }

    fn remove_map_value(&mut self, map_slot: usize, key_slot: usize, removed_slot: usize) {
        let removed = match self.map_position(map_slot, key_slot) {
            Some(at) => {
                let id = self.map_id(map_slot);
                self.maps[id].remove(at).1
            }
            None => NULL,
        };
        self.put(removed_slot, removed);
    }

    fn get_variable(&mut self, module: &str, name: &str, slot: usize) {
        let value = self
            .modules
            .get(module)
            .and_then(|vars| vars.get(name))
            .cloned()
            .unwrap_or_else(|| panic!("no variable {name} in module {module}"));
        self.put(slot, value);
    }

    fn has_variable(&self, module: &str, name: &str) -> bool {
        self.modules.get(module).is_some_and(|vars| vars.contains_key(name))
    }

    fn has_module(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }
}
