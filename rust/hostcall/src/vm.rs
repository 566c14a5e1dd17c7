//! The native-extension surface of the embedded VM.
//!
//! The bridge never links against a particular VM. Instead the embedder
//! implements [`VmApi`] for its binding: a way to stash one pointer of user
//! data per VM instance, and a way to borrow the [`CallContext`] (the slot
//! array) for the duration of one native call.
//!
//! The function pointer types mirror what a context-free native-extension
//! API accepts: a foreign method receives nothing but the VM handle, and a
//! finalizer receives nothing but the foreign storage pointer.

use std::borrow::Cow;
use std::ffi::{c_char, c_void, CStr};

/// A native method as the VM sees it: a bare function of the VM handle.
pub type ForeignMethodFn<V> = unsafe extern "C" fn(vm: *mut <V as VmApi>::Raw);

/// A finalizer as the VM sees it: a bare function of the foreign storage.
pub type FinalizerFn = unsafe extern "C" fn(data: *mut c_void);

/// Borrow a C string from the VM, replacing invalid UTF-8. Null reads as
/// the empty string.
///
/// # Safety
/// `ptr` must be null or point at a NUL-terminated string that outlives `'a`.
pub(crate) unsafe fn c_str_lossy<'a>(ptr: *const c_char) -> Cow<'a, str> {
    if ptr.is_null() {
        return Cow::Borrowed("");
    }
    CStr::from_ptr(ptr).to_string_lossy()
}

// ---------------------------------------------------------------------------
// VmApi
// ---------------------------------------------------------------------------

/// Binding to one VM implementation.
///
/// # Safety contract
///
/// Implementations must return from [`VmApi::user_data`] exactly the
/// pointer last stored with [`VmApi::set_user_data`] for that VM instance
/// (null before the first store), and [`VmApi::context`] must only be called
/// while the VM is inside a native call on the current thread.
pub trait VmApi: 'static {
    /// Opaque VM handle type passed through native entry points.
    type Raw;

    /// Slot accessor borrowed for one native call.
    type Context<'a>: CallContext;

    /// Read the per-VM user data pointer.
    ///
    /// # Safety
    /// `vm` must be a live VM handle.
    unsafe fn user_data(vm: *mut Self::Raw) -> *mut c_void;

    /// Store the per-VM user data pointer.
    ///
    /// # Safety
    /// `vm` must be a live VM handle.
    unsafe fn set_user_data(vm: *mut Self::Raw, data: *mut c_void);

    /// Borrow the call context of the native call currently running.
    ///
    /// # Safety
    /// `vm` must be a live VM handle that is executing a native call, and the
    /// returned context must not outlive that call.
    unsafe fn context<'a>(vm: *mut Self::Raw) -> Self::Context<'a>;
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

/// Type of the value stored in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    Bool,
    Num,
    Foreign,
    List,
    Map,
    Null,
    String,
    Unknown,
}

/// A plain value that can be moved in and out of a slot without touching
/// VM-managed objects.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl From<bool> for SlotValue {
    fn from(v: bool) -> Self {
        SlotValue::Bool(v)
    }
}

impl From<f64> for SlotValue {
    fn from(v: f64) -> Self {
        SlotValue::Num(v)
    }
}

impl From<i64> for SlotValue {
    fn from(v: i64) -> Self {
        SlotValue::Num(v as f64)
    }
}

impl From<&str> for SlotValue {
    fn from(v: &str) -> Self {
        SlotValue::Str(v.to_string())
    }
}

impl From<String> for SlotValue {
    fn from(v: String) -> Self {
        SlotValue::Str(v)
    }
}

impl<T: Into<SlotValue>> From<Option<T>> for SlotValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SlotValue::Null, Into::into)
    }
}

/// The VM's call frame as seen by a native handler.
///
/// Slot 0 holds the receiver on entry and the return value on exit;
/// arguments follow in slots 1.. .
pub trait CallContext {
    fn slot_count(&self) -> usize;
    fn ensure_slots(&mut self, count: usize);
    fn slot_type(&self, slot: usize) -> SlotType;

    fn get_bool(&self, slot: usize) -> bool;
    fn get_double(&self, slot: usize) -> f64;
    fn get_string(&self, slot: usize) -> String;
    fn get_bytes(&self, slot: usize) -> Vec<u8>;
    /// Pointer to the foreign storage of the object in `slot`.
    fn get_foreign(&self, slot: usize) -> *mut c_void;

    fn set_bool(&mut self, slot: usize, value: bool);
    fn set_double(&mut self, slot: usize, value: f64);
    fn set_string(&mut self, slot: usize, text: &str);
    fn set_bytes(&mut self, slot: usize, bytes: &[u8]);
    fn set_null(&mut self, slot: usize);

    /// Create a foreign object of the class in `class_slot`, store it in
    /// `slot` and return its `size`-byte storage.
    fn set_new_foreign(&mut self, slot: usize, class_slot: usize, size: usize) -> *mut c_void;

    /// Abort the running fiber with the value in `slot` as the error.
    fn abort_fiber(&mut self, slot: usize);

    // --- lists ---
    //
    // Element indices follow the VM: negative values count from the end.

    fn set_new_list(&mut self, slot: usize);
    fn list_count(&self, slot: usize) -> usize;
    /// Copy element `index` of the list in `list_slot` into `element_slot`.
    fn get_list_element(&mut self, list_slot: usize, index: i32, element_slot: usize);
    fn set_list_element(&mut self, list_slot: usize, index: i32, element_slot: usize);
    /// Insert the value in `element_slot` before `index`; `-1` appends.
    fn insert_in_list(&mut self, list_slot: usize, index: i32, element_slot: usize);

    // --- maps ---

    fn set_new_map(&mut self, slot: usize);
    fn map_count(&self, slot: usize) -> usize;
    fn map_contains_key(&self, map_slot: usize, key_slot: usize) -> bool;
    /// Copy the value under the key in `key_slot` into `value_slot`, or null
    /// when the key is absent.
    fn get_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize);
    fn set_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize);
    /// Remove the key in `key_slot`, leaving the removed value (or null) in
    /// `removed_slot`.
    fn remove_map_value(&mut self, map_slot: usize, key_slot: usize, removed_slot: usize);

    // --- module variables ---

    /// Load top-level variable `name` of `module` into `slot`.
    fn get_variable(&mut self, module: &str, name: &str, slot: usize);
    fn has_variable(&self, module: &str, name: &str) -> bool;
    /// Whether `module` has been imported.
    fn has_module(&self, module: &str) -> bool;

    /// Signal a runtime error to the script: the message becomes the fiber's
    /// error value.
    fn raise(&mut self, message: &str) {
        self.ensure_slots(1);
        self.set_string(0, message);
        self.abort_fiber(0);
    }

    /// Read a plain value; `None` for lists, maps, foreign objects and
    /// anything the VM cannot classify.
    fn get_value(&self, slot: usize) -> Option<SlotValue> {
        match self.slot_type(slot) {
            SlotType::Null => Some(SlotValue::Null),
            SlotType::Bool => Some(SlotValue::Bool(self.get_bool(slot))),
            SlotType::Num => Some(SlotValue::Num(self.get_double(slot))),
            SlotType::String => Some(SlotValue::Str(self.get_string(slot))),
            SlotType::Foreign | SlotType::List | SlotType::Map | SlotType::Unknown => None,
        }
    }

    fn set_value(&mut self, slot: usize, value: &SlotValue) {
        match value {
            SlotValue::Null => self.set_null(slot),
            SlotValue::Bool(b) => self.set_bool(slot, *b),
            SlotValue::Num(n) => self.set_double(slot, *n),
            SlotValue::Str(s) => self.set_string(slot, s),
            SlotValue::Bytes(b) => self.set_bytes(slot, b),
        }
    }
}

impl<C: CallContext + ?Sized> CallContext for &mut C {
    fn slot_count(&self) -> usize {
        (**self).slot_count()
    }
    fn ensure_slots(&mut self, count: usize) {
        (**self).ensure_slots(count)
    }
    fn slot_type(&self, slot: usize) -> SlotType {
        (**self).slot_type(slot)
    }
    fn get_bool(&self, slot: usize) -> bool {
        (**self).get_bool(slot)
    }
    fn get_double(&self, slot: usize) -> f64 {
        (**self).get_double(slot)
    }
    fn get_string(&self, slot: usize) -> String {
        (**self).get_string(slot)
    }
    fn get_bytes(&self, slot: usize) -> Vec<u8> {
        (**self).get_bytes(slot)
    }
    fn get_foreign(&self, slot: usize) -> *mut c_void {
        (**self).get_foreign(slot)
    }
    fn set_bool(&mut self, slot: usize, value: bool) {
        (**self).set_bool(slot, value)
    }
    fn set_double(&mut self, slot: usize, value: f64) {
        (**self).set_double(slot, value)
    }
    fn set_string(&mut self, slot: usize, text: &str) {
        (**self).set_string(slot, text)
    }
    fn set_bytes(&mut self, slot: usize, bytes: &[u8]) {
        (**self).set_bytes(slot, bytes)
    }
    fn set_null(&mut self, slot: usize) {
        (**self).set_null(slot)
    }
    fn set_new_foreign(&mut self, slot: usize, class_slot: usize, size: usize) -> *mut c_void {
        (**self).set_new_foreign(slot, class_slot, size)
    }
    fn abort_fiber(&mut self, slot: usize) {
        (**self).abort_fiber(slot)
    }
    fn set_new_list(&mut self, slot: usize) {
        (**self).set_new_list(slot)
    }
    fn list_count(&self, slot: usize) -> usize {
        (**self).list_count(slot)
    }
    fn get_list_element(&mut self, list_slot: usize, index: i32, element_slot: usize) {
        (**self).get_list_element(list_slot, index, element_slot)
    }
    fn set_list_element(&mut self, list_slot: usize, index: i32, element_slot: usize) {
        (**self).set_list_element(list_slot, index, element_slot)
    }
    fn insert_in_list(&mut self, list_slot: usize, index: i32, element_slot: usize) {
        (**self).insert_in_list(list_slot, index, element_slot)
    }
    fn set_new_map(&mut self, slot: usize) {
        (**self).set_new_map(slot)
    }
    fn map_count(&self, slot: usize) -> usize {
        (**self).map_count(slot)
    }
    fn map_contains_key(&self, map_slot: usize, key_slot: usize) -> bool {
        (**self).map_contains_key(map_slot, key_slot)
    }
    fn get_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize) {
        (**self).get_map_value(map_slot, key_slot, value_slot)
    }
    fn set_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize) {
        (**self).set_map_value(map_slot, key_slot, value_slot)
    }
    fn remove_map_value(&mut self, map_slot: usize, key_slot: usize, removed_slot: usize) {
        (**self).remove_map_value(map_slot, key_slot, removed_slot)
    }
    fn get_variable(&mut self, module: &str, name: &str, slot: usize) {
        (**self).get_variable(module, name, slot)
    }
    fn has_variable(&self, module: &str, name: &str) -> bool {
        (**self).has_variable(module, name)
    }
    fn has_module(&self, module: &str) -> bool {
        (**self).has_module(module)
    }
}
