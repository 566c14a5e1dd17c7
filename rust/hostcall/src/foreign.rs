//! Host-backed foreign objects.
//!
//! The VM owns a foreign object's identity and decides when it dies; the
//! host owns the value behind it. The two are joined by a [`ForeignCell`]
//! written into the VM-side storage: a weak link back to the per-VM
//! [`ForeignHeap`] plus a generational [`NativeHandle`] into it.
//!
//! Lifecycle of one record: `Unallocated → Allocated → Finalized`. A handle
//! whose generation no longer matches its entry is stale, so use after
//! finalize and repeated finalize are detected instead of double-freeing.

use std::any::{type_name, Any};
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::fmt;
use std::mem::{self, ManuallyDrop};
use std::panic::AssertUnwindSafe;
use std::ptr;
use std::rc::{Rc, Weak};

use tracing::{debug, error, warn};

use crate::boundary::catch_panic;
use crate::error::{BridgeError, HandlerError};
use crate::vm::{CallContext, SlotType};

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle {
    index: u32,
    generation: u32,
}

impl NativeHandle {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Unallocated,
    Allocated,
    Finalized,
}

// ---------------------------------------------------------------------------
// ForeignClass
// ---------------------------------------------------------------------------

type Allocator = dyn Fn(&mut dyn CallContext) -> Result<Box<dyn Any>, HandlerError>;
type FinalizeHook = dyn Fn(Box<dyn Any>);

/// Descriptor for one foreign class: how to build its host value and what to
/// run when the VM collects an instance.
#[derive(Clone)]
pub struct ForeignClass {
    name: Rc<str>,
    value_type: &'static str,
    allocate: Rc<Allocator>,
    finalize: Option<Rc<FinalizeHook>>,
}

impl ForeignClass {
    /// Class whose instances hold a `T` built by `allocate`. The value is
    /// dropped when the instance is collected.
    pub fn new<T, A>(name: impl Into<Rc<str>>, allocate: A) -> Self
    where
        T: 'static,
        A: Fn(&mut dyn CallContext) -> Result<T, HandlerError> + 'static,
    {
        Self {
            name: name.into(),
            value_type: type_name::<T>(),
            allocate: Rc::new(move |ctx: &mut dyn CallContext| {
                allocate(ctx).map(|v| Box::new(v) as Box<dyn Any>)
            }),
            finalize: None,
        }
    }

    /// Like [`ForeignClass::new`], with `finalize` receiving the value when
    /// the instance is collected. The hook runs inside the VM's collection
    /// pass and must not call back into the VM.
    pub fn with_finalizer<T, A, F>(name: impl Into<Rc<str>>, allocate: A, finalize: F) -> Self
    where
        T: 'static,
        A: Fn(&mut dyn CallContext) -> Result<T, HandlerError> + 'static,
        F: Fn(T) + 'static,
    {
        let mut class = Self::new(name, allocate);
        class.finalize = Some(Rc::new(move |value: Box<dyn Any>| {
            if let Ok(value) = value.downcast::<T>() {
                finalize(*value);
            }
        }));
        class
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ForeignClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignClass")
            .field("name", &self.name)
            .field("value_type", &self.value_type)
            .field("finalizer", &self.finalize.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ForeignHeap
// ---------------------------------------------------------------------------

/// A host value shared between its slab entry and any `with` call in
/// progress. A finalizer that finds the value borrowed is parked in
/// `deferred` and runs when the last reference goes away.
struct Held {
    value: RefCell<Option<Box<dyn Any>>>,
    deferred: RefCell<Option<Deferred>>,
}

struct Deferred {
    class: Rc<str>,
    handle: NativeHandle,
    hook: Rc<FinalizeHook>,
    collecting: Rc<Cell<bool>>,
}

impl Held {
    fn new(value: Box<dyn Any>) -> Self {
        Self {
            value: RefCell::new(Some(value)),
            deferred: RefCell::new(None),
        }
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        let Some(deferred) = self.deferred.get_mut().take() else {
            return;
        };
        let Some(value) = self.value.get_mut().take() else {
            return;
        };
        let Deferred {
            class,
            handle,
            hook,
            collecting,
        } = deferred;
        let was_collecting = collecting.replace(true);
        let outcome = catch_panic(AssertUnwindSafe(|| (*hook)(value)));
        collecting.set(was_collecting);
        match outcome {
            Ok(()) => debug!(%class, %handle, "ran deferred foreign finalizer"),
            Err(panic) => error!(%class, %handle, error = %panic, "deferred foreign finalizer failed"),
        }
    }
}

type Released = (Rc<str>, Rc<Held>, Option<Rc<FinalizeHook>>);

enum Entry {
    Live {
        generation: u32,
        class: Rc<str>,
        value: Rc<Held>,
        finalize: Option<Rc<FinalizeHook>>,
    },
    Free {
        generation: u32,
    },
    /// Generation space used up; the index is never handed out again.
    Retired,
}

impl Entry {
    fn generation(&self) -> u32 {
        match self {
            Entry::Live { generation, .. } | Entry::Free { generation } => *generation,
            Entry::Retired => u32::MAX,
        }
    }
}

#[derive(Default)]
struct Slab {
    entries: Vec<Entry>,
    free: Vec<u32>,
    live: usize,
}

/// Per-VM table of host values backing foreign objects.
///
/// Borrows of the table never span host code: allocators run before a record
/// is inserted, finalizer hooks after it is removed, and typed access borrows
/// only the individual value.
pub struct ForeignHeap {
    slab: RefCell<Slab>,
    collecting: Rc<Cell<bool>>,
}

impl ForeignHeap {
    /// `collecting` is raised for the duration of every finalize; the router
    /// refuses registrations while it is set.
    pub fn new(collecting: Rc<Cell<bool>>) -> Self {
        Self {
            slab: RefCell::new(Slab::default()),
            collecting,
        }
    }

    /// Build an instance of `class` for the object under construction in
    /// slot 0.
    ///
    /// The host value is created first; only then is VM storage requested,
    /// so a failing allocator leaves no half-built object behind. If the VM
    /// refuses storage the value is finalized like any other.
    pub fn allocate(
        self: &Rc<Self>,
        class: &ForeignClass,
        ctx: &mut dyn CallContext,
    ) -> Result<NativeHandle, BridgeError> {
        let value = match catch_panic(AssertUnwindSafe(|| (class.allocate)(&mut *ctx))) {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                return Err(BridgeError::LifecycleFault(format!(
                    "allocating {}: {err}",
                    class.name
                )))
            }
            Err(panic) => {
                return Err(BridgeError::LifecycleFault(format!(
                    "allocating {}: {panic}",
                    class.name
                )))
            }
        };
        let handle = self.insert(class, value)?;

        let storage = ctx.set_new_foreign(0, 0, mem::size_of::<ForeignCell>());
        if storage.is_null() {
            if let Err(err) = self.finalize(handle) {
                warn!(class = %class.name, %handle, error = %err, "finalizing unstored foreign value failed");
            }
            return Err(BridgeError::LifecycleFault(format!(
                "VM refused storage for {}",
                class.name
            )));
        }
        let cell = ForeignCell {
            heap: Some(Rc::downgrade(self)),
            handle,
        };
        // SAFETY: the VM handed out `size_of::<ForeignCell>()` fresh bytes.
        unsafe { ptr::write_unaligned(storage.cast::<ForeignCell>(), cell) };
        debug!(class = %class.name, %handle, "allocated foreign object");
        Ok(handle)
    }

    fn insert(&self, class: &ForeignClass, value: Box<dyn Any>) -> Result<NativeHandle, BridgeError> {
        let mut slab = self.slab.borrow_mut();
        let live = |generation| Entry::Live {
            generation,
            class: Rc::clone(&class.name),
            value: Rc::new(Held::new(value)),
            finalize: class.finalize.clone(),
        };
        let handle = match slab.free.pop() {
            Some(index) => {
                let generation = slab.entries[index as usize].generation();
                slab.entries[index as usize] = live(generation);
                NativeHandle { index, generation }
            }
            None => {
                let index = u32::try_from(slab.entries.len())
                    .map_err(|_| BridgeError::LifecycleFault("foreign heap is full".to_string()))?;
                slab.entries.push(live(0));
                NativeHandle {
                    index,
                    generation: 0,
                }
            }
        };
        slab.live += 1;
        Ok(handle)
    }

    /// Detach the entry for `handle`, advancing its generation. An entry
    /// whose generation cannot advance is retired instead of reused.
    fn release(&self, handle: NativeHandle) -> Result<Released, BridgeError> {
        let mut slab = self.slab.borrow_mut();
        let entry = slab
            .entries
            .get_mut(handle.index as usize)
            .filter(|e| matches!(e, Entry::Live { generation, .. } if *generation == handle.generation))
            .ok_or(BridgeError::StaleHandle(handle))?;
        let next = handle.generation.checked_add(1);
        let freed = match next {
            Some(generation) => Entry::Free { generation },
            None => Entry::Retired,
        };
        let Entry::Live {
            class,
            value,
            finalize,
            ..
        } = mem::replace(entry, freed)
        else {
            unreachable!("entry checked live above");
        };
        match next {
            Some(_) => slab.free.push(handle.index),
            None => debug!(%handle, "retiring foreign slot"),
        }
        slab.live -= 1;
        Ok((class, value, finalize))
    }

    /// Release the host value behind `handle` and run the class finalizer.
    ///
    /// Runs inside the VM's collection pass: registrations are refused until
    /// it returns, and nothing here calls back into the VM. A value still
    /// borrowed by a running method is finalized when that borrow ends.
    pub fn finalize(&self, handle: NativeHandle) -> Result<(), BridgeError> {
        let was_collecting = self.collecting.replace(true);
        let result = self.finalize_inner(handle);
        self.collecting.set(was_collecting);
        result
    }

    fn finalize_inner(&self, handle: NativeHandle) -> Result<(), BridgeError> {
        let (class, held, finalize) = self.release(handle)?;
        let Some(hook) = finalize else {
            drop(held);
            debug!(%class, %handle, "finalized foreign object");
            return Ok(());
        };
        match Rc::try_unwrap(held) {
            Ok(held) => {
                let value = held.value.borrow_mut().take();
                if let Some(value) = value {
                    catch_panic(AssertUnwindSafe(|| (*hook)(value))).map_err(|panic| {
                        BridgeError::LifecycleFault(format!("finalizing {class}: {panic}"))
                    })?;
                }
                debug!(%class, %handle, "finalized foreign object");
            }
            Err(shared) => {
                debug!(%class, %handle, "foreign value still borrowed; finalizer deferred");
                *shared.deferred.borrow_mut() = Some(Deferred {
                    class,
                    handle,
                    hook,
                    collecting: Rc::clone(&self.collecting),
                });
            }
        }
        Ok(())
    }

    pub fn state(&self, handle: NativeHandle) -> RecordState {
        let slab = self.slab.borrow();
        match slab.entries.get(handle.index as usize) {
            None => RecordState::Unallocated,
            Some(Entry::Live { generation, .. }) if *generation == handle.generation => {
                RecordState::Allocated
            }
            Some(Entry::Retired) => RecordState::Finalized,
            Some(entry) if handle.generation < entry.generation() => RecordState::Finalized,
            Some(_) => RecordState::Unallocated,
        }
    }

    /// Run `f` on the live value behind `handle`.
    pub fn with<T: 'static, R>(
        &self,
        handle: NativeHandle,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, BridgeError> {
        let held = {
            let slab = self.slab.borrow();
            match slab.entries.get(handle.index as usize) {
                Some(Entry::Live {
                    generation, value, ..
                }) if *generation == handle.generation => Rc::clone(value),
                _ => return Err(BridgeError::StaleHandle(handle)),
            }
        };
        let mut slot = held.value.try_borrow_mut().map_err(|_| {
            BridgeError::LifecycleFault(format!("foreign object {handle} is already borrowed"))
        })?;
        let boxed = slot.as_mut().ok_or(BridgeError::StaleHandle(handle))?;
        let typed = (**boxed)
            .downcast_mut::<T>()
            .ok_or(BridgeError::ForeignTypeMismatch {
                expected: type_name::<T>(),
            })?;
        let result = f(typed);
        drop(slot);
        Ok(result)
    }

    /// Number of records currently allocated.
    pub fn live(&self) -> usize {
        self.slab.borrow().live
    }

    pub fn class_of(&self, handle: NativeHandle) -> Option<String> {
        match self.slab.borrow().entries.get(handle.index as usize) {
            Some(Entry::Live {
                generation, class, ..
            }) if *generation == handle.generation => Some(class.to_string()),
            _ => None,
        }
    }
}

impl fmt::Debug for ForeignHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slab = self.slab.borrow();
        f.debug_struct("ForeignHeap")
            .field("live", &slab.live)
            .field("capacity", &slab.entries.len())
            .finish()
    }
}

impl Drop for ForeignHeap {
    fn drop(&mut self) {
        let live = self.slab.get_mut().live;
        if live > 0 {
            debug!(live, "dropping foreign heap with uncollected objects");
        }
    }
}

// ---------------------------------------------------------------------------
// VM-side storage
// ---------------------------------------------------------------------------

/// Contents of the VM-owned storage of every foreign object.
#[repr(C)]
pub struct ForeignCell {
    heap: Option<Weak<ForeignHeap>>,
    handle: NativeHandle,
}

/// Read the cell without taking ownership of its heap link.
///
/// # Safety
/// `data` must point at storage written by [`ForeignHeap::allocate`].
unsafe fn peek_cell(data: *mut c_void) -> (Option<Rc<ForeignHeap>>, NativeHandle) {
    let cell = ManuallyDrop::new(ptr::read_unaligned(data.cast::<ForeignCell>()));
    (cell.heap.as_ref().and_then(Weak::upgrade), cell.handle)
}

/// Handle of the foreign object in `slot`.
pub fn handle_of(ctx: &dyn CallContext, slot: usize) -> Result<NativeHandle, BridgeError> {
    locate(ctx, slot).map(|(_, handle)| handle)
}

fn locate(ctx: &dyn CallContext, slot: usize) -> Result<(Rc<ForeignHeap>, NativeHandle), BridgeError> {
    if ctx.slot_type(slot) != SlotType::Foreign {
        return Err(BridgeError::LifecycleFault(format!(
            "slot {slot} does not hold a foreign object"
        )));
    }
    let data = ctx.get_foreign(slot);
    if data.is_null() {
        return Err(BridgeError::LifecycleFault(format!(
            "slot {slot} has no foreign storage"
        )));
    }
    // SAFETY: foreign objects of bridged classes all carry a ForeignCell.
    match unsafe { peek_cell(data) } {
        (Some(heap), handle) => Ok((heap, handle)),
        (None, handle) => Err(BridgeError::StaleHandle(handle)),
    }
}

/// Run `f` on the host value of the foreign object in `slot`.
pub fn with_foreign<T: 'static, R>(
    ctx: &dyn CallContext,
    slot: usize,
    f: impl FnOnce(&mut T) -> R,
) -> Result<R, BridgeError> {
    let (heap, handle) = locate(ctx, slot)?;
    heap.with(handle, f)
}

/// Finalizer handed to the VM for every bridged foreign class.
///
/// The storage pointer carries its own context, so one entry serves all
/// classes. The heap link is taken out of the cell on the first call; a
/// second call for the same storage finds it empty and is logged.
///
/// # Safety
/// `data` must be null or point at storage written by
/// [`ForeignHeap::allocate`].
pub unsafe extern "C" fn finalize_entry(data: *mut c_void) {
    if data.is_null() {
        error!("finalizer called with null storage");
        return;
    }
    let cell_ptr = data.cast::<ForeignCell>();
    let mut cell = ptr::read_unaligned(cell_ptr);
    let link = cell.heap.take();
    let handle = cell.handle;
    ptr::write_unaligned(cell_ptr, cell);

    let Some(link) = link else {
        error!(%handle, "finalizer ran twice for the same foreign object");
        return;
    };
    let Some(heap) = link.upgrade() else {
        warn!(%handle, "finalizer ran after its bridge was dropped");
        return;
    };
    if let Err(err) = heap.finalize(handle) {
        error!(%handle, error = %err, "foreign finalizer failed");
    }
}
