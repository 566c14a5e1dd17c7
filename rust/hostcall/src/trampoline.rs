//! Fixed table of native entry points.
//!
//! The VM only accepts bare `extern "C"` functions for native methods, so
//! the identity of the host handler has to live in the function address
//! itself. The build script emits one entry per ordinal in `0..TABLE_SIZE`;
//! an entry does nothing but hand its ordinal to [`router::dispatch`].
//!
//! The table size is fixed when the crate is built. Running out of ordinals
//! is a registration-time error, never a wrap-around.

use std::fmt;

use crate::error::BridgeError;
use crate::router;
use crate::vm::{ForeignMethodFn, VmApi};

include!(concat!(env!("OUT_DIR"), "/trampolines.rs"));

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

/// Ordinal identity of one trampoline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(u16);

impl Slot {
    pub const fn new(ordinal: u16) -> Self {
        Slot(ordinal)
    }

    pub const fn ordinal(self) -> u16 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

unsafe extern "C" fn trampoline<V: VmApi, const SLOT: u16>(vm: *mut V::Raw) {
    router::dispatch::<V>(vm, Slot(SLOT));
}

/// The native entry point bound to `slot`, or `None` past the table end.
pub fn entry<V: VmApi>(slot: Slot) -> Option<ForeignMethodFn<V>> {
    lookup::<V>(slot.0)
}

// ---------------------------------------------------------------------------
// SlotCursor
// ---------------------------------------------------------------------------

/// Hands out ordinals in increasing order until the table is used up.
#[derive(Debug, Clone)]
pub struct SlotCursor {
    next: usize,
    capacity: usize,
}

impl SlotCursor {
    /// Cursor over the whole table.
    pub fn new() -> Self {
        Self::with_capacity(TABLE_SIZE)
    }

    /// Cursor over the first `capacity` ordinals.
    ///
    /// # Panics
    /// Panics if `capacity` exceeds [`TABLE_SIZE`].
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity <= TABLE_SIZE,
            "capacity {capacity} exceeds the compiled table size {TABLE_SIZE}"
        );
        Self { next: 0, capacity }
    }

    /// Claim the next unused ordinal.
    pub fn assign(&mut self) -> Result<Slot, BridgeError> {
        if self.next >= self.capacity {
            return Err(BridgeError::TableExhausted {
                capacity: self.capacity,
            });
        }
        let slot = Slot(self.next as u16);
        self.next += 1;
        Ok(slot)
    }

    pub fn claimed(&self) -> usize {
        self.next
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.next
    }
}

impl Default for SlotCursor {
    fn default() -> Self {
        Self::new()
    }
}
