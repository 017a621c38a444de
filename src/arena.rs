//! Fixed-capacity generational slot arena.
//!
//! The Extended backend keeps its allocation state in user space; this arena
//! is that bookkeeping. Handles encode the slot index plus a generation
//! counter, so a handle that outlives its allocation is *detected* as stale
//! rather than silently resolving to whatever reused the slot. The Legacy
//! backend never touches this module: the kernel retains all of its state
//! and is queried by handle on every call.
//!
//! Lock discipline: one mutex, held only for the scan or the field update,
//! never across a kernel request or an mmap.

use std::sync::Mutex;

use crate::Handle;

/// Reference capacity of the process-wide allocation arena.
pub const ARENA_CAPACITY: usize = 512;

// Handle layout: low 10 bits carry (index + 1), the rest carry the slot
// generation. index + 1 keeps handle 0 unrepresentable.
const INDEX_BITS: u32 = 10;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

fn encode(index: usize, generation: u32) -> Handle {
    debug_assert!(index + 1 <= INDEX_MASK as usize);
    (generation << INDEX_BITS) | (index as u32 + 1)
}

fn decode(handle: Handle) -> Option<(usize, u32)> {
    let biased = handle & INDEX_MASK;
    if biased == 0 {
        return None;
    }
    Some(((biased - 1) as usize, handle >> INDEX_BITS))
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// A fixed-capacity slot table handing out generational handles.
pub struct SlotArena<T> {
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T> SlotArena<T> {
    /// Create an arena with `capacity` slots. Capacity is clamped to what
    /// the handle encoding can express.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(INDEX_MASK as usize);
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                generation: 0,
                value: None,
            });
        }
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Store `value` in the first free slot and return its handle.
    ///
    /// Returns `None` when every slot is in use. Exhaustion is a
    /// resource condition for the caller to surface, not a panic.
    pub fn insert(&self, value: T) -> Option<Handle> {
        let mut slots = self.slots.lock().expect("arena mutex poisoned");
        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.value.is_none())?;
        slot.value = Some(value);
        Some(encode(index, slot.generation))
    }

    /// Take the value out of `handle`'s slot, freeing the slot.
    ///
    /// Returns `None` when the handle is malformed, stale (generation
    /// mismatch after a previous free) or the slot is already vacant; the
    /// slot contents of *other* handles are never touched.
    pub fn remove(&self, handle: Handle) -> Option<T> {
        let (index, generation) = decode(handle)?;
        let mut slots = self.slots.lock().expect("arena mutex poisoned");
        let slot = slots.get_mut(index)?;
        if slot.generation != generation || slot.value.is_none() {
            return None;
        }
        // Bump the generation so the freed handle can never resolve again.
        slot.generation = slot.generation.wrapping_add(1);
        slot.value.take()
    }

    /// Run `f` against the live value for `handle`.
    ///
    /// Returns `None` for malformed, stale or vacant handles.
    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let (index, generation) = decode(handle)?;
        let mut slots = self.slots.lock().expect("arena mutex poisoned");
        let slot = slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_mut().map(f)
    }

    /// Linear scan over live slots; the first slot for which `f` returns
    /// `Some` wins. O(N) with N small, and the lock is held only for the
    /// scan.
    pub fn find<R>(&self, mut f: impl FnMut(Handle, &T) -> Option<R>) -> Option<R> {
        let slots = self.slots.lock().expect("arena mutex poisoned");
        slots.iter().enumerate().find_map(|(index, slot)| {
            let value = slot.value.as_ref()?;
            f(encode(index, slot.generation), value)
        })
    }

    /// Number of slots currently in use.
    pub fn occupancy(&self) -> usize {
        let slots = self.slots.lock().expect("arena mutex poisoned");
        slots.iter().filter(|s| s.value.is_some()).count()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.lock().expect("arena mutex poisoned").len()
    }
}

impl<T> std::fmt::Debug for SlotArena<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotArena")
            .field("capacity", &self.capacity())
            .field("occupancy", &self.occupancy())
            .finish()
    }
}
