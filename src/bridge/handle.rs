//! Generation-checked handle table
//!
//! Objects that cross the foreign-function boundary live in a [`HandleTable`]
//! and are referred to by [`Handle`] values. A handle packs a kind tag, the
//! slot generation and the slot index into one `u64`:
//!
//! ```text
//! [ kind: 8 bits ][ generation: 24 bits ][ index + 1: 32 bits ]
//! ```
//!
//! A raw value of `0` is never produced, so hosts can keep using `0` as "no handle".
//! Freeing a slot bumps its generation, which turns every stale copy of the
//! handle into a lookup miss instead of a use-after-free.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

const GENERATION_BITS: u32 = 24;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;
const INDEX_MASK: u64 = 0xFFFF_FFFF;

/// The kind of object a handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleKind {
    /// A token cursor (`n_past` counter)
    Cursor = 1,
    /// A generation session (context + sampler)
    Sampler = 2,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Cursor => write!(f, "cursor"),
            HandleKind::Sampler => write!(f, "sampler"),
        }
    }
}

/// Types that can be stored behind a [`Handle`]
pub trait Tagged {
    const KIND: HandleKind;
}

/// Typed reference into a [`HandleTable`]
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }
}

impl<T: Tagged> Handle<T> {
    /// Encodes the handle as an opaque integer for the host
    pub fn to_raw(self) -> u64 {
        (u64::from(T::KIND as u8) << 56)
            | (u64::from(self.generation & GENERATION_MASK) << 32)
            | (u64::from(self.index) + 1)
    }

    /// Decodes a host integer
    ///
    /// Returns `None` for `0`, for values minted for another kind of object
    /// and for malformed values. It does not check liveness; that is the
    /// table's job.
    pub fn from_raw(raw: u64) -> Option<Self> {
        let tag = (raw >> 56) as u8;
        if tag != T::KIND as u8 {
            return None;
        }
        let slot = (raw & INDEX_MASK) as u32;
        if slot == 0 {
            return None;
        }
        let generation = ((raw >> 32) as u32) & GENERATION_MASK;
        Some(Self::new(slot - 1, generation))
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of values addressed by generation-checked handles
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> HandleTable<T> {
    /// Creates an empty table
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Stores a value and returns its handle
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }

        // Slot indices are encoded in 32 bits with a +1 offset.
        debug_assert!(self.slots.len() < u32::MAX as usize);
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    fn slot(&self, handle: Handle<T>) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
    }

    /// Returns the value if the handle is still live
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slot(handle).and_then(|slot| slot.value.as_ref())
    }

    /// Returns the value mutably if the handle is still live
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Removes and returns the value, invalidating the handle
    ///
    /// Removing an already-removed handle returns `None` and leaves the table
    /// untouched.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let value = slot.value.take()?;
        slot.generation = (slot.generation + 1) & GENERATION_MASK;
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    /// Drops every value, invalidating all outstanding handles
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                slot.generation = (slot.generation + 1) & GENERATION_MASK;
                self.free.push(index as u32);
            }
        }
        self.len = 0;
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
