//! Descriptor tables.
//!
//! Descriptors are generation-tagged: the low 16 bits select a slot (offset
//! past stdin/stdout/stderr) and the next 15 bits carry the slot's
//! generation, bumped on every removal. A descriptor kept after `close`
//! therefore stops resolving instead of aliasing whatever reuses the slot.

use std::fmt;

use purefs_types::{Errno, VfsResult};

/// First descriptor number handed out; 0-2 belong to stdio.
const FIRST_FD: usize = 3;
const INDEX_BITS: u32 = 16;
const INDEX_MASK: i32 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u16 = 0x7FFF;
const MAX_SLOTS: usize = (1 << INDEX_BITS) - FIRST_FD;

/// An open file or directory descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Descriptor(i32);

impl Descriptor {
    fn new(index: usize, generation: u16) -> Self {
        let low = (index + FIRST_FD) as i32;
        let high = i32::from(generation & GENERATION_MASK) << INDEX_BITS;
        Self(high | low)
    }

    /// Wrap a raw descriptor received from a caller.
    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    fn index(self) -> Option<usize> {
        if self.0 < 0 {
            return None;
        }
        ((self.0 & INDEX_MASK) as usize).checked_sub(FIRST_FD)
    }

    fn generation(self) -> u16 {
        ((self.0 >> INDEX_BITS) as u16) & GENERATION_MASK
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor({})", self.0)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// Slot arena keyed by [`Descriptor`].
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Store `value` and return its descriptor; `EMFILE` when full.
    pub fn insert(&mut self, value: T) -> VfsResult<Descriptor> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= MAX_SLOTS {
                    return Err(Errno::EMFILE);
                }
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.value = Some(value);
        self.len += 1;
        Ok(Descriptor::new(index, slot.generation))
    }

    pub fn get(&self, fd: Descriptor) -> Option<&T> {
        let slot = self.slots.get(fd.index()?)?;
        if slot.generation != fd.generation() {
            return None;
        }
        slot.value.as_ref()
    }

    /// Remove and return the value; the descriptor never resolves again.
    pub fn remove(&mut self, fd: Descriptor) -> Option<T> {
        let index = fd.index()?;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != fd.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1) & GENERATION_MASK;
        self.free.push(index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Descriptor, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Descriptor::new(index, slot.generation), value))
        })
    }
}
