use core::fmt;

use super::Exhausted;

/// A generation-checked reference into a [`Pool`].
///
/// Handles are cheap to copy and safe to hold across frees: looking up a
/// handle whose slot has since been reused yields `None` rather than the
/// new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// The raw slot index, e.g. for stashing in a timer wheel entry.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    item: Option<T>,
}

/// A bounded arena with stable, generation-checked handles.
///
/// Slots are reused in LIFO order; each reuse bumps the slot generation so
/// stale handles are detected instead of aliasing the new entry.
#[derive(Debug)]
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    capacity: usize,
    len: usize,
}

impl<T> Pool<T> {
    /// Create a pool holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Pool<T> {
        Pool {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert `item`, returning its handle, or `Err(Exhausted)` when full.
    pub fn alloc(&mut self, item: T) -> Result<Handle, Exhausted> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.item.is_none());
            slot.item = Some(item);
            self.len += 1;
            return Ok(Handle {
                index,
                generation: slot.generation,
            });
        }
        if self.slots.len() >= self.capacity {
            return Err(Exhausted);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            item: Some(item),
        });
        self.len += 1;
        Ok(Handle {
            index,
            generation: 0,
        })
    }

    /// Remove the entry behind `handle`, returning it if it was still live.
    pub fn free(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation || slot.item.is_none() {
            return None;
        }
        let item = slot.item.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        item
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.item.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.item.as_mut()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// The current handle for a raw slot index, if the slot is occupied.
    pub fn handle_at(&self, index: u32) -> Option<Handle> {
        let slot = self.slots.get(index as usize)?;
        slot.item.as_ref()?;
        Some(Handle {
            index,
            generation: slot.generation,
        })
    }

    /// Drop every entry. Generations advance, invalidating all handles.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.item.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.item.as_ref().map(|item| {
                (
                    Handle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    item,
                )
            })
        })
    }
}
