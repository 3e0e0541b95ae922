//! Fixed-capacity slot arena addressed by generation-tagged handles.
//!
//! Insert and remove are O(1) (free list). Every removal bumps the slot's
//! generation, so a [`Handle`] kept past the removal of its value no longer
//! resolves, even after the slot has been reused.

use std::fmt;

/// Index of a slot plus the generation it was issued for.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// A handle no arena ever issues.
    #[cfg(test)]
    pub(crate) fn dangling() -> Self {
        Handle {
            index: u32::MAX,
            generation: u32::MAX,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

impl<T> Slot<T> {
    fn generation(&self) -> u32 {
        match self {
            Slot::Occupied { generation, .. } | Slot::Vacant { generation } => *generation,
        }
    }
}

pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    capacity: usize,
}

impl<T> Arena<T> {
    /// Slots are allocated lazily, up to `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Stores `value`, handing it back if every slot is taken.
    pub fn insert(&mut self, value: T) -> Result<Handle, T> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = slot.generation();
            *slot = Slot::Occupied { generation, value };
            self.len += 1;
            return Ok(Handle { index, generation });
        }
        if self.slots.len() >= self.capacity {
            return Err(value);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        self.len += 1;
        Ok(Handle {
            index,
            generation: 0,
        })
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {}
            _ => return None,
        }
        let next = Slot::Vacant {
            generation: handle.generation.wrapping_add(1),
        };
        let Slot::Occupied { value, .. } = std::mem::replace(slot, next) else {
            return None;
        };
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    Handle {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }

    /// Handles of every live value, detached from the arena borrow so the
    /// caller can remove entries while walking the list.
    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Removes every value. Outstanding handles become stale.
    pub fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len);
        for handle in self.handles() {
            if let Some(value) = self.remove(handle) {
                drained.push(value);
            }
        }
        drained
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::with_capacity(usize::MAX)
    }
}
