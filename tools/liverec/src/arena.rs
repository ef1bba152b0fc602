//! Generational slot storage backing the opaque handles handed to callers.
//!
//! A handle carries the slot index and the generation it was issued for.
//! Removing a value bumps the slot's generation, so any copy of the old handle
//! is rejected afterwards instead of aliasing whatever reuses the slot.

use crate::errors::RecorderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Arena<T> {
    pub fn insert(&mut self, value: T) -> Handle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, handle: Handle) -> Result<&T, RecorderError> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
            .ok_or(RecorderError::InvalidHandle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T, RecorderError> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
            .ok_or(RecorderError::InvalidHandle)
    }

    pub fn remove(&mut self, handle: Handle) -> Result<T, RecorderError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(RecorderError::InvalidHandle)?;
        let value = slot.value.take().ok_or(RecorderError::InvalidHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::Arena;
    use crate::errors::RecorderError;

    #[test]
    fn stale_handle_is_rejected_after_slot_reuse() {
        let mut arena = Arena::default();
        let first = arena.insert("a");
        assert_eq!(arena.remove(first), Ok("a"));

        let second = arena.insert("b");
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert_eq!(arena.get(first), Err(RecorderError::InvalidHandle));
        assert_eq!(arena.get(second), Ok(&"b"));
    }

    #[test]
    fn double_remove_fails() {
        let mut arena = Arena::default();
        let handle = arena.insert(1u8);
        assert!(arena.remove(handle).is_ok());
        assert_eq!(arena.remove(handle), Err(RecorderError::InvalidHandle));
        assert!(arena.is_empty());
    }
}
