//! Generation-checked slots mapping native ids back to their wrappers.
//!
//! Providers only ever hold a [`Handle`]; resolving it through the arena
//! yields the one wrapper for that native object, and removing the slot on
//! teardown makes every stale copy of the handle resolve to nothing.

use std::fmt;

/// A stable, generation-checked slot index.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// The slot index, for logging.
    pub fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.index)
    }
}

enum Slot<T> {
    Free { next: Option<u32> },
    Reserved,
    Full(T),
}

struct Entry<T> {
    generation: u32,
    slot: Slot<T>,
}

/// Slot storage with a free list.
pub(crate) struct Arena<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Claims an empty slot so its handle can be handed out before the
    /// value exists.
    pub(crate) fn reserve(&mut self) -> Handle {
        self.len += 1;
        match self.free_head {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                self.free_head = match entry.slot {
                    Slot::Free { next } => next,
                    _ => unreachable!("free list points at a live slot"),
                };
                entry.slot = Slot::Reserved;
                Handle {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                let index = u32::try_from(self.entries.len()).expect("arena index overflow");
                self.entries.push(Entry {
                    generation: 0,
                    slot: Slot::Reserved,
                });
                Handle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Stores `value` in a reserved slot.
    pub(crate) fn fill(&mut self, handle: Handle, value: T) {
        let entry = &mut self.entries[handle.index as usize];
        assert_eq!(entry.generation, handle.generation, "stale arena handle");
        assert!(matches!(entry.slot, Slot::Reserved), "arena slot not reserved");
        entry.slot = Slot::Full(value);
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<&T> {
        match self.entries.get(handle.index as usize) {
            Some(Entry {
                generation,
                slot: Slot::Full(value),
            }) if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    /// Empties the slot (reserved or full), invalidating `handle`.
    pub(crate) fn remove(&mut self, handle: Handle) -> Option<T> {
        let entry = self.entries.get_mut(handle.index as usize)?;
        if entry.generation != handle.generation || matches!(entry.slot, Slot::Free { .. }) {
            return None;
        }
        let old = std::mem::replace(
            &mut entry.slot,
            Slot::Free {
                next: self.free_head,
            },
        );
        entry.generation = entry.generation.wrapping_add(1);
        self.free_head = Some(handle.index);
        self.len -= 1;
        match old {
            Slot::Full(value) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_misses() {
        let mut arena = Arena::new();
        let a = arena.reserve();
        arena.fill(a, "a");
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.remove(a), Some("a"));
        let b = arena.reserve();
        assert_eq!(a.index(), b.index());
        arena.fill(b, "b");
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn reserved_slot_is_invisible() {
        let mut arena: Arena<u8> = Arena::new();
        let h = arena.reserve();
        assert_eq!(arena.get(h), None);
        assert_eq!(arena.remove(h), None);
        assert_eq!(arena.len(), 0);
    }
}
