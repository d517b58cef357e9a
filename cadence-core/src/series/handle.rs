//! Generational handles.
//!
//! Time-series cells, inputs and graph records live in arenas owned by the
//! [`Runtime`](crate::runtime::Runtime). Parent links, subscriber edges and
//! reference observers are stored as handles into those arenas rather than as
//! pointers, so the cyclic graph of notifications never owns anything.
//!
//! A slot's generation is bumped every time it is released; a handle whose
//! generation no longer matches resolves to `None` instead of aliasing the
//! slot's next occupant.

use std::fmt;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            index: u32,
            generation: u32,
        }

        impl ArenaHandle for $name {
            fn from_parts(index: u32, generation: u32) -> Self {
                Self { index, generation }
            }

            fn index(self) -> u32 {
                self.index
            }

            fn generation(self) -> u32 {
                self.generation
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}v{}", $prefix, self.index, self.generation)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

handle!(
    /// Handle to a time-series output cell.
    OutputId,
    "out"
);
handle!(
    /// Handle to a time-series input cell.
    InputId,
    "in"
);
handle!(
    /// Handle to a graph's scheduling record.
    GraphKey,
    "graph"
);

/// Conversion between a typed handle and its raw parts.
pub trait ArenaHandle: Copy {
    fn from_parts(index: u32, generation: u32) -> Self;
    fn index(self) -> u32;
    fn generation(self) -> u32;
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// A slab whose slots are addressed by generational handles.
pub(crate) struct Arena<H, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    _handle: std::marker::PhantomData<H>,
}

impl<H: ArenaHandle, T> Arena<H, T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _handle: std::marker::PhantomData,
        }
    }

    pub fn insert(&mut self, value: T) -> H {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return H::from_parts(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        H::from_parts(index, 0)
    }

    pub fn get(&self, handle: H) -> Option<&T> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: H) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, handle: H) -> bool {
        self.get(handle).is_some()
    }

    pub fn remove(&mut self, handle: H) -> Option<T> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index());
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let value = slot.value.as_ref()?;
            Some((H::from_parts(index as u32, slot.generation), value))
        })
    }
}

impl<H: ArenaHandle, T> Default for Arena<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handles_do_not_alias() {
        let mut arena: Arena<OutputId, &str> = Arena::new();
        let a = arena.insert("a");
        assert_eq!(arena.remove(a), Some("a"));
        let b = arena.insert("b");

        // Same slot, new generation.
        assert_eq!(a.index(), b.index());
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn handles_format_with_generation() {
        let h = InputId::from_parts(3, 2);
        assert_eq!(format!("{h:?}"), "in3v2");
    }
}
