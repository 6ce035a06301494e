//! A generational arena for connections.
//!
//! Each entry is addressed by a [`Key`] that stays valid until the entry is removed. A key of a
//! removed entry never resolves again, even after its index was reused, so stale references held
//! by scheduled events or by the application are harmless.
//!
//! [`Key`]: struct.Key.html

/// An index into a slotmap.
///
/// The index remains valid until the entry is removed. If accessing the slotmap with the index
/// again after the entry was removed will fail, even if the index where the element was previously
/// stored has been reused for another element.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    idx: usize,
    generation: u32,
}

/// A slot in the map, either holding an element or linking to the next free slot.
#[derive(Debug)]
enum Slot<T> {
    Occupied {
        generation: u32,
        value: T,
    },
    Free {
        next_free: Option<usize>,
    },
}

/// Provides a growable slotmap.
///
/// A slotmap provides a `Vec`-like interface where each entry is associated with a stable
/// index-like key. Lookup with the key will detect if an entry has been removed but does not
/// require and lifetime relation.
#[derive(Debug)]
pub(crate) struct SlotMap<T> {
    slots: Vec<Slot<T>>,
    free_top: Option<usize>,
    /// The generation counter, strictly advancing with each insertion.
    generation: u32,
    len: usize,
}

impl Key {
    /// The position of the element, for diagnostics.
    pub fn index(self) -> usize {
        self.idx
    }
}

impl core::fmt::Display for Key {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "#{}v{}", self.idx, self.generation)
    }
}

impl<T> SlotMap<T> {
    pub(crate) fn new() -> Self {
        SlotMap {
            slots: Vec::new(),
            free_top: None,
            generation: 1,
            len: 0,
        }
    }

    /// Retrieve a value by index.
    pub(crate) fn get(&self, key: Key) -> Option<&T> {
        match self.slots.get(key.idx)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    /// Retrieve a mutable value by index.
    pub(crate) fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        match self.slots.get_mut(key.idx)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    /// Insert a value, reusing a free slot if there is one.
    pub(crate) fn insert(&mut self, value: T) -> Key {
        let generation = self.generation;
        self.generation = self.generation.wrapping_add(1).max(1);
        self.len += 1;

        let occupied = Slot::Occupied { generation, value };
        match self.free_top {
            Some(idx) => {
                self.free_top = match self.slots[idx] {
                    Slot::Free { next_free } => next_free,
                    Slot::Occupied { .. } => unreachable!("free list points to an occupied slot"),
                };
                self.slots[idx] = occupied;
                Key { idx, generation }
            },
            None => {
                let idx = self.slots.len();
                self.slots.push(occupied);
                Key { idx, generation }
            },
        }
    }

    /// Remove an element.
    ///
    /// Returns the removed element or `None` if the key did not refer to an element. Removing
    /// twice is therefore harmless.
    pub(crate) fn remove(&mut self, key: Key) -> Option<T> {
        self.get(key)?;
        let free = Slot::Free { next_free: self.free_top };
        let old = core::mem::replace(&mut self.slots[key.idx], free);
        self.free_top = Some(key.idx);
        self.len -= 1;
        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// The number of elements.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for SlotMap<T> {
    fn default() -> Self {
        SlotMap::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn simple() {
        let mut map = SlotMap::new();
        let a = map.insert(0usize);
        let b = map.insert(1usize);
        assert_eq!(map.get(a), Some(&0));
        assert_eq!(map.get(b), Some(&1));
        assert_eq!(map.len(), 2);

        *map.get_mut(a).unwrap() = 42;
        assert_eq!(map.remove(a), Some(42));
        assert_eq!(map.get(a), None);
        assert_eq!(map.remove(a), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn stale_key_after_reuse() {
        let mut map = SlotMap::new();
        let a = map.insert("first");
        map.remove(a);
        let b = map.insert("second");
        assert_eq!(a.index(), b.index());
        assert_eq!(map.get(a), None);
        assert_eq!(map.get(b), Some(&"second"));
        assert_eq!(map.len(), 1);
    }
}
