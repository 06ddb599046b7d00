//! Generation-checked handle table.
//!
//! Handles pack a slot index (low 32 bits) and the slot's generation (high 32 bits).
//! Removing a value bumps the slot generation, so a stale handle can never resolve to a
//! context created later in the same slot. A slot whose generation would wrap is
//! retired instead of reused.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextHandle(u64);

impl ContextHandle {
    /// Never issued by a table.
    pub const INVALID: ContextHandle = ContextHandle(0);

    fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn index(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    pub fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn is_valid(&self) -> bool {
        self.generation() != 0
    }
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index(), self.generation())
    }
}

struct Slot<T> {
    /// Generation of the current (or next) occupant; starts at 1.
    generation: u32,
    value: Option<T>,
}

pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> ContextHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return ContextHandle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        ContextHandle::new(index, 1)
    }

    fn slot(&self, handle: ContextHandle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index() as usize)
            .filter(|s| handle.is_valid() && s.generation == handle.generation())
    }

    pub fn get(&self, handle: ContextHandle) -> Option<&T> {
        self.slot(handle).and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: ContextHandle) -> Option<&mut T> {
        if !handle.is_valid() {
            return None;
        }
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|s| s.generation == handle.generation())
            .and_then(|s| s.value.as_mut())
    }

    pub fn contains(&self, handle: ContextHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Take the value out and invalidate every outstanding handle to it.
    pub fn remove(&mut self, handle: ContextHandle) -> Option<T> {
        if !handle.is_valid() {
            return None;
        }
        let index = handle.index();
        let slot = self
            .slots
            .get_mut(index as usize)
            .filter(|s| s.generation == handle.generation())?;
        let value = slot.value.take()?;
        self.len -= 1;
        match slot.generation.checked_add(1) {
            Some(next) => {
                slot.generation = next;
                self.free.push(index);
            }
            // Exhausted: leave the slot permanently empty.
            None => {}
        }
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ContextHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value
                .as_ref()
                .map(|v| (ContextHandle::new(i as u32, s.generation), v))
        })
    }

    /// Remove everything; outstanding handles all go stale.
    pub fn drain(&mut self) -> Vec<(ContextHandle, T)> {
        let handles: Vec<ContextHandle> = self.iter().map(|(h, _)| h).collect();
        handles
            .into_iter()
            .filter_map(|h| self.remove(h).map(|v| (h, v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_handle_never_aliases() {
        let mut table = HandleTable::new();
        let a = table.insert("a");
        assert_eq!(table.remove(a), Some("a"));
        let b = table.insert("b");

        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(table.get(a).is_none());
        assert!(table.remove(a).is_none());
        assert_eq!(table.get(b), Some(&"b"));
    }

    #[test]
    fn test_invalid_and_foreign_handles() {
        let mut table: HandleTable<u32> = HandleTable::new();
        assert!(table.get(ContextHandle::INVALID).is_none());
        assert!(table.get(ContextHandle::from_raw(0xDEAD_BEEF_0000_0007)).is_none());
        let h = table.insert(7);
        assert!(table.get(ContextHandle::from_raw(h.raw())).is_some());
        assert!(table.get_mut(ContextHandle::INVALID).is_none());
    }

    #[test]
    fn test_iter_and_drain() {
        let mut table = HandleTable::new();
        let h1 = table.insert(1);
        let h2 = table.insert(2);
        table.remove(h1);
        let h3 = table.insert(3);
        let seen: Vec<i32> = table.iter().map(|(_, v)| *v).collect();
        assert_eq!(seen, vec![3, 2]);
        assert_eq!(table.len(), 2);

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
        assert!(table.get(h2).is_none() && table.get(h3).is_none());
    }

    #[test]
    fn test_exhausted_slot_retired() {
        let mut table = HandleTable::new();
        let h = table.insert(1);
        table.slots[h.index() as usize].generation = u32::MAX;
        let stale = ContextHandle::new(h.index(), u32::MAX);
        assert_eq!(table.remove(stale), Some(1));
        let fresh = table.insert(2);
        assert_ne!(fresh.index(), h.index());
    }
}
