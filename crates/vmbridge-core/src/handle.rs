//! Opaque handles and the instance registry.
//!
//! A [`Handle`] is a slot index plus the slot's generation at allocation time.
//! Removing an instance bumps the generation, so a stale handle never
//! resolves to a later instance that reuses the slot.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Identifier of one VM instance, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Encode as a non-zero integer for the C interface.
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | (u64::from(self.index) + 1)
    }

    /// Decode a value produced by [`Handle::to_raw`]. Zero is never valid.
    pub fn from_raw(raw: u64) -> Option<Self> {
        let low = (raw & 0xffff_ffff) as u32;
        let index = low.checked_sub(1)?;
        Some(Self {
            index,
            generation: (raw >> 32) as u32,
        })
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct Slots<T> {
    entries: Vec<Slot<T>>,
    free: Vec<u32>,
}

/// Generation-checked map from handles to shared values.
pub(crate) struct Registry<T> {
    slots: RwLock<Slots<T>>,
}

impl<T> Registry<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Store the value built by `make` under a fresh handle.
    pub(crate) fn insert_with(&self, make: impl FnOnce(Handle) -> T) -> Handle {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);

        let index = match slots.free.pop() {
            Some(index) => index,
            None => {
                slots.entries.push(Slot {
                    generation: 1,
                    value: None,
                });
                (slots.entries.len() - 1) as u32
            }
        };

        let slot = &mut slots.entries[index as usize];
        let handle = Handle {
            index,
            generation: slot.generation,
        };
        slot.value = Some(Arc::new(make(handle)));
        handle
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<Arc<T>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .entries
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.clone())
    }

    /// Remove the value; the handle is dead afterwards.
    pub(crate) fn remove(&self, handle: Handle) -> Option<Arc<T>> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .entries
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;

        let value = slot.value.take()?;
        // Generation 0 is skipped so raw handles stay distinguishable.
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slots.free.push(handle.index);
        Some(value)
    }

    pub(crate) fn handles(&self) -> Vec<Handle> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| Handle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.entries.len() - slots.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_roundtrip() {
        let registry = Registry::new();
        let handle = registry.insert_with(|_| ());
        let raw = handle.to_raw();
        assert_ne!(raw, 0);
        assert_eq!(Handle::from_raw(raw), Some(handle));
        assert_eq!(Handle::from_raw(0), None);
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = Registry::new();
        let a = registry.insert_with(|h| h);
        let b = registry.insert_with(|h| h);

        assert_ne!(a, b);
        assert_eq!(*registry.get(a).unwrap(), a);
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(a).is_some());
        assert!(registry.get(a).is_none());
        assert!(registry.remove(a).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.handles(), vec![b]);
    }

    #[test]
    fn test_stale_handle_does_not_resolve_to_reused_slot() {
        let registry = Registry::new();
        let old = registry.insert_with(|_| "old");
        registry.remove(old);

        let new = registry.insert_with(|_| "new");
        assert_eq!(old.index, new.index);
        assert_ne!(old, new);
        assert!(registry.get(old).is_none());
        assert_eq!(*registry.get(new).unwrap(), "new");
    }
}
