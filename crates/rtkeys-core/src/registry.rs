//! Key registry: the bounded key namespace.
//!
//! A fixed table of key slots, each tracking liveness, the optional
//! destructor, a generation counter and the number of live bindings. The
//! generation is part of the [`KeyId`] handed out, so a handle to a deleted
//! key stays invalid even after its slot is reused.

use crate::error::{KeyError, Resource};

/// Destructor run at thread exit with the thread's non-null value.
pub type Destructor = fn(usize);

/// Opaque key handle: slot index plus slot generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyId {
    pub(crate) index: u16,
    pub(crate) generation: u16,
}

impl KeyId {
    /// Never issued: generation 0 is skipped.
    pub(crate) const NONE: Self = Self {
        index: 0,
        generation: 0,
    };

    #[must_use]
    pub(crate) const fn new(index: u16, generation: u16) -> Self {
        Self { index, generation }
    }

    /// Packed form, `generation << 16 | index`.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        ((self.generation as u32) << 16) | self.index as u32
    }

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            index: (raw & 0xFFFF) as u16,
            generation: (raw >> 16) as u16,
        }
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "key#{}.{}", self.index, self.generation)
    }
}

/// Registry state of one key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMeta {
    pub live: bool,
    pub destructor: Option<Destructor>,
    pub generation: u16,
    /// Live value entries bound to this key.
    pub bindings: u32,
}

const EMPTY_SLOT: KeyMeta = KeyMeta {
    live: false,
    destructor: None,
    generation: 0,
    bindings: 0,
};

fn next_generation(generation: u16) -> u16 {
    match generation.wrapping_add(1) {
        0 => 1,
        g => g,
    }
}

pub struct KeyRegistry {
    slots: Box<[KeyMeta]>,
    live: usize,
}

impl KeyRegistry {
    /// # Panics
    ///
    /// If `max_keys` exceeds the 16-bit slot index range.
    #[must_use]
    pub fn new(max_keys: usize) -> Self {
        assert!(max_keys <= u16::MAX as usize, "too many keys: {max_keys}");
        Self {
            slots: vec![EMPTY_SLOT; max_keys].into_boxed_slice(),
            live: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn live_keys(&self) -> usize {
        self.live
    }

    /// Allocate the lowest free key slot.
    pub fn create(&mut self, destructor: Option<Destructor>) -> Result<KeyId, KeyError> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| !slot.live)
            .ok_or(KeyError::ResourceExhausted(Resource::Keys))?;
        slot.live = true;
        slot.destructor = destructor;
        slot.generation = next_generation(slot.generation);
        slot.bindings = 0;
        self.live += 1;
        Ok(KeyId::new(index as u16, slot.generation))
    }

    /// Retire a key. Its bindings must already be purged.
    pub fn delete(&mut self, key: KeyId) -> Result<(), KeyError> {
        self.lookup(key)?;
        let slot = &mut self.slots[key.index()];
        debug_assert_eq!(slot.bindings, 0, "{key} deleted with live bindings");
        slot.live = false;
        slot.destructor = None;
        slot.generation = next_generation(slot.generation);
        self.live -= 1;
        Ok(())
    }

    /// Metadata of a live key; unknown, dead and stale handles are invalid.
    pub fn lookup(&self, key: KeyId) -> Result<&KeyMeta, KeyError> {
        match self.slots.get(key.index()) {
            Some(slot) if slot.live && slot.generation == key.generation => Ok(slot),
            _ => Err(KeyError::InvalidKey(key.as_raw())),
        }
    }

    pub(crate) fn add_binding(&mut self, key: KeyId) {
        self.slots[key.index()].bindings += 1;
    }

    pub(crate) fn drop_binding(&mut self, key: KeyId) {
        let slot = &mut self.slots[key.index()];
        debug_assert!(slot.bindings > 0, "{key} binding count underflow");
        slot.bindings = slot.bindings.saturating_sub(1);
    }

    /// Iterate over live keys with their metadata.
    pub fn iter_live(&self) -> impl Iterator<Item = (KeyId, &KeyMeta)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.live)
            .map(|(i, slot)| (KeyId::new(i as u16, slot.generation), slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: usize) {}

    #[test]
    fn create_assigns_distinct_ids() {
        let mut reg = KeyRegistry::new(4);
        let k1 = reg.create(None).expect("k1");
        let k2 = reg.create(None).expect("k2");
        assert_ne!(k1, k2);
        assert_eq!(reg.live_keys(), 2);
    }

    #[test]
    fn exhaustion_reports_keys_resource() {
        let mut reg = KeyRegistry::new(2);
        reg.create(None).expect("k1");
        reg.create(None).expect("k2");
        assert_eq!(
            reg.create(None),
            Err(KeyError::ResourceExhausted(Resource::Keys))
        );
    }

    #[test]
    fn delete_twice_is_invalid() {
        let mut reg = KeyRegistry::new(2);
        let k = reg.create(None).expect("key");
        assert_eq!(reg.delete(k), Ok(()));
        assert_eq!(reg.delete(k), Err(KeyError::InvalidKey(k.as_raw())));
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let mut reg = KeyRegistry::new(1);
        let k1 = reg.create(Some(noop)).expect("k1");
        reg.delete(k1).expect("delete");
        let k2 = reg.create(None).expect("k2");
        assert_eq!(k1.index(), k2.index());
        assert_ne!(k1, k2);
        assert!(reg.lookup(k1).is_err(), "stale handle must be rejected");
        assert!(reg.lookup(k2).expect("live").destructor.is_none());
    }

    #[test]
    fn lookup_out_of_range_is_invalid() {
        let reg = KeyRegistry::new(2);
        let bogus = KeyId::new(100, 1);
        assert_eq!(reg.lookup(bogus), Err(KeyError::InvalidKey(bogus.as_raw())));
    }

    #[test]
    fn generation_skips_zero() {
        assert_eq!(next_generation(u16::MAX), 1);
        assert_eq!(next_generation(0), 1);
        assert_eq!(next_generation(7), 8);
    }

    #[test]
    fn raw_round_trip_preserves_fields() {
        let k = KeyId::new(0x0102, 0x0304);
        assert_eq!(k.as_raw(), 0x0304_0102);
        assert_eq!(KeyId::from_raw(k.as_raw()), k);
    }

    #[test]
    fn binding_counts_track_add_and_drop() {
        let mut reg = KeyRegistry::new(1);
        let k = reg.create(None).expect("key");
        reg.add_binding(k);
        reg.add_binding(k);
        reg.drop_binding(k);
        assert_eq!(reg.lookup(k).expect("live").bindings, 1);
    }
}
