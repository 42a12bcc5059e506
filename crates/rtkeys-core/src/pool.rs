//! Fixed-capacity value entry pool.
//!
//! Every slot is allocated once when the pool is built. Free slots are
//! threaded into a LIFO free list through their chain `next` link, so
//! `acquire` and `release` are O(1) and never touch the allocator.
//!
//! The pool is the sole owner of entry storage. The value index and the
//! per-thread chains only hold [`NodeHandle`]s into it.

use crate::registry::KeyId;
use crate::thread::ThreadId;

/// Stable index of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeHandle(u32);

impl NodeHandle {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) const fn slot(self) -> usize {
        self.0 as usize
    }
}

pub(crate) type Link = Option<NodeHandle>;

/// Binding of one key to one thread's value, plus its intrusive links.
#[derive(Debug, Clone, Copy)]
pub struct ValueEntry {
    pub(crate) key: KeyId,
    pub(crate) thread: ThreadId,
    pub(crate) value: usize,
    // Value index links.
    pub(crate) left: Link,
    pub(crate) right: Link,
    pub(crate) height: u8,
    // Per-thread chain links; `next` doubles as the free-list link.
    pub(crate) prev: Link,
    pub(crate) next: Link,
    pub(crate) live: bool,
}

impl ValueEntry {
    const VACANT: Self = Self {
        key: KeyId::NONE,
        thread: ThreadId(0),
        value: 0,
        left: None,
        right: None,
        height: 0,
        prev: None,
        next: None,
        live: false,
    };

    #[must_use]
    pub const fn key(&self) -> KeyId {
        self.key
    }

    #[must_use]
    pub const fn thread(&self) -> ThreadId {
        self.thread
    }

    #[must_use]
    pub const fn value(&self) -> usize {
        self.value
    }
}

pub struct NodePool {
    slots: Box<[ValueEntry]>,
    free_head: Link,
    in_use: usize,
}

impl NodePool {
    /// Preallocate `capacity` slots, all free.
    ///
    /// # Panics
    ///
    /// If `capacity` does not fit a 32-bit handle. [`crate::KeyConfig::validate`]
    /// rejects such configurations before a pool is built.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity <= u32::MAX as usize,
            "pool capacity {capacity} exceeds handle range"
        );
        let mut slots = vec![ValueEntry::VACANT; capacity].into_boxed_slice();
        // Thread the free list in ascending slot order.
        for (i, slot) in slots.iter_mut().enumerate() {
            let next = i + 1;
            slot.next = (next < capacity).then(|| NodeHandle(next as u32));
        }
        Self {
            slots,
            free_head: (capacity > 0).then_some(NodeHandle(0)),
            in_use: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity() - self.in_use
    }

    /// Take a free slot and initialize it as an unlinked entry.
    ///
    /// Returns `None` when the pool is exhausted.
    pub fn acquire(&mut self, key: KeyId, thread: ThreadId, value: usize) -> Option<NodeHandle> {
        let handle = self.free_head?;
        let slot = &mut self.slots[handle.slot()];
        debug_assert!(!slot.live, "free list holds live slot {}", handle.0);
        self.free_head = slot.next;
        *slot = ValueEntry {
            key,
            thread,
            value,
            height: 1,
            live: true,
            ..ValueEntry::VACANT
        };
        self.in_use += 1;
        Some(handle)
    }

    /// Return a slot to the free list.
    ///
    /// The caller must have unlinked the entry from the index and its chain.
    /// Releasing a free slot is a caller bug: it trips a debug assertion and
    /// is otherwise ignored so the free list cannot be corrupted.
    pub fn release(&mut self, handle: NodeHandle) {
        let slot = &mut self.slots[handle.slot()];
        debug_assert!(slot.live, "double release of slot {}", handle.0);
        if !slot.live {
            return;
        }
        *slot = ValueEntry {
            next: self.free_head,
            ..ValueEntry::VACANT
        };
        self.free_head = Some(handle);
        self.in_use -= 1;
    }

    #[must_use]
    pub fn get(&self, handle: NodeHandle) -> &ValueEntry {
        &self.slots[handle.slot()]
    }

    pub(crate) fn get_mut(&mut self, handle: NodeHandle) -> &mut ValueEntry {
        &mut self.slots[handle.slot()]
    }

    /// Whether `handle` names a slot that is currently allocated.
    #[must_use]
    pub fn is_live(&self, handle: NodeHandle) -> bool {
        self.slots.get(handle.slot()).is_some_and(|slot| slot.live)
    }

    /// Iterate over allocated slots.
    pub fn live(&self) -> impl Iterator<Item = (NodeHandle, &ValueEntry)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.live)
            .map(|(i, slot)| (NodeHandle(i as u32), slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(index: u16) -> KeyId {
        KeyId::new(index, 1)
    }

    #[test]
    fn acquire_until_exhausted() {
        let mut pool = NodePool::with_capacity(3);
        let handles: Vec<_> = (0..3)
            .map(|i| pool.acquire(key(0), ThreadId(i), i as usize))
            .collect();
        assert!(handles.iter().all(Option::is_some));
        assert_eq!(pool.in_use(), 3);
        assert_eq!(pool.available(), 0);
        assert!(pool.acquire(key(0), ThreadId(9), 0).is_none());
    }

    #[test]
    fn release_makes_slot_reusable() {
        let mut pool = NodePool::with_capacity(1);
        let h = pool.acquire(key(1), ThreadId(1), 10).expect("slot");
        assert!(pool.acquire(key(1), ThreadId(2), 20).is_none());
        pool.release(h);
        assert_eq!(pool.in_use(), 0);
        let h2 = pool.acquire(key(1), ThreadId(2), 20).expect("slot after release");
        assert_eq!(h, h2);
        assert_eq!(pool.get(h2).thread(), ThreadId(2));
        assert_eq!(pool.get(h2).value(), 20);
    }

    #[test]
    fn free_list_is_lifo() {
        let mut pool = NodePool::with_capacity(4);
        let a = pool.acquire(key(0), ThreadId(1), 0).expect("a");
        let b = pool.acquire(key(0), ThreadId(2), 0).expect("b");
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.acquire(key(0), ThreadId(3), 0), Some(b));
        assert_eq!(pool.acquire(key(0), ThreadId(4), 0), Some(a));
    }

    #[test]
    fn acquired_entry_is_unlinked() {
        let mut pool = NodePool::with_capacity(2);
        let h = pool.acquire(key(3), ThreadId(7), 0xBEEF).expect("slot");
        let entry = pool.get(h);
        assert_eq!(entry.key(), key(3));
        assert!(entry.left.is_none() && entry.right.is_none());
        assert!(entry.prev.is_none() && entry.next.is_none());
        assert_eq!(entry.height, 1);
        assert!(pool.is_live(h));
    }

    #[test]
    fn live_iterates_allocated_only() {
        let mut pool = NodePool::with_capacity(5);
        let a = pool.acquire(key(0), ThreadId(1), 1).expect("a");
        let _b = pool.acquire(key(0), ThreadId(2), 2).expect("b");
        pool.release(a);
        let live: Vec<_> = pool.live().map(|(_, e)| e.value()).collect();
        assert_eq!(live, vec![2]);
    }

    #[test]
    fn zero_capacity_pool_is_always_exhausted() {
        let mut pool = NodePool::with_capacity(0);
        assert!(pool.acquire(key(0), ThreadId(1), 0).is_none());
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn double_release_is_ignored() {
        let mut pool = NodePool::with_capacity(2);
        let h = pool.acquire(key(0), ThreadId(1), 0).expect("slot");
        pool.release(h);
        pool.release(h);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 2);
    }
}
