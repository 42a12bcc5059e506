//! Per-thread chains of value entries.
//!
//! Each thread holding at least one binding owns a chain head in a fixed
//! open-addressed table keyed by thread id. The chain links the thread's
//! entries in insertion order through the pool slots' `prev`/`next` links,
//! which is the order destructors run in at thread exit.
//!
//! A thread claims a head on its first binding and gives it back when its
//! chain empties. Chains never free pool storage themselves.

use crate::error::{KeyError, Resource};
use crate::pool::{Link, NodeHandle, NodePool};
use crate::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadState {
    Empty,
    Tombstone,
    Occupied,
}

#[derive(Debug, Clone, Copy)]
struct ChainHead {
    state: HeadState,
    thread: ThreadId,
    head: Link,
    tail: Link,
    len: usize,
}

const VACANT_HEAD: ChainHead = ChainHead {
    state: HeadState::Empty,
    thread: ThreadId(0),
    head: None,
    tail: None,
    len: 0,
};

pub struct ChainTable {
    heads: Box<[ChainHead]>,
    threads: usize,
    entries: usize,
}

impl ChainTable {
    /// # Panics
    ///
    /// If `max_threads` is zero.
    #[must_use]
    pub fn new(max_threads: usize) -> Self {
        assert!(max_threads > 0, "chain table needs at least one head");
        Self {
            heads: vec![VACANT_HEAD; max_threads].into_boxed_slice(),
            threads: 0,
            entries: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.heads.len()
    }

    /// Threads currently holding a chain.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Entries across all chains.
    #[must_use]
    pub fn entries(&self) -> usize {
        self.entries
    }

    #[inline]
    fn home(&self, thread: ThreadId) -> usize {
        thread.0 as usize % self.heads.len()
    }

    fn slot_of(&self, thread: ThreadId) -> Option<usize> {
        let cap = self.heads.len();
        let start = self.home(thread);
        for i in 0..cap {
            let idx = (start + i) % cap;
            let head = &self.heads[idx];
            match head.state {
                HeadState::Empty => return None,
                HeadState::Occupied if head.thread == thread => return Some(idx),
                _ => {}
            }
        }
        None
    }

    fn claim(&mut self, thread: ThreadId) -> Result<usize, KeyError> {
        if let Some(idx) = self.slot_of(thread) {
            return Ok(idx);
        }
        let cap = self.heads.len();
        let start = self.home(thread);
        let idx = (0..cap)
            .map(|i| (start + i) % cap)
            .find(|&idx| self.heads[idx].state != HeadState::Occupied)
            .ok_or(KeyError::ResourceExhausted(Resource::Threads))?;
        self.heads[idx] = ChainHead {
            state: HeadState::Occupied,
            thread,
            ..VACANT_HEAD
        };
        self.threads += 1;
        Ok(idx)
    }

    fn vacate(&mut self, idx: usize) {
        let cap = self.heads.len();
        self.heads[idx] = ChainHead {
            state: HeadState::Tombstone,
            ..VACANT_HEAD
        };
        self.threads -= 1;
        // A tombstone directly before an empty slot never extends a probe.
        if self.heads[(idx + 1) % cap].state == HeadState::Empty {
            let mut i = idx;
            while self.heads[i].state == HeadState::Tombstone {
                self.heads[i].state = HeadState::Empty;
                i = (i + cap - 1) % cap;
            }
        }
    }

    /// Reserve a head for `thread` without linking anything.
    ///
    /// Lets the caller learn about thread-table exhaustion before it touches
    /// the pool or the index.
    pub fn reserve(&mut self, thread: ThreadId) -> Result<(), KeyError> {
        self.claim(thread).map(|_| ())
    }

    /// Give back a head reserved by [`Self::reserve`] that stayed empty.
    pub fn unreserve(&mut self, thread: ThreadId) {
        if let Some(idx) = self.slot_of(thread)
            && self.heads[idx].len == 0
        {
            self.vacate(idx);
        }
    }

    /// Link `node` at the tail of its owner's chain.
    pub fn append(&mut self, pool: &mut NodePool, node: NodeHandle) -> Result<(), KeyError> {
        let thread = pool.get(node).thread;
        let idx = self.claim(thread)?;
        let tail = self.heads[idx].tail;
        {
            let e = pool.get_mut(node);
            e.prev = tail;
            e.next = None;
        }
        match tail {
            Some(t) => pool.get_mut(t).next = Some(node),
            None => self.heads[idx].head = Some(node),
        }
        let head = &mut self.heads[idx];
        head.tail = Some(node);
        head.len += 1;
        self.entries += 1;
        Ok(())
    }

    /// Unlink `node` from its owner's chain; the slot stays allocated.
    pub fn unlink(&mut self, pool: &mut NodePool, node: NodeHandle) {
        let (thread, prev, next) = {
            let e = pool.get(node);
            (e.thread, e.prev, e.next)
        };
        let Some(idx) = self.slot_of(thread) else {
            debug_assert!(false, "unlink of unchained node {}", node.as_u32());
            return;
        };
        match prev {
            Some(p) => pool.get_mut(p).next = next,
            None => self.heads[idx].head = next,
        }
        match next {
            Some(n) => pool.get_mut(n).prev = prev,
            None => self.heads[idx].tail = prev,
        }
        let e = pool.get_mut(node);
        e.prev = None;
        e.next = None;
        self.entries -= 1;
        self.heads[idx].len -= 1;
        if self.heads[idx].len == 0 {
            self.vacate(idx);
        }
    }

    /// Unlink and return the oldest entry of `thread`'s chain.
    pub fn pop_front(&mut self, pool: &mut NodePool, thread: ThreadId) -> Option<NodeHandle> {
        let idx = self.slot_of(thread)?;
        let front = self.heads[idx].head?;
        self.unlink(pool, front);
        Some(front)
    }

    /// Number of entries chained for `thread`.
    #[must_use]
    pub fn len(&self, thread: ThreadId) -> usize {
        self.slot_of(thread).map_or(0, |idx| self.heads[idx].len)
    }

    /// Entries of `thread` in insertion order.
    pub fn iter<'a>(
        &'a self,
        pool: &'a NodePool,
        thread: ThreadId,
    ) -> impl Iterator<Item = NodeHandle> + 'a {
        let mut cur = self.slot_of(thread).and_then(|idx| self.heads[idx].head);
        core::iter::from_fn(move || {
            let h = cur?;
            cur = pool.get(h).next;
            Some(h)
        })
    }

    /// Threads holding a chain, with their chain lengths.
    pub fn chained_threads(&self) -> impl Iterator<Item = (ThreadId, usize)> + '_ {
        self.heads
            .iter()
            .filter(|head| head.state == HeadState::Occupied)
            .map(|head| (head.thread, head.len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::KeyId;

    fn bind(pool: &mut NodePool, chains: &mut ChainTable, k: u16, t: u32) -> NodeHandle {
        let h = pool
            .acquire(KeyId::new(k, 1), ThreadId(t), 0)
            .expect("pool slot");
        chains.append(pool, h).expect("chain head");
        h
    }

    #[test]
    fn append_preserves_insertion_order() {
        let mut pool = NodePool::with_capacity(8);
        let mut chains = ChainTable::new(4);
        let a = bind(&mut pool, &mut chains, 3, 1);
        let b = bind(&mut pool, &mut chains, 1, 1);
        let c = bind(&mut pool, &mut chains, 2, 1);
        let order: Vec<_> = chains.iter(&pool, ThreadId(1)).collect();
        assert_eq!(order, vec![a, b, c]);
        assert_eq!(chains.len(ThreadId(1)), 3);
        assert_eq!(chains.threads(), 1);
    }

    #[test]
    fn unlink_middle_and_ends() {
        let mut pool = NodePool::with_capacity(8);
        let mut chains = ChainTable::new(4);
        let a = bind(&mut pool, &mut chains, 1, 2);
        let b = bind(&mut pool, &mut chains, 2, 2);
        let c = bind(&mut pool, &mut chains, 3, 2);
        chains.unlink(&mut pool, b);
        assert_eq!(chains.iter(&pool, ThreadId(2)).collect::<Vec<_>>(), vec![a, c]);
        chains.unlink(&mut pool, a);
        assert_eq!(chains.iter(&pool, ThreadId(2)).collect::<Vec<_>>(), vec![c]);
        chains.unlink(&mut pool, c);
        assert_eq!(chains.len(ThreadId(2)), 0);
        assert_eq!(chains.threads(), 0);
        assert_eq!(chains.entries(), 0);
    }

    #[test]
    fn pop_front_drains_in_order() {
        let mut pool = NodePool::with_capacity(8);
        let mut chains = ChainTable::new(2);
        let a = bind(&mut pool, &mut chains, 1, 5);
        let b = bind(&mut pool, &mut chains, 2, 5);
        assert_eq!(chains.pop_front(&mut pool, ThreadId(5)), Some(a));
        assert_eq!(chains.pop_front(&mut pool, ThreadId(5)), Some(b));
        assert_eq!(chains.pop_front(&mut pool, ThreadId(5)), None);
    }

    #[test]
    fn threads_are_isolated() {
        let mut pool = NodePool::with_capacity(8);
        let mut chains = ChainTable::new(4);
        let a = bind(&mut pool, &mut chains, 1, 1);
        let b = bind(&mut pool, &mut chains, 1, 2);
        assert_eq!(chains.iter(&pool, ThreadId(1)).collect::<Vec<_>>(), vec![a]);
        assert_eq!(chains.iter(&pool, ThreadId(2)).collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn head_table_exhaustion() {
        let mut pool = NodePool::with_capacity(8);
        let mut chains = ChainTable::new(2);
        bind(&mut pool, &mut chains, 1, 1);
        bind(&mut pool, &mut chains, 1, 2);
        let h = pool.acquire(KeyId::new(1, 1), ThreadId(3), 0).expect("slot");
        assert_eq!(
            chains.append(&mut pool, h),
            Err(KeyError::ResourceExhausted(Resource::Threads))
        );
        // An existing thread can still grow its chain.
        bind(&mut pool, &mut chains, 2, 1);
        assert_eq!(chains.len(ThreadId(1)), 2);
    }

    #[test]
    fn colliding_threads_survive_vacate() {
        let mut pool = NodePool::with_capacity(8);
        let mut chains = ChainTable::new(4);
        // Threads 1, 5 and 9 share home slot 1.
        let a = bind(&mut pool, &mut chains, 1, 1);
        let _b = bind(&mut pool, &mut chains, 1, 5);
        let c = bind(&mut pool, &mut chains, 1, 9);
        chains.unlink(&mut pool, a);
        assert_eq!(chains.iter(&pool, ThreadId(9)).collect::<Vec<_>>(), vec![c]);
        assert_eq!(chains.len(ThreadId(5)), 1);
        // Reclaiming the tombstone keeps thread 9 reachable.
        bind(&mut pool, &mut chains, 2, 13);
        assert_eq!(chains.len(ThreadId(9)), 1);
        assert_eq!(chains.len(ThreadId(13)), 1);
        assert_eq!(chains.threads(), 3);
    }

    #[test]
    fn reserve_then_unreserve_leaves_no_head() {
        let mut chains = ChainTable::new(2);
        chains.reserve(ThreadId(4)).expect("free head");
        assert_eq!(chains.threads(), 1);
        chains.unreserve(ThreadId(4));
        assert_eq!(chains.threads(), 0);
    }
}
