//! Key manager: the public TSD operations.
//!
//! One `parking_lot::Mutex` guards the pool, the registry, the value index
//! and the per-thread chains as a single unit, so no thread ever observes an
//! entry that is in the index but not in its chain (or the reverse). Every
//! operation holds the lock for a bounded O(log n) step and never waits for
//! resources: exhaustion is reported immediately.
//!
//! Destructors run with the lock released, one entry at a time, so they may
//! call back into the manager.

use core::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::PTHREAD_DESTRUCTOR_ITERATIONS;
use crate::chain::ChainTable;
use crate::config::{ConfigError, KeyConfig};
use crate::error::{InvariantViolation, KeyError, Resource};
use crate::index::ValueIndex;
use crate::pool::{NodeHandle, NodePool};
use crate::registry::{Destructor, KeyId, KeyRegistry};
use crate::thread::{HostThreads, ThreadContext, ThreadId};

struct KeyState {
    pool: NodePool,
    registry: KeyRegistry,
    index: ValueIndex,
    chains: ChainTable,
}

impl KeyState {
    /// Drop `h` from the index and free its slot; its chain link must already
    /// be cut. Returns the key and value it held.
    fn retire(&mut self, h: NodeHandle) -> (KeyId, usize) {
        let (key, thread, value) = {
            let e = self.pool.get(h);
            (e.key, e.thread, e.value)
        };
        let removed = self.index.remove(&mut self.pool, key, thread);
        debug_assert_eq!(removed, Some(h), "chained entry missing from index");
        self.registry.drop_binding(key);
        self.pool.release(h);
        (key, value)
    }
}

#[derive(Default)]
struct Counters {
    creates: AtomicU64,
    deletes: AtomicU64,
    sets: AtomicU64,
    updates: AtomicU64,
    gets: AtomicU64,
    exits: AtomicU64,
    destructor_calls: AtomicU64,
    conflicts: AtomicU64,
    exhausted: AtomicU64,
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Counter snapshot plus current occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    pub creates: u64,
    pub deletes: u64,
    pub sets: u64,
    /// `set` calls that rewrote an existing binding in place.
    pub updates: u64,
    pub gets: u64,
    pub exits: u64,
    pub destructor_calls: u64,
    /// Duplicate index inserts absorbed as in-place updates.
    pub conflicts: u64,
    /// Operations refused for lack of keys, pool slots or chain heads.
    pub exhausted: u64,
    pub live_keys: usize,
    pub bindings: usize,
    pub threads: usize,
}

/// Pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    pub capacity: usize,
    pub in_use: usize,
    pub available: usize,
}

/// What a thread-exit teardown did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThreadExit {
    /// Destructor passes that found bindings.
    pub passes: usize,
    /// Bindings released to the pool, including discarded leftovers.
    pub released: usize,
    pub destructors_run: usize,
    /// Bindings still present after the last pass, released without a
    /// destructor call.
    pub discarded: usize,
}

pub struct KeyManager<C: ThreadContext = HostThreads> {
    state: Mutex<KeyState>,
    threads: C,
    config: KeyConfig,
    counters: Counters,
}

impl KeyManager<HostThreads> {
    /// Build a manager for OS threads.
    pub fn new(config: KeyConfig) -> Result<Self, ConfigError> {
        Self::with_context(config, HostThreads)
    }
}

impl<C: ThreadContext> KeyManager<C> {
    /// Build a manager with all storage preallocated.
    pub fn with_context(config: KeyConfig, threads: C) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = KeyState {
            pool: NodePool::with_capacity(config.pool_capacity()),
            registry: KeyRegistry::new(config.max_keys),
            index: ValueIndex::new(),
            chains: ChainTable::new(config.max_threads),
        };
        Ok(Self {
            state: Mutex::new(state),
            threads,
            config,
            counters: Counters::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &KeyConfig {
        &self.config
    }

    #[must_use]
    pub fn context(&self) -> &C {
        &self.threads
    }

    fn exhausted(&self, err: KeyError) -> KeyError {
        bump(&self.counters.exhausted);
        err
    }

    /// `pthread_key_create`.
    pub fn key_create(&self, destructor: Option<Destructor>) -> Result<KeyId, KeyError> {
        let key = self
            .state
            .lock()
            .registry
            .create(destructor)
            .map_err(|e| self.exhausted(e))?;
        bump(&self.counters.creates);
        Ok(key)
    }

    /// `pthread_setspecific` for the executing thread.
    pub fn setspecific(&self, key: KeyId, value: usize) -> Result<(), KeyError> {
        self.setspecific_for(self.threads.current_thread_id(), key, value)
    }

    /// Bind `value` to `key` for `thread`.
    ///
    /// Rewrites an existing binding in place; otherwise takes one pool slot
    /// and links it into the index and the thread's chain.
    pub fn setspecific_for(
        &self,
        thread: ThreadId,
        key: KeyId,
        value: usize,
    ) -> Result<(), KeyError> {
        bump(&self.counters.sets);
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.registry.lookup(key)?;

        if let Some(h) = st.index.find(&st.pool, key, thread) {
            st.pool.get_mut(h).value = value;
            bump(&self.counters.updates);
            return Ok(());
        }

        st.chains.reserve(thread).map_err(|e| self.exhausted(e))?;
        let Some(node) = st.pool.acquire(key, thread, value) else {
            st.chains.unreserve(thread);
            return Err(self.exhausted(KeyError::ResourceExhausted(Resource::Pool)));
        };
        if let Err(existing) = st.index.insert(&mut st.pool, node) {
            st.pool.release(node);
            st.chains.unreserve(thread);
            st.pool.get_mut(existing).value = value;
            bump(&self.counters.conflicts);
            return Ok(());
        }
        if let Err(err) = st.chains.append(&mut st.pool, node) {
            st.index.remove(&mut st.pool, key, thread);
            st.pool.release(node);
            return Err(self.exhausted(err));
        }
        st.registry.add_binding(key);
        Ok(())
    }

    /// `pthread_getspecific` for the executing thread.
    ///
    /// `Ok(None)` means the key is live but unset for this thread.
    pub fn getspecific(&self, key: KeyId) -> Result<Option<usize>, KeyError> {
        self.getspecific_for(self.threads.current_thread_id(), key)
    }

    pub fn getspecific_for(&self, thread: ThreadId, key: KeyId) -> Result<Option<usize>, KeyError> {
        bump(&self.counters.gets);
        let st = self.state.lock();
        st.registry.lookup(key)?;
        Ok(st
            .index
            .find(&st.pool, key, thread)
            .map(|h| st.pool.get(h).value))
    }

    /// `pthread_key_delete`.
    ///
    /// Purges every thread's binding for `key` without running the
    /// destructor, then retires the key.
    pub fn key_delete(&self, key: KeyId) -> Result<(), KeyError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.registry.lookup(key)?;
        while let Some(h) = st.index.first_for_key(&st.pool, key) {
            st.chains.unlink(&mut st.pool, h);
            st.retire(h);
        }
        st.registry.delete(key)?;
        bump(&self.counters.deletes);
        Ok(())
    }

    /// Thread termination hook.
    ///
    /// Runs up to [`PTHREAD_DESTRUCTOR_ITERATIONS`] passes over the thread's
    /// chain. A pass handles the bindings present when it starts, oldest
    /// first: the binding is unlinked and freed under the lock, then its
    /// key's destructor is called with the value if both are non-null.
    /// Bindings a destructor creates are picked up by the next pass; any left
    /// after the last pass are freed without a destructor call.
    pub fn on_thread_exit(&self, thread: ThreadId) -> ThreadExit {
        bump(&self.counters.exits);
        let mut summary = ThreadExit::default();

        for _ in 0..PTHREAD_DESTRUCTOR_ITERATIONS {
            let pending = self.state.lock().chains.len(thread);
            if pending == 0 {
                break;
            }
            summary.passes += 1;
            for _ in 0..pending {
                let (destructor, value) = {
                    let mut guard = self.state.lock();
                    let st = &mut *guard;
                    let Some(h) = st.chains.pop_front(&mut st.pool, thread) else {
                        break;
                    };
                    let (key, value) = st.retire(h);
                    let destructor = st.registry.lookup(key).ok().and_then(|m| m.destructor);
                    (destructor, value)
                };
                summary.released += 1;
                if let Some(destructor) = destructor
                    && value != 0
                {
                    destructor(value);
                    summary.destructors_run += 1;
                    bump(&self.counters.destructor_calls);
                }
            }
        }

        let mut guard = self.state.lock();
        let st = &mut *guard;
        while let Some(h) = st.chains.pop_front(&mut st.pool, thread) {
            st.retire(h);
            summary.released += 1;
            summary.discarded += 1;
        }
        summary
    }

    /// Run the exit hook for the executing thread.
    pub fn exit_current_thread(&self) -> ThreadExit {
        self.on_thread_exit(self.threads.current_thread_id())
    }

    #[must_use]
    pub fn usage(&self) -> PoolUsage {
        let st = self.state.lock();
        PoolUsage {
            capacity: st.pool.capacity(),
            in_use: st.pool.in_use(),
            available: st.pool.available(),
        }
    }

    #[must_use]
    pub fn live_keys(&self) -> usize {
        self.state.lock().registry.live_keys()
    }

    /// Number of bindings held by `thread`.
    #[must_use]
    pub fn bindings_of(&self, thread: ThreadId) -> usize {
        self.state.lock().chains.len(thread)
    }

    /// `thread`'s bindings in chain (destructor) order.
    #[must_use]
    pub fn bindings(&self, thread: ThreadId) -> Vec<(KeyId, usize)> {
        let st = self.state.lock();
        st.chains
            .iter(&st.pool, thread)
            .map(|h| {
                let e = st.pool.get(h);
                (e.key, e.value)
            })
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> KeyStats {
        let c = &self.counters;
        let st = self.state.lock();
        KeyStats {
            creates: c.creates.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            sets: c.sets.load(Ordering::Relaxed),
            updates: c.updates.load(Ordering::Relaxed),
            gets: c.gets.load(Ordering::Relaxed),
            exits: c.exits.load(Ordering::Relaxed),
            destructor_calls: c.destructor_calls.load(Ordering::Relaxed),
            conflicts: c.conflicts.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
            live_keys: st.registry.live_keys(),
            bindings: st.pool.in_use(),
            threads: st.chains.threads(),
        }
    }

    /// Cross-check the pool, index, chains and registry.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let st = self.state.lock();
        let live = st.pool.in_use();
        st.index.check(&st.pool)?;
        if st.index.len() != live {
            return Err(InvariantViolation::IndexCount {
                index: st.index.len(),
                pool: live,
            });
        }
        if st.chains.entries() != live {
            return Err(InvariantViolation::ChainCount {
                chains: st.chains.entries(),
                pool: live,
            });
        }
        for (thread, _) in st.chains.chained_threads() {
            for h in st.chains.iter(&st.pool, thread) {
                let e = st.pool.get(h);
                if e.thread != thread {
                    return Err(InvariantViolation::ChainOwner {
                        node: h.as_u32(),
                        chain_thread: thread.as_u32(),
                        owner: e.thread.as_u32(),
                    });
                }
                if st.index.find(&st.pool, e.key, e.thread) != Some(h) {
                    return Err(InvariantViolation::ChainNotIndexed { node: h.as_u32() });
                }
                if st.registry.lookup(e.key).is_err() {
                    return Err(InvariantViolation::DeadKeyBinding {
                        node: h.as_u32(),
                        key: e.key.as_raw(),
                    });
                }
            }
        }
        for (key, meta) in st.registry.iter_live() {
            let found = st.pool.live().filter(|(_, e)| e.key == key).count() as u32;
            if found != meta.bindings {
                return Err(InvariantViolation::BindingCount {
                    key: key.as_raw(),
                    counted: meta.bindings,
                    found,
                });
            }
        }
        Ok(())
    }
}
