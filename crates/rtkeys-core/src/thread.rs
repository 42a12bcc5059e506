//! Thread identity as seen by the key manager.
//!
//! The thread object manager is external; the key manager only needs the id
//! of the executing thread. [`HostThreads`] numbers OS threads from a global
//! counter, [`ManualThreads`] lets tests and the scenario harness switch the
//! "executing" thread explicitly.

use core::sync::atomic::{AtomicU32, Ordering};

/// Identifier of a kernel thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(pub u32);

impl ThreadId {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Source of the currently executing thread id.
pub trait ThreadContext: Send + Sync {
    fn current_thread_id(&self) -> ThreadId;
}

static NEXT_HOST_TID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static HOST_TID: ThreadId = ThreadId(NEXT_HOST_TID.fetch_add(1, Ordering::Relaxed));
}

/// One id per OS thread, assigned on first use and never reused.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostThreads;

impl ThreadContext for HostThreads {
    fn current_thread_id(&self) -> ThreadId {
        HOST_TID.with(|tid| *tid)
    }
}

/// Explicitly switched executing thread.
#[derive(Debug)]
pub struct ManualThreads {
    current: AtomicU32,
}

impl ManualThreads {
    #[must_use]
    pub const fn new(initial: ThreadId) -> Self {
        Self {
            current: AtomicU32::new(initial.0),
        }
    }

    /// Make `thread` the executing thread.
    pub fn switch_to(&self, thread: ThreadId) {
        self.current.store(thread.0, Ordering::Release);
    }
}

impl Default for ManualThreads {
    fn default() -> Self {
        Self::new(ThreadId(1))
    }
}

impl ThreadContext for ManualThreads {
    fn current_thread_id(&self) -> ThreadId {
        ThreadId(self.current.load(Ordering::Acquire))
    }
}
