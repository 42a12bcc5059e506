//! # rtkeys-core
//!
//! Thread-specific data (TSD) key management for a real-time kernel.
//!
//! Implements the semantics of `pthread_key_create`, `pthread_setspecific`,
//! `pthread_getspecific` and `pthread_key_delete`, plus the thread-exit hook
//! that runs key destructors. All storage is preallocated when the
//! [`KeyManager`] is built; the operation paths never touch the allocator.
//!
//! ## Layout
//!
//! - [`pool`]: fixed-capacity arena of value entries with an intrusive free list.
//! - [`registry`]: bounded key namespace with destructors and generations.
//! - [`index`]: intrusive AVL tree over `(key, thread)` stored in the pool slots.
//! - [`chain`]: per-thread insertion-ordered lists of entries for exit teardown.
//! - [`manager`]: the orchestrator, one lock around all of the above.

#![deny(unsafe_code)]

pub mod chain;
pub mod config;
pub mod error;
pub mod index;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod thread;

pub use config::{ConfigError, KeyConfig};
pub use error::{InvariantViolation, KeyError, Resource};
pub use manager::{KeyManager, KeyStats, PoolUsage, ThreadExit};
pub use pool::NodeHandle;
pub use registry::{Destructor, KeyId, KeyMeta};
pub use thread::{HostThreads, ManualThreads, ThreadContext, ThreadId};

/// Minimum number of keys POSIX requires an implementation to support.
pub const PTHREAD_KEYS_MAX: usize = 128;

/// Maximum destructor passes on thread exit (POSIX requires >= 4).
pub const PTHREAD_DESTRUCTOR_ITERATIONS: usize = 4;
