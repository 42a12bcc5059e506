//! Error taxonomy for key management operations.
//!
//! Every error is returned synchronously to the caller. The POSIX wrapper
//! layer maps them to errno values through [`KeyError::errno`].

use thiserror::Error;

/// Bounded resource that ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// The key namespace is full.
    Keys,
    /// The value entry pool is empty.
    Pool,
    /// No per-thread chain head is free.
    Threads,
}

impl Resource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Keys => "keys",
            Self::Pool => "pool",
            Self::Threads => "threads",
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a public key manager operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("{0} exhausted")]
    ResourceExhausted(Resource),
    #[error("invalid key {0:#010x}")]
    InvalidKey(u32),
    /// The index reported a duplicate pair after a negative probe.
    #[error("transient index conflict")]
    TransientConflict,
}

impl KeyError {
    /// POSIX errno for this error.
    ///
    /// Key namespace exhaustion is `EAGAIN` (as `pthread_key_create` reports
    /// it); pool and thread-table exhaustion are `ENOMEM`.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::ResourceExhausted(Resource::Keys) => libc::EAGAIN,
            Self::ResourceExhausted(_) => libc::ENOMEM,
            Self::InvalidKey(_) => libc::EINVAL,
            Self::TransientConflict => libc::EAGAIN,
        }
    }
}

/// Structural inconsistency found by [`crate::KeyManager::check_invariants`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("index out of order at node {node}")]
    IndexOrder { node: u32 },
    #[error("index unbalanced at node {node}: left height {left}, right height {right}")]
    IndexBalance { node: u32, left: u8, right: u8 },
    #[error("index holds {index} entries but pool has {pool} live slots")]
    IndexCount { index: usize, pool: usize },
    #[error("chains hold {chains} entries but pool has {pool} live slots")]
    ChainCount { chains: usize, pool: usize },
    #[error("node {node} is in the chain of thread {chain_thread} but owned by thread {owner}")]
    ChainOwner {
        node: u32,
        chain_thread: u32,
        owner: u32,
    },
    #[error("node {node} is chained but missing from the index")]
    ChainNotIndexed { node: u32 },
    #[error("node {node} belongs to dead key {key:#010x}")]
    DeadKeyBinding { node: u32, key: u32 },
    #[error("key {key:#010x} counts {counted} bindings but {found} are indexed")]
    BindingCount { key: u32, counted: u32, found: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(
            KeyError::ResourceExhausted(Resource::Pool).errno(),
            libc::ENOMEM
        );
        assert_eq!(
            KeyError::ResourceExhausted(Resource::Threads).errno(),
            libc::ENOMEM
        );
        assert_eq!(
            KeyError::ResourceExhausted(Resource::Keys).errno(),
            libc::EAGAIN
        );
        assert_eq!(KeyError::InvalidKey(7).errno(), libc::EINVAL);
        assert_eq!(KeyError::TransientConflict.errno(), libc::EAGAIN);
    }

    #[test]
    fn display_names_resource() {
        let msg = KeyError::ResourceExhausted(Resource::Pool).to_string();
        assert_eq!(msg, "pool exhausted");
        assert_eq!(KeyError::InvalidKey(0x10).to_string(), "invalid key 0x00000010");
    }
}
