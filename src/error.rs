//! Unified error handling for hippool
//!
//! The pool layer has exactly two non-local failure modes: the device ran out
//! of memory after the full retry protocol, and a free for an address the
//! pool does not own. Everything else coming out of the HIP runtime is
//! opaque and propagates unchanged.

use crate::runtime::HipError;

/// Unified error type for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Device out of memory after cached blocks were released and the
    /// memory-pressure hooks ran
    #[error("out of memory allocating {requested} bytes from the device pool")]
    OutOfMemory { requested: usize },

    /// A free was requested for an address absent from the in-use map
    #[error("cannot free out-of-pool memory at 0x{address:x}")]
    NotPoolOwned { address: usize },

    /// HIP runtime failure other than out-of-memory
    #[error("HIP error: {0}")]
    Hip(#[from] HipError),

    /// Internal lock poisoned - this indicates a bug
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for PoolError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PoolError::LockPoisoned(err.to_string())
    }
}

impl PoolError {
    /// Check if this error is an out-of-memory condition.
    ///
    /// OOM is the only error the caller can meaningfully react to (shrink the
    /// workload, release buffers and retry); the rest indicate bugs or a
    /// broken runtime.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            PoolError::OutOfMemory { .. } => true,
            PoolError::Hip(e) => e.is_out_of_memory(),
            _ => false,
        }
    }
}

/// Result type for pool operations
pub type PoolResult<T> = std::result::Result<T, PoolError>;
