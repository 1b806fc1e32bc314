//! HIP runtime error types

use thiserror::Error;

/// `hipErrorOutOfMemory` status code
#[cfg_attr(not(feature = "rocm"), allow(dead_code))]
pub(crate) const HIP_ERROR_OUT_OF_MEMORY: i32 = 2;

/// Errors surfaced by the device runtime.
///
/// Out-of-memory is the one condition the allocator recovers from locally,
/// so it gets its own variant; every other nonzero HIP status is carried
/// opaquely with the failing call named in `context`.
#[derive(Error, Debug, Clone)]
pub enum HipError {
    #[error("device out of memory while allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("{context} failed with code {code}")]
    Runtime { code: i32, context: String },

    #[error("device error: {0}")]
    Device(String),
}

impl HipError {
    /// Map a nonzero HIP status from an allocation call, distinguishing OOM.
    #[cfg_attr(not(feature = "rocm"), allow(dead_code))]
    pub(crate) fn from_alloc_status(code: i32, requested: usize, context: &str) -> Self {
        if code == HIP_ERROR_OUT_OF_MEMORY {
            HipError::OutOfMemory { requested }
        } else {
            HipError::Runtime {
                code,
                context: context.to_string(),
            }
        }
    }

    /// Check if this error is the distinguishable out-of-memory condition
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, HipError::OutOfMemory { .. })
    }
}

/// HIP result type
pub type HipResult<T> = Result<T, HipError>;
