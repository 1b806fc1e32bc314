//! hippool - Caching device-memory pool for AMD GPUs
//!
//! Raw HIP allocations synchronize the host, which makes workloads that
//! interleave many short-lived allocations with kernel launches pay a
//! device round trip per allocation. This crate amortizes that cost with a
//! per-device, per-stream caching pool: freed regions are binned by rounded
//! size, split on demand, merged with adjacent free neighbors, and only
//! returned to the runtime under memory pressure.
//!
//! # Quick start
//!
//! ```ignore
//! use hippool::{alloc, set_allocator, MemoryPool};
//!
//! // Route all allocations through a caching pool
//! let pool = MemoryPool::new();
//! set_allocator(pool.as_allocator());
//!
//! let ptr = alloc(4096)?;
//! ptr.memset(0, 4096)?;
//! // Dropping the pointer returns the memory to the pool, not the device
//! ```
//!
//! Built against the real HIP runtime with the `rocm` feature; without it
//! the crate runs on a host-emulating mock runtime.

#![allow(clippy::too_many_arguments)] // FFI entry points take many args
#![allow(clippy::missing_safety_doc)] // FFI bindings documented at module level

pub mod alloc;
pub mod device;
pub mod error;
pub mod logging;
pub mod memory;
pub mod pool;
pub mod runtime;
pub mod stream;

pub use alloc::{alloc, raw_malloc, reset_allocator, set_allocator, Allocator};
pub use device::DeviceGuard;
pub use error::{PoolError, PoolResult};
pub use logging::init_logging;
pub use memory::{CopySource, DeviceMemory, MemoryOwner, MemoryPointer};
pub use pool::{
    bin_index, register_pressure_hook, round_up, MemoryPool, PooledMemory,
    SingleDeviceMemoryPool, ALLOCATION_UNIT,
};
pub use runtime::{default_runtime, DeviceRuntime, HipError, HipResult, MemcpyKind, MockRuntime};
pub use stream::{current_stream, current_stream_id, Stream, StreamId, StreamScope};

#[cfg(feature = "rocm")]
pub use runtime::HipRuntime;
