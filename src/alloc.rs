//! Process-wide current-allocator indirection
//!
//! Callers that do not hold a pool reference allocate through a swappable
//! function slot. The default is the non-pooling raw allocator; installing
//! [`MemoryPool::as_allocator`](crate::pool::MemoryPool::as_allocator)
//! activates caching globally. The slot is meant to be written once at
//! startup and read on every allocation.

use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::error::PoolResult;
use crate::memory::{DeviceMemory, MemoryPointer};
use crate::runtime::default_runtime;

/// An allocation function: byte size in, device pointer out
pub type Allocator = Arc<dyn Fn(usize) -> PoolResult<MemoryPointer> + Send + Sync>;

static CURRENT_ALLOCATOR: Lazy<RwLock<Allocator>> =
    Lazy::new(|| RwLock::new(Arc::new(raw_malloc)));

/// Non-pooling allocation straight from the runtime, the default allocator.
///
/// Every call is a synchronous raw device allocation; the memory is returned
/// to the runtime when the pointer drops.
pub fn raw_malloc(size: usize) -> PoolResult<MemoryPointer> {
    let runtime = default_runtime();
    let device = runtime.get_device()?;
    let mem = DeviceMemory::new(runtime, device, size)?;
    Ok(MemoryPointer::new(Arc::new(mem), 0))
}

/// Replace the process-wide allocator.
///
/// Not synchronized against in-flight [`alloc`] calls beyond the slot's own
/// lock; intended to happen once at startup.
pub fn set_allocator(allocator: Allocator) {
    match CURRENT_ALLOCATOR.write() {
        Ok(mut slot) => *slot = allocator,
        Err(e) => tracing::error!("allocator slot poisoned: {}", e),
    }
}

/// Restore the default non-pooling raw allocator
pub fn reset_allocator() {
    set_allocator(Arc::new(raw_malloc));
}

/// Allocate `size` bytes through the current allocator
pub fn alloc(size: usize) -> PoolResult<MemoryPointer> {
    let allocator = CURRENT_ALLOCATOR.read()?.clone();
    allocator(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryPool;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_default_allocator_is_raw() {
        reset_allocator();
        let p = alloc(100).unwrap();
        // Raw path does not round to the allocation unit
        assert_eq!(p.memory_size(), 100);
    }

    #[test]
    #[serial]
    fn test_set_allocator_routes_through_pool() {
        let pool = MemoryPool::new();
        set_allocator(pool.as_allocator());

        let p = alloc(100).unwrap();
        assert_eq!(p.memory_size(), 512, "pooled path rounds to the unit");
        assert_eq!(pool.used_bytes().unwrap(), 512);

        drop(p);
        assert_eq!(pool.free_bytes().unwrap(), 512);

        reset_allocator();
        let q = alloc(100).unwrap();
        assert_eq!(q.memory_size(), 100);
    }

    #[test]
    #[serial]
    fn test_zero_size_alloc() {
        reset_allocator();
        let p = alloc(0).unwrap();
        assert_eq!(p.ptr(), 0);
        assert_eq!(p.memory_size(), 0);
    }
}
