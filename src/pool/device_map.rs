//! Multi-device pool façade
//!
//! One lazily constructed [`SingleDeviceMemoryPool`] per device; every call
//! dispatches to the pool of the runtime's currently active device. Nothing
//! is shared across devices.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::alloc::Allocator;
use crate::error::PoolResult;
use crate::memory::MemoryPointer;
use crate::pool::single::SingleDeviceMemoryPool;
use crate::runtime::{default_runtime, DeviceRuntime};

struct MemoryPoolInner {
    runtime: Arc<dyn DeviceRuntime>,
    pools: Mutex<HashMap<i32, SingleDeviceMemoryPool>>,
}

/// Device-dispatching memory pool.
///
/// Cheap to clone; clones share the underlying per-device pools. Install it
/// process-wide with [`crate::set_allocator`] via
/// [`as_allocator`](MemoryPool::as_allocator).
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<MemoryPoolInner>,
}

impl MemoryPool {
    /// Pool over the process default runtime
    pub fn new() -> Self {
        Self::with_runtime(default_runtime())
    }

    /// Pool over an explicit runtime
    pub fn with_runtime(runtime: Arc<dyn DeviceRuntime>) -> Self {
        MemoryPool {
            inner: Arc::new(MemoryPoolInner {
                runtime,
                pools: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The pool for the currently active device, created on first touch
    fn current_pool(&self) -> PoolResult<SingleDeviceMemoryPool> {
        let device = self.inner.runtime.get_device()?;
        let mut pools = self.inner.pools.lock()?;
        Ok(pools
            .entry(device)
            .or_insert_with(|| {
                tracing::debug!("creating memory pool for device {}", device);
                SingleDeviceMemoryPool::with_runtime(self.inner.runtime.clone(), device)
            })
            .clone())
    }

    /// Allocate on the currently active device
    pub fn malloc(&self, size: usize) -> PoolResult<MemoryPointer> {
        self.current_pool()?.malloc(size)
    }

    /// Release cached whole blocks on the currently active device
    pub fn free_all_blocks(&self) -> PoolResult<()> {
        self.current_pool()?.free_all_blocks()
    }

    /// Deprecated alias for [`free_all_blocks`](Self::free_all_blocks)
    #[deprecated(since = "0.4.0", note = "use free_all_blocks() instead")]
    pub fn free_all_free(&self) -> PoolResult<()> {
        let pool = self.current_pool()?;
        #[allow(deprecated)]
        let result = pool.free_all_free();
        result
    }

    /// Cached free chunks on the currently active device
    pub fn n_free_blocks(&self) -> PoolResult<usize> {
        self.current_pool()?.n_free_blocks()
    }

    /// Bytes handed out on the currently active device
    pub fn used_bytes(&self) -> PoolResult<usize> {
        self.current_pool()?.used_bytes()
    }

    /// Bytes cached on the currently active device
    pub fn free_bytes(&self) -> PoolResult<usize> {
        self.current_pool()?.free_bytes()
    }

    /// Retained bytes on the currently active device
    pub fn total_bytes(&self) -> PoolResult<usize> {
        self.current_pool()?.total_bytes()
    }

    /// Adapter for [`crate::set_allocator`]: route all process allocations
    /// through this pool
    pub fn as_allocator(&self) -> Allocator {
        let pool = self.clone();
        Arc::new(move |size| pool.malloc(size))
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;

    fn mock_pool() -> (Arc<MockRuntime>, MemoryPool) {
        let mock = Arc::new(MockRuntime::with_devices(2));
        let rt: Arc<dyn DeviceRuntime> = mock.clone();
        (mock, MemoryPool::with_runtime(rt))
    }

    #[test]
    fn test_dispatches_to_active_device() {
        let (mock, pool) = mock_pool();

        let p0 = pool.malloc(512).unwrap();
        assert_eq!(p0.device_id(), 0);
        assert_eq!(pool.used_bytes().unwrap(), 512);

        mock.set_device(1).unwrap();
        assert_eq!(pool.used_bytes().unwrap(), 0, "device 1 pool is independent");

        let p1 = pool.malloc(1024).unwrap();
        assert_eq!(p1.device_id(), 1);
        assert_eq!(pool.used_bytes().unwrap(), 1024);

        mock.set_device(0).unwrap();
        assert_eq!(pool.used_bytes().unwrap(), 512);
    }

    #[test]
    fn test_per_device_caches_are_independent() {
        let (mock, pool) = mock_pool();

        drop(pool.malloc(512).unwrap());
        assert_eq!(pool.free_bytes().unwrap(), 512);

        mock.set_device(1).unwrap();
        assert_eq!(pool.free_bytes().unwrap(), 0);
        pool.free_all_blocks().unwrap();

        mock.set_device(0).unwrap();
        // Device 0's cache untouched by device 1's release
        assert_eq!(pool.free_bytes().unwrap(), 512);
    }

    #[test]
    fn test_as_allocator_routes_through_pool() {
        let (_mock, pool) = mock_pool();
        let allocate = pool.as_allocator();

        let p = allocate(700).unwrap();
        assert_eq!(p.memory_size(), 1024);
        assert_eq!(pool.used_bytes().unwrap(), 1024);
        drop(p);
        assert_eq!(pool.free_bytes().unwrap(), 1024);
    }
}
