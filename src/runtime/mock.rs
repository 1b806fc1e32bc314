//! Host-emulating mock runtime for unit testing (llama.cpp dummy-backend
//! pattern).
//!
//! No GPU memory is touched: allocations hand out fake device addresses from
//! a monotone address space, copies and memsets are no-ops, and every call is
//! counted so tests can assert on runtime traffic. Allocation failures can be
//! rigged (forced OOM, capacity limits) to exercise the pool's retry
//! protocol.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::runtime::error::{HipError, HipResult};
use crate::runtime::{DeviceRuntime, MemcpyKind};

/// Fake device addresses start here and are kept 512-byte aligned so pool
/// alignment invariants hold on the mock exactly as they do on hardware.
const FAKE_BASE: usize = 0x2_0000;

#[derive(Debug, Default)]
struct MockState {
    next_addr: usize,
    next_stream: usize,
    /// Live fake allocations, address -> size
    allocations: HashMap<usize, usize>,
    allocated_bytes: usize,
    /// Optional device capacity; allocations beyond it fail with OOM
    capacity: Option<usize>,
    /// Forced failures consumed by the next malloc calls, front first
    forced_oom: VecDeque<()>,
    current_device: i32,
    device_count: i32,
    peer_access_allowed: bool,
    stats: MockStats,
}

/// Call counters for asserting on runtime traffic
#[derive(Debug, Default, Clone)]
pub struct MockStats {
    pub malloc_calls: usize,
    pub free_calls: usize,
    pub memcpy_calls: usize,
    pub memcpy_async_calls: usize,
    pub memset_calls: usize,
    pub memset_async_calls: usize,
    pub set_device_calls: usize,
    /// can_access_peer queries per (device, peer) pair
    pub peer_queries: HashMap<(i32, i32), usize>,
    /// enable_peer_access calls recorded as (active device, peer)
    pub peer_enables: Vec<(i32, i32)>,
}

/// Mock device runtime
#[derive(Debug)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    /// Single fake device, unlimited capacity
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    /// Fake multi-GPU host with `device_count` devices
    pub fn with_devices(device_count: i32) -> Self {
        MockRuntime {
            state: Mutex::new(MockState {
                next_addr: FAKE_BASE,
                next_stream: 1,
                device_count,
                peer_access_allowed: true,
                ..MockState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panic while holding the mock lock is already a failed test
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rig the next `n` malloc calls to fail with out-of-memory
    pub fn fail_next_allocs(&self, n: usize) {
        let mut s = self.lock();
        for _ in 0..n {
            s.forced_oom.push_back(());
        }
    }

    /// Cap the fake device at `bytes`; live allocations beyond it get OOM
    pub fn set_capacity(&self, bytes: Option<usize>) {
        self.lock().capacity = bytes;
    }

    /// Answer returned by can_access_peer for every pair
    pub fn set_peer_access_allowed(&self, allowed: bool) {
        self.lock().peer_access_allowed = allowed;
    }

    pub fn stats(&self) -> MockStats {
        self.lock().stats.clone()
    }

    /// Number of live fake allocations
    pub fn live_allocations(&self) -> usize {
        self.lock().allocations.len()
    }

    /// Bytes currently held by live fake allocations
    pub fn allocated_bytes(&self) -> usize {
        self.lock().allocated_bytes
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRuntime for MockRuntime {
    fn malloc(&self, size: usize) -> HipResult<usize> {
        let mut s = self.lock();
        s.stats.malloc_calls += 1;

        if s.forced_oom.pop_front().is_some() {
            return Err(HipError::OutOfMemory { requested: size });
        }
        if let Some(cap) = s.capacity {
            if s.allocated_bytes + size > cap {
                return Err(HipError::OutOfMemory { requested: size });
            }
        }

        let addr = s.next_addr;
        // Keep fake addresses 512-aligned
        s.next_addr += (size + 511) & !511;
        s.allocations.insert(addr, size);
        s.allocated_bytes += size;
        Ok(addr)
    }

    fn free(&self, ptr: usize) -> HipResult<()> {
        let mut s = self.lock();
        s.stats.free_calls += 1;
        match s.allocations.remove(&ptr) {
            Some(size) => {
                s.allocated_bytes -= size;
                Ok(())
            }
            None => Err(HipError::Device(format!(
                "mock free of unknown pointer 0x{:x}",
                ptr
            ))),
        }
    }

    fn memcpy(&self, _dst: usize, _src: usize, _size: usize, _kind: MemcpyKind) -> HipResult<()> {
        self.lock().stats.memcpy_calls += 1;
        Ok(())
    }

    fn memcpy_async(
        &self,
        _dst: usize,
        _src: usize,
        _size: usize,
        _kind: MemcpyKind,
        _stream: usize,
    ) -> HipResult<()> {
        self.lock().stats.memcpy_async_calls += 1;
        Ok(())
    }

    fn memset(&self, _dst: usize, _value: u8, _size: usize) -> HipResult<()> {
        self.lock().stats.memset_calls += 1;
        Ok(())
    }

    fn memset_async(&self, _dst: usize, _value: u8, _size: usize, _stream: usize) -> HipResult<()> {
        self.lock().stats.memset_async_calls += 1;
        Ok(())
    }

    fn get_device(&self) -> HipResult<i32> {
        Ok(self.lock().current_device)
    }

    fn set_device(&self, device: i32) -> HipResult<()> {
        let mut s = self.lock();
        s.stats.set_device_calls += 1;
        if device < 0 || device >= s.device_count {
            return Err(HipError::Device(format!(
                "mock set_device({}) with {} devices",
                device, s.device_count
            )));
        }
        s.current_device = device;
        Ok(())
    }

    fn can_access_peer(&self, device: i32, peer: i32) -> HipResult<bool> {
        let mut s = self.lock();
        *s.stats.peer_queries.entry((device, peer)).or_insert(0) += 1;
        Ok(device != peer && s.peer_access_allowed)
    }

    fn enable_peer_access(&self, peer: i32) -> HipResult<()> {
        let mut s = self.lock();
        let device = s.current_device;
        s.stats.peer_enables.push((device, peer));
        Ok(())
    }

    fn stream_create(&self) -> HipResult<usize> {
        let mut s = self.lock();
        let ptr = FAKE_BASE + s.next_stream;
        s.next_stream += 1;
        Ok(ptr)
    }

    fn stream_destroy(&self, _stream: usize) -> HipResult<()> {
        Ok(())
    }

    fn stream_synchronize(&self, _stream: usize) -> HipResult<()> {
        Ok(())
    }

    fn mem_info(&self) -> HipResult<(usize, usize)> {
        let s = self.lock();
        let total = s.capacity.unwrap_or(usize::MAX);
        Ok((total.saturating_sub(s.allocated_bytes), total))
    }
}
