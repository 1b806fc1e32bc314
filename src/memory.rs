//! Raw device allocations and memory pointers
//!
//! [`DeviceMemory`] owns exactly one physical device allocation and releases
//! it on drop. [`MemoryPointer`] is the value type the rest of the system
//! consumes: an owning handle plus an absolute offset, with pointer
//! arithmetic and the copy/memset surface. Whether the owner is a raw
//! allocation or pool-managed memory is hidden behind [`MemoryOwner`].

use std::collections::HashSet;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::device::DeviceGuard;
use crate::error::PoolResult;
use crate::runtime::{DeviceRuntime, HipResult, MemcpyKind};
use crate::stream::{current_stream, Stream};

/// An owner of device memory a [`MemoryPointer`] can point into.
///
/// Implemented by [`DeviceMemory`] (unpooled path) and by the pool's
/// `PooledMemory` (pooled path); the pointer type is agnostic to which.
pub trait MemoryOwner: Send + Sync {
    /// Device the memory lives on
    fn device_id(&self) -> i32;
    /// Base device address; 0 for zero-size memory
    fn ptr(&self) -> usize;
    /// Size of the owned region in bytes
    fn size(&self) -> usize;
    /// Runtime the memory was allocated on
    fn runtime(&self) -> &Arc<dyn DeviceRuntime>;
}

/// One physical device allocation, released exactly once on drop.
///
/// A zero-size allocation holds address 0 and issues no runtime call in
/// either direction.
#[derive(Debug)]
pub struct DeviceMemory {
    device_id: i32,
    ptr: usize,
    size: usize,
    runtime: Arc<dyn DeviceRuntime>,
}

impl DeviceMemory {
    /// Allocate `size` bytes on `device_id` via the runtime
    pub fn new(runtime: Arc<dyn DeviceRuntime>, device_id: i32, size: usize) -> HipResult<Self> {
        let ptr = if size == 0 { 0 } else { runtime.malloc(size)? };
        tracing::trace!(
            "DeviceMemory: allocated {} bytes at 0x{:x} on device {}",
            size,
            ptr,
            device_id
        );
        Ok(DeviceMemory {
            device_id,
            ptr,
            size,
            runtime,
        })
    }

    /// A zero-size allocation; no runtime call is made
    pub fn empty(runtime: Arc<dyn DeviceRuntime>, device_id: i32) -> Self {
        DeviceMemory {
            device_id,
            ptr: 0,
            size: 0,
            runtime,
        }
    }
}

impl MemoryOwner for DeviceMemory {
    fn device_id(&self) -> i32 {
        self.device_id
    }

    fn ptr(&self) -> usize {
        self.ptr
    }

    fn size(&self) -> usize {
        self.size
    }

    fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        if self.ptr != 0 {
            if let Err(e) = self.runtime.free(self.ptr) {
                tracing::error!("failed to free device memory at 0x{:x}: {}", self.ptr, e);
            }
        }
    }
}

/// Pairs of (device, peer) whose accessibility has been examined, positive
/// or negative. At most one can_access_peer query per pair per process.
static PEER_ACCESS_CHECKED: Lazy<Mutex<HashSet<(i32, i32)>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

/// Enable access from `device` to `peer`'s memory, once per pair.
///
/// Unavailable peer access is silent; the subsequent copy relies on unified
/// addressing and the runtime itself rejects paths that are truly unusable.
/// The active device is switched to `device` for the enablement call and
/// restored on every exit path.
pub(crate) fn ensure_peer_access(
    runtime: &Arc<dyn DeviceRuntime>,
    device: i32,
    peer: i32,
) -> PoolResult<()> {
    let mut checked = PEER_ACCESS_CHECKED.lock()?;
    if !checked.insert((device, peer)) {
        return Ok(());
    }

    if !runtime.can_access_peer(device, peer)? {
        tracing::debug!("peer access {} -> {} unavailable", device, peer);
        return Ok(());
    }

    let _guard = DeviceGuard::new(runtime, device)?;
    runtime.enable_peer_access(peer)?;
    tracing::debug!("enabled peer access {} -> {}", device, peer);
    Ok(())
}

#[cfg(test)]
pub(crate) fn reset_peer_access_checked() {
    PEER_ACCESS_CHECKED.lock().unwrap().clear();
}

/// Source operand for [`MemoryPointer::copy_from`]
pub enum CopySource<'a> {
    Device(&'a MemoryPointer),
    Host(&'a [u8]),
}

impl<'a> From<&'a MemoryPointer> for CopySource<'a> {
    fn from(p: &'a MemoryPointer) -> Self {
        CopySource::Device(p)
    }
}

impl<'a> From<&'a [u8]> for CopySource<'a> {
    fn from(buf: &'a [u8]) -> Self {
        CopySource::Host(buf)
    }
}

/// A device pointer: an owning memory handle plus an absolute offset.
///
/// This is the allocator's public return type. Cloning shares the owner;
/// the underlying memory is released (or returned to its pool) when the
/// last pointer into it drops.
#[derive(Clone)]
pub struct MemoryPointer {
    owner: Arc<dyn MemoryOwner>,
    offset: usize,
}

impl MemoryPointer {
    /// Wrap `owner` at byte `offset`.
    ///
    /// A non-zero offset into zero-address memory is a programmer error.
    pub fn new(owner: Arc<dyn MemoryOwner>, offset: usize) -> Self {
        assert!(
            owner.ptr() > 0 || offset == 0,
            "non-zero offset {} into zero-size memory",
            offset
        );
        assert!(
            offset <= owner.size(),
            "offset {} out of bounds for {}-byte memory",
            offset,
            owner.size()
        );
        MemoryPointer { owner, offset }
    }

    /// Absolute device address
    pub fn ptr(&self) -> usize {
        self.owner.ptr() + self.offset
    }

    /// Offset from the owner's base
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Device the pointed-to memory lives on
    pub fn device_id(&self) -> i32 {
        self.owner.device_id()
    }

    /// Size of the whole owned region (not the remainder past the offset)
    pub fn memory_size(&self) -> usize {
        self.owner.size()
    }

    fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        self.owner.runtime()
    }

    fn stream_ptr(stream: Option<&Stream>) -> usize {
        match stream {
            Some(s) => s.as_ptr(),
            None => current_stream().as_ptr(),
        }
    }

    /// Synchronous device-to-device copy of `size` bytes from `src`.
    ///
    /// Cross-device sources get peer access set up first (idempotent,
    /// process-wide cache).
    pub fn copy_from_device(&self, src: &MemoryPointer, size: usize) -> PoolResult<()> {
        if size == 0 {
            return Ok(());
        }
        ensure_peer_access(self.runtime(), src.device_id(), self.device_id())?;
        self.runtime()
            .memcpy(self.ptr(), src.ptr(), size, MemcpyKind::Default)?;
        Ok(())
    }

    /// Stream-ordered device-to-device copy; `None` uses the current stream
    pub fn copy_from_device_async(
        &self,
        src: &MemoryPointer,
        size: usize,
        stream: Option<&Stream>,
    ) -> PoolResult<()> {
        if size == 0 {
            return Ok(());
        }
        ensure_peer_access(self.runtime(), src.device_id(), self.device_id())?;
        self.runtime().memcpy_async(
            self.ptr(),
            src.ptr(),
            size,
            MemcpyKind::Default,
            Self::stream_ptr(stream),
        )?;
        Ok(())
    }

    /// Synchronous host-to-device copy of the whole slice
    pub fn copy_from_host<T: Copy>(&self, data: &[T]) -> PoolResult<()> {
        let size = std::mem::size_of_val(data);
        if size == 0 {
            return Ok(());
        }
        self.runtime().memcpy(
            self.ptr(),
            data.as_ptr() as usize,
            size,
            MemcpyKind::HostToDevice,
        )?;
        Ok(())
    }

    /// Stream-ordered host-to-device copy.
    ///
    /// The host slice must be pinned for the copy to be truly asynchronous;
    /// this is not verified.
    pub fn copy_from_host_async<T: Copy>(
        &self,
        data: &[T],
        stream: Option<&Stream>,
    ) -> PoolResult<()> {
        let size = std::mem::size_of_val(data);
        if size == 0 {
            return Ok(());
        }
        self.runtime().memcpy_async(
            self.ptr(),
            data.as_ptr() as usize,
            size,
            MemcpyKind::HostToDevice,
            Self::stream_ptr(stream),
        )?;
        Ok(())
    }

    /// Synchronous device-to-host copy filling the whole slice
    pub fn copy_to_host<T: Copy>(&self, out: &mut [T]) -> PoolResult<()> {
        let size = std::mem::size_of_val(out);
        if size == 0 {
            return Ok(());
        }
        self.runtime().memcpy(
            out.as_mut_ptr() as usize,
            self.ptr(),
            size,
            MemcpyKind::DeviceToHost,
        )?;
        Ok(())
    }

    /// Stream-ordered device-to-host copy.
    ///
    /// The host slice must be pinned for the copy to be truly asynchronous;
    /// this is not verified.
    pub fn copy_to_host_async<T: Copy>(
        &self,
        out: &mut [T],
        stream: Option<&Stream>,
    ) -> PoolResult<()> {
        let size = std::mem::size_of_val(out);
        if size == 0 {
            return Ok(());
        }
        self.runtime().memcpy_async(
            out.as_mut_ptr() as usize,
            self.ptr(),
            size,
            MemcpyKind::DeviceToHost,
            Self::stream_ptr(stream),
        )?;
        Ok(())
    }

    /// Copy `size` bytes from a device pointer or a host buffer
    pub fn copy_from<'a>(&self, src: impl Into<CopySource<'a>>, size: usize) -> PoolResult<()> {
        match src.into() {
            CopySource::Device(p) => self.copy_from_device(p, size),
            CopySource::Host(buf) => {
                assert!(size <= buf.len(), "copy size {} exceeds host buffer", size);
                self.copy_from_host(&buf[..size])
            }
        }
    }

    /// Stream-ordered variant of [`copy_from`](Self::copy_from)
    pub fn copy_from_async<'a>(
        &self,
        src: impl Into<CopySource<'a>>,
        size: usize,
        stream: Option<&Stream>,
    ) -> PoolResult<()> {
        match src.into() {
            CopySource::Device(p) => self.copy_from_device_async(p, size, stream),
            CopySource::Host(buf) => {
                assert!(size <= buf.len(), "copy size {} exceeds host buffer", size);
                self.copy_from_host_async(&buf[..size], stream)
            }
        }
    }

    /// Fill `size` bytes with `value`
    pub fn memset(&self, value: u8, size: usize) -> PoolResult<()> {
        if size == 0 {
            return Ok(());
        }
        self.runtime().memset(self.ptr(), value, size)?;
        Ok(())
    }

    /// Stream-ordered byte fill; `None` uses the current stream
    pub fn memset_async(&self, value: u8, size: usize, stream: Option<&Stream>) -> PoolResult<()> {
        if size == 0 {
            return Ok(());
        }
        self.runtime()
            .memset_async(self.ptr(), value, size, Self::stream_ptr(stream))?;
        Ok(())
    }
}

impl std::fmt::Debug for MemoryPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPointer")
            .field("device", &self.owner.device_id())
            .field("ptr", &format_args!("0x{:x}", self.ptr()))
            .field("offset", &self.offset)
            .field("memory_size", &self.owner.size())
            .finish()
    }
}

impl Add<usize> for MemoryPointer {
    type Output = MemoryPointer;

    fn add(self, rhs: usize) -> MemoryPointer {
        MemoryPointer::new(self.owner, self.offset + rhs)
    }
}

impl Add<usize> for &MemoryPointer {
    type Output = MemoryPointer;

    fn add(self, rhs: usize) -> MemoryPointer {
        MemoryPointer::new(self.owner.clone(), self.offset + rhs)
    }
}

impl AddAssign<usize> for MemoryPointer {
    fn add_assign(&mut self, rhs: usize) {
        let offset = self.offset + rhs;
        assert!(
            offset <= self.owner.size(),
            "offset {} out of bounds for {}-byte memory",
            offset,
            self.owner.size()
        );
        self.offset = offset;
    }
}

impl Sub<usize> for MemoryPointer {
    type Output = MemoryPointer;

    fn sub(self, rhs: usize) -> MemoryPointer {
        let offset = self
            .offset
            .checked_sub(rhs)
            .expect("pointer arithmetic underflow");
        MemoryPointer::new(self.owner, offset)
    }
}

impl Sub<usize> for &MemoryPointer {
    type Output = MemoryPointer;

    fn sub(self, rhs: usize) -> MemoryPointer {
        let offset = self
            .offset
            .checked_sub(rhs)
            .expect("pointer arithmetic underflow");
        MemoryPointer::new(self.owner.clone(), offset)
    }
}

impl SubAssign<usize> for MemoryPointer {
    fn sub_assign(&mut self, rhs: usize) {
        self.offset = self
            .offset
            .checked_sub(rhs)
            .expect("pointer arithmetic underflow");
    }
}
