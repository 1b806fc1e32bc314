//! Device runtime seam
//!
//! The pool consumes a deliberately small slice of the HIP runtime: raw
//! malloc/free, memcpy/memset (sync and stream-ordered), device selection,
//! peer access, and stream handles. That surface is expressed as the
//! [`DeviceRuntime`] trait so the allocator logic can run against the real
//! FFI-backed runtime on a ROCm machine or against the host-emulating
//! [`MockRuntime`] everywhere else.

mod error;
#[cfg(feature = "rocm")]
mod ffi;
#[cfg(feature = "rocm")]
mod hip;
pub mod mock;

use std::sync::Arc;

use once_cell::sync::Lazy;

pub use error::{HipError, HipResult};
#[cfg(feature = "rocm")]
pub use hip::HipRuntime;
pub use mock::MockRuntime;

/// Direction of a memory copy, matching the HIP `hipMemcpyKind` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemcpyKind {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    /// Let the runtime infer the direction from the pointers (unified
    /// addressing). Used for device-to-device copies that may cross devices.
    Default,
}

impl MemcpyKind {
    /// The raw `hipMemcpyKind` value
    pub fn as_hip(self) -> i32 {
        match self {
            MemcpyKind::HostToDevice => 1,
            MemcpyKind::DeviceToHost => 2,
            MemcpyKind::DeviceToDevice => 3,
            MemcpyKind::Default => 4,
        }
    }
}

/// The GPU runtime surface the allocator consumes.
///
/// Addresses are opaque `usize` values (device pointers on the real runtime,
/// fake offsets on the mock). Implementations are internally synchronized;
/// all methods take `&self`.
pub trait DeviceRuntime: Send + Sync + std::fmt::Debug {
    /// Synchronous raw device allocation. Out-of-memory must surface as
    /// [`HipError::OutOfMemory`]; any other failure is opaque.
    fn malloc(&self, size: usize) -> HipResult<usize>;

    /// Release a raw device allocation obtained from [`malloc`](Self::malloc).
    fn free(&self, ptr: usize) -> HipResult<()>;

    fn memcpy(&self, dst: usize, src: usize, size: usize, kind: MemcpyKind) -> HipResult<()>;

    fn memcpy_async(
        &self,
        dst: usize,
        src: usize,
        size: usize,
        kind: MemcpyKind,
        stream: usize,
    ) -> HipResult<()>;

    fn memset(&self, dst: usize, value: u8, size: usize) -> HipResult<()>;

    fn memset_async(&self, dst: usize, value: u8, size: usize, stream: usize) -> HipResult<()>;

    /// Device active for the calling thread
    fn get_device(&self) -> HipResult<i32>;

    fn set_device(&self, device: i32) -> HipResult<()>;

    /// Whether `device` can map `peer`'s memory
    fn can_access_peer(&self, device: i32, peer: i32) -> HipResult<bool>;

    /// Enable access from the active device to `peer`'s memory
    fn enable_peer_access(&self, peer: i32) -> HipResult<()>;

    /// Create an execution stream, returning its raw handle
    fn stream_create(&self) -> HipResult<usize>;

    fn stream_destroy(&self, stream: usize) -> HipResult<()>;

    fn stream_synchronize(&self, stream: usize) -> HipResult<()>;

    /// Free and total device memory in bytes
    fn mem_info(&self) -> HipResult<(usize, usize)>;
}

static DEFAULT_RUNTIME: Lazy<Arc<dyn DeviceRuntime>> = Lazy::new(|| -> Arc<dyn DeviceRuntime> {
    #[cfg(feature = "rocm")]
    return Arc::new(HipRuntime::new());
    #[cfg(not(feature = "rocm"))]
    Arc::new(MockRuntime::new())
});

/// The process-wide default runtime.
///
/// With the `rocm` feature this is the FFI-backed [`HipRuntime`]; otherwise a
/// shared [`MockRuntime`] so the crate stays exercisable on hosts without a
/// GPU. Pools and the default allocator bind to this unless given an explicit
/// runtime handle.
pub fn default_runtime() -> Arc<dyn DeviceRuntime> {
    DEFAULT_RUNTIME.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memcpy_kind_values_match_hip() {
        assert_eq!(MemcpyKind::HostToDevice.as_hip(), 1);
        assert_eq!(MemcpyKind::DeviceToHost.as_hip(), 2);
        assert_eq!(MemcpyKind::DeviceToDevice.as_hip(), 3);
        assert_eq!(MemcpyKind::Default.as_hip(), 4);
    }

    #[test]
    fn test_default_runtime_is_shared() {
        let a = default_runtime();
        let b = default_runtime();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
