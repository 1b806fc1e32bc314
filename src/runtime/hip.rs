//! FFI-backed HIP runtime

use std::ffi::{c_void, CStr};
use std::ptr;

use crate::runtime::error::{HipError, HipResult};
use crate::runtime::ffi;
use crate::runtime::{DeviceRuntime, MemcpyKind};

/// Get the HIP error string for a status code
fn error_string(code: i32) -> String {
    unsafe {
        let s = ffi::hipGetErrorString(code);
        if s.is_null() {
            format!("unknown error {}", code)
        } else {
            CStr::from_ptr(s).to_string_lossy().into_owned()
        }
    }
}

fn check(code: i32, context: &str) -> HipResult<()> {
    if code != ffi::HIP_SUCCESS {
        tracing::error!("{} failed: {} ({})", context, code, error_string(code));
        return Err(HipError::Runtime {
            code,
            context: context.to_string(),
        });
    }
    Ok(())
}

/// The real ROCm runtime, one thin wrapper per consumed HIP entry point.
///
/// Stateless; the HIP runtime itself tracks the per-thread active device.
#[derive(Debug, Default)]
pub struct HipRuntime;

impl HipRuntime {
    pub fn new() -> Self {
        HipRuntime
    }
}

impl DeviceRuntime for HipRuntime {
    fn malloc(&self, size: usize) -> HipResult<usize> {
        let mut p: *mut c_void = ptr::null_mut();
        let code = unsafe { ffi::hipMalloc(&mut p, size) };
        if code != ffi::HIP_SUCCESS {
            return Err(HipError::from_alloc_status(code, size, "hipMalloc"));
        }
        if p.is_null() {
            return Err(HipError::Device(format!(
                "hipMalloc returned null pointer for {} bytes",
                size
            )));
        }
        tracing::trace!("hipMalloc: {} bytes at {:?}", size, p);
        Ok(p as usize)
    }

    fn free(&self, ptr: usize) -> HipResult<()> {
        check(unsafe { ffi::hipFree(ptr as *mut c_void) }, "hipFree")
    }

    fn memcpy(&self, dst: usize, src: usize, size: usize, kind: MemcpyKind) -> HipResult<()> {
        check(
            unsafe {
                ffi::hipMemcpy(
                    dst as *mut c_void,
                    src as *const c_void,
                    size,
                    kind.as_hip(),
                )
            },
            "hipMemcpy",
        )
    }

    fn memcpy_async(
        &self,
        dst: usize,
        src: usize,
        size: usize,
        kind: MemcpyKind,
        stream: usize,
    ) -> HipResult<()> {
        check(
            unsafe {
                ffi::hipMemcpyAsync(
                    dst as *mut c_void,
                    src as *const c_void,
                    size,
                    kind.as_hip(),
                    stream as *mut c_void,
                )
            },
            "hipMemcpyAsync",
        )
    }

    fn memset(&self, dst: usize, value: u8, size: usize) -> HipResult<()> {
        check(
            unsafe { ffi::hipMemset(dst as *mut c_void, value as i32, size) },
            "hipMemset",
        )
    }

    fn memset_async(&self, dst: usize, value: u8, size: usize, stream: usize) -> HipResult<()> {
        check(
            unsafe {
                ffi::hipMemsetAsync(dst as *mut c_void, value as i32, size, stream as *mut c_void)
            },
            "hipMemsetAsync",
        )
    }

    fn get_device(&self) -> HipResult<i32> {
        let mut device: i32 = -1;
        check(unsafe { ffi::hipGetDevice(&mut device) }, "hipGetDevice")?;
        Ok(device)
    }

    fn set_device(&self, device: i32) -> HipResult<()> {
        check(unsafe { ffi::hipSetDevice(device) }, "hipSetDevice")
    }

    fn can_access_peer(&self, device: i32, peer: i32) -> HipResult<bool> {
        let mut can: i32 = 0;
        check(
            unsafe { ffi::hipDeviceCanAccessPeer(&mut can, device, peer) },
            "hipDeviceCanAccessPeer",
        )?;
        Ok(can != 0)
    }

    fn enable_peer_access(&self, peer: i32) -> HipResult<()> {
        check(
            unsafe { ffi::hipDeviceEnablePeerAccess(peer, 0) },
            "hipDeviceEnablePeerAccess",
        )
    }

    fn stream_create(&self) -> HipResult<usize> {
        let mut s: *mut c_void = ptr::null_mut();
        check(unsafe { ffi::hipStreamCreate(&mut s) }, "hipStreamCreate")?;
        if s.is_null() {
            return Err(HipError::Device(
                "hipStreamCreate returned null pointer".to_string(),
            ));
        }
        Ok(s as usize)
    }

    fn stream_destroy(&self, stream: usize) -> HipResult<()> {
        check(
            unsafe { ffi::hipStreamDestroy(stream as *mut c_void) },
            "hipStreamDestroy",
        )
    }

    fn stream_synchronize(&self, stream: usize) -> HipResult<()> {
        check(
            unsafe { ffi::hipStreamSynchronize(stream as *mut c_void) },
            "hipStreamSynchronize",
        )
    }

    fn mem_info(&self) -> HipResult<(usize, usize)> {
        let mut free: usize = 0;
        let mut total: usize = 0;
        check(
            unsafe { ffi::hipMemGetInfo(&mut free, &mut total) },
            "hipMemGetInfo",
        )?;
        Ok((free, total))
    }
}
