//! RAII active-device switching
//!
//! The HIP active device is per-thread state. Peer-access setup has to run
//! with the owning device active and must restore the previous device on
//! every exit path, so the switch is expressed as a guard whose `Drop` does
//! the restore.

use std::sync::Arc;

use crate::runtime::{DeviceRuntime, HipResult};

/// Switches the calling thread's active device for the guard's lifetime.
///
/// Restores the previously active device on drop, including on error paths
/// that unwind past the guard.
pub struct DeviceGuard {
    runtime: Arc<dyn DeviceRuntime>,
    prev: i32,
    device: i32,
}

impl DeviceGuard {
    pub fn new(runtime: &Arc<dyn DeviceRuntime>, device: i32) -> HipResult<Self> {
        let prev = runtime.get_device()?;
        if prev != device {
            tracing::trace!("switching active device {} -> {}", prev, device);
            runtime.set_device(device)?;
        }
        Ok(DeviceGuard {
            runtime: runtime.clone(),
            prev,
            device,
        })
    }

    /// The device this guard made active
    pub fn device(&self) -> i32 {
        self.device
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if self.prev != self.device {
            if let Err(e) = self.runtime.set_device(self.prev) {
                tracing::error!("failed to restore active device {}: {}", self.prev, e);
            }
        }
    }
}
