//! Caching device-memory pool
//!
//! Raw device allocations synchronize the host, so the pool recycles freed
//! regions instead of returning them to the runtime. Freed chunks are binned
//! by rounded size per execution stream, split on demand, and merged with
//! adjacent free same-stream neighbors; the runtime is only consulted when
//! no cached chunk fits, with a staged release-and-retry protocol on
//! out-of-memory.

mod arena;
mod chunk;
mod device_map;
mod single;

use std::sync::Mutex;

use once_cell::sync::Lazy;

pub use arena::{bin_index, round_up, ALLOCATION_UNIT};
pub use device_map::MemoryPool;
pub use single::{PooledMemory, SingleDeviceMemoryPool};

/// Hooks run between the second and third allocation attempts of the OOM
/// retry protocol, after the pool's own cached blocks have been released.
///
/// The hook must not call back into a pool (the calling pool may hold no
/// lock, but re-entrant allocation from a pressure hook is a cycle).
static PRESSURE_HOOKS: Lazy<Mutex<Vec<Box<dyn Fn() + Send>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Register a process-wide memory-pressure hook.
///
/// Hooks give the host a chance to drop references that keep device memory
/// alive (caches, staging buffers) before the allocator gives up with
/// out-of-memory.
pub fn register_pressure_hook(hook: impl Fn() + Send + 'static) {
    if let Ok(mut hooks) = PRESSURE_HOOKS.lock() {
        hooks.push(Box::new(hook));
    }
}

pub(crate) fn run_pressure_hooks() {
    if let Ok(hooks) = PRESSURE_HOOKS.lock() {
        if !hooks.is_empty() {
            tracing::debug!("running {} memory-pressure hooks", hooks.len());
        }
        for hook in hooks.iter() {
            hook();
        }
    }
}
