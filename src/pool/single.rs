//! Single-device caching pool
//!
//! The pool owns a slab of chunks, an in-use map keyed by absolute address,
//! and one arena of size bins per stream. malloc serves requests from the
//! smallest sufficient bin (LIFO within a bin), splitting as needed, and
//! falls back to a raw allocation with a staged retry on out-of-memory.
//! free merges the chunk with free same-stream neighbors and re-bins it.
//!
//! Reuse and merging never cross streams: a chunk freed under stream A is
//! only handed back to stream A, so the stream's ordering guarantees the
//! previous user's kernels completed before the new owner touches the bytes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once, Weak};

use crate::error::{PoolError, PoolResult};
use crate::memory::{DeviceMemory, MemoryOwner, MemoryPointer};
use crate::pool::arena::{bin_index, round_up, Arena};
use crate::pool::chunk::{Chunk, ChunkId, ChunkSlab};
use crate::pool::run_pressure_hooks;
use crate::runtime::{default_runtime, DeviceRuntime};
use crate::stream::{current_stream_id, StreamId};

#[derive(Debug, Default)]
struct PoolState {
    chunks: ChunkSlab,
    /// Live chunks keyed by absolute address
    in_use: HashMap<usize, ChunkId>,
    /// Free-chunk bins per stream
    arenas: HashMap<StreamId, Arena>,
}

/// Caching memory pool for a single device.
///
/// Cheap to clone; clones share the pool. The data structures assume one
/// logical caller: the internal mutex exists so drop-driven frees from
/// [`PooledMemory`] are sound, not to make concurrent mutation fast.
#[derive(Clone)]
pub struct SingleDeviceMemoryPool {
    device_id: i32,
    runtime: Arc<dyn DeviceRuntime>,
    state: Arc<Mutex<PoolState>>,
}

impl SingleDeviceMemoryPool {
    /// Pool for the default runtime's currently active device
    pub fn new() -> PoolResult<Self> {
        let runtime = default_runtime();
        let device_id = runtime.get_device()?;
        Ok(Self::with_runtime(runtime, device_id))
    }

    /// Pool for `device_id` on an explicit runtime
    pub fn with_runtime(runtime: Arc<dyn DeviceRuntime>, device_id: i32) -> Self {
        SingleDeviceMemoryPool {
            device_id,
            runtime,
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    /// Device this pool allocates on
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Allocate `size` bytes, reusing a cached chunk when one fits.
    ///
    /// The returned pointer's address is aligned to the allocation unit and
    /// the underlying chunk is tagged with the calling thread's current
    /// stream. Dropping the pointer returns the chunk to this pool.
    pub fn malloc(&self, size: usize) -> PoolResult<MemoryPointer> {
        if size == 0 {
            let empty = DeviceMemory::empty(self.runtime.clone(), self.device_id);
            return Ok(MemoryPointer::new(Arc::new(empty), 0));
        }

        let rounded = round_up(size);
        let bin = bin_index(rounded);
        let stream = current_stream_id();

        if let Some(ptr) = self.malloc_from_bins(rounded, bin, stream)? {
            return Ok(ptr);
        }

        // Cold path: no cached chunk fits
        let parent = Arc::new(self.raw_alloc_with_retry(rounded)?);
        let mut state = self.state.lock()?;
        let cid = state
            .chunks
            .insert(Chunk::new(parent.clone(), 0, rounded, stream));
        let chunk = state.chunks.get_mut(cid);
        chunk.in_use = true;
        let address = chunk.address();
        state.in_use.insert(address, cid);
        drop(state);

        tracing::trace!(
            "pool malloc: new parent of {} bytes at 0x{:x} (stream {:?})",
            rounded,
            address,
            stream
        );
        Ok(self.wrap(parent, address, rounded))
    }

    /// Best-fit scan over the stream's bins, LIFO within a bin
    fn malloc_from_bins(
        &self,
        rounded: usize,
        bin: usize,
        stream: StreamId,
    ) -> PoolResult<Option<MemoryPointer>> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;

        let arena = state.arenas.entry(stream).or_insert_with(Arena::new);
        arena.grow(bin);

        let mut found = None;
        for index in bin..arena.num_bins() {
            if let Some(cid) = arena.pop(index) {
                found = Some(cid);
                break;
            }
        }
        let Some(cid) = found else {
            return Ok(None);
        };

        let (head, tail) = state.chunks.split(cid, rounded);
        if let Some(tail_id) = tail {
            let tail_size = state.chunks.get(tail_id).size;
            state
                .arenas
                .get_mut(&stream)
                .expect("arena vanished mid-malloc")
                .push(bin_index(tail_size), tail_id);
        }

        let chunk = state.chunks.get_mut(head);
        chunk.in_use = true;
        chunk.stream = stream;
        let address = chunk.address();
        let parent = chunk.parent.clone();
        state.in_use.insert(address, head);

        tracing::trace!(
            "pool malloc: reused chunk of {} bytes at 0x{:x} (stream {:?})",
            rounded,
            address,
            stream
        );
        Ok(Some(self.wrap(parent, address, rounded)))
    }

    /// Raw allocation with the staged OOM recovery: release cached whole
    /// blocks, then run memory-pressure hooks, retrying after each stage.
    /// Non-OOM runtime failures propagate unchanged.
    fn raw_alloc_with_retry(&self, size: usize) -> PoolResult<DeviceMemory> {
        match DeviceMemory::new(self.runtime.clone(), self.device_id, size) {
            Ok(mem) => return Ok(mem),
            Err(e) if e.is_out_of_memory() => {
                tracing::debug!("device OOM for {} bytes, releasing cached blocks", size);
            }
            Err(e) => return Err(e.into()),
        }

        self.free_all_blocks()?;
        match DeviceMemory::new(self.runtime.clone(), self.device_id, size) {
            Ok(mem) => return Ok(mem),
            Err(e) if e.is_out_of_memory() => {
                tracing::debug!("device still OOM, running memory-pressure hooks");
            }
            Err(e) => return Err(e.into()),
        }

        run_pressure_hooks();
        match DeviceMemory::new(self.runtime.clone(), self.device_id, size) {
            Ok(mem) => Ok(mem),
            Err(e) if e.is_out_of_memory() => {
                let (pool_used, pool_free) = self.byte_counts().unwrap_or((0, 0));
                let (dev_free, dev_total) = self.runtime.mem_info().unwrap_or((0, 0));
                tracing::warn!(
                    "out of memory allocating {} bytes on device {} \
                     (pool used={} free={}, device free={}/{})",
                    size,
                    self.device_id,
                    pool_used,
                    pool_free,
                    dev_free,
                    dev_total
                );
                Err(PoolError::OutOfMemory { requested: size })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn wrap(&self, parent: Arc<DeviceMemory>, address: usize, size: usize) -> MemoryPointer {
        let owner = PooledMemory {
            pool: Arc::downgrade(&self.state),
            parent,
            address,
            size,
        };
        MemoryPointer::new(Arc::new(owner), 0)
    }

    /// Return every cached chunk that spans its whole parent allocation to
    /// the runtime.
    ///
    /// Chunks that have ever been split stay cached: their siblings may
    /// still be in use, and the parent can only be freed as a whole.
    pub fn free_all_blocks(&self) -> PoolResult<()> {
        let mut guard = self.state.lock()?;
        let PoolState { chunks, arenas, .. } = &mut *guard;

        let mut released = 0usize;
        for arena in arenas.values_mut() {
            for bin in arena.bins_mut() {
                bin.retain(|&cid| {
                    let chunk = chunks.get(cid);
                    if chunk.prev.is_none() && chunk.next.is_none() {
                        chunks.remove(cid);
                        released += 1;
                        false
                    } else {
                        true
                    }
                });
            }
        }
        if released > 0 {
            tracing::debug!(
                "released {} whole cached blocks on device {}",
                released,
                self.device_id
            );
        }
        Ok(())
    }

    /// Deprecated alias for [`free_all_blocks`](Self::free_all_blocks)
    #[deprecated(since = "0.4.0", note = "use free_all_blocks() instead")]
    pub fn free_all_free(&self) -> PoolResult<()> {
        static WARNED: Once = Once::new();
        WARNED.call_once(|| {
            tracing::warn!("free_all_free() is deprecated, use free_all_blocks()");
        });
        self.free_all_blocks()
    }

    /// Number of cached free chunks across all streams
    pub fn n_free_blocks(&self) -> PoolResult<usize> {
        let state = self.state.lock()?;
        Ok(state
            .arenas
            .values()
            .flat_map(|a| a.bins().map(|(_, bin)| bin.len()))
            .sum())
    }

    /// Bytes currently handed out to callers
    pub fn used_bytes(&self) -> PoolResult<usize> {
        Ok(self.byte_counts()?.0)
    }

    /// Bytes cached in free chunks
    pub fn free_bytes(&self) -> PoolResult<usize> {
        Ok(self.byte_counts()?.1)
    }

    /// Total bytes of retained parent allocations (used + free)
    pub fn total_bytes(&self) -> PoolResult<usize> {
        let (used, free) = self.byte_counts()?;
        Ok(used + free)
    }

    fn byte_counts(&self) -> PoolResult<(usize, usize)> {
        let state = self.state.lock()?;
        let used = state
            .in_use
            .values()
            .map(|&cid| state.chunks.get(cid).size)
            .sum();
        let free = state
            .arenas
            .values()
            .flat_map(|a| a.bins().map(|(_, bin)| -> usize {
                bin.iter().map(|&cid| state.chunks.get(cid).size).sum()
            }))
            .sum();
        Ok((used, free))
    }
}

impl std::fmt::Debug for SingleDeviceMemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (used, free) = self.byte_counts().unwrap_or((0, 0));
        f.debug_struct("SingleDeviceMemoryPool")
            .field("device_id", &self.device_id)
            .field("used_bytes", &used)
            .field("free_bytes", &free)
            .finish()
    }
}

/// Return a chunk to its bins, merging with free same-stream neighbors first
fn free_chunk(state: &mut PoolState, address: usize, size: usize) -> PoolResult<()> {
    let cid = state
        .in_use
        .remove(&address)
        .ok_or(PoolError::NotPoolOwned { address })?;

    let chunk = state.chunks.get_mut(cid);
    debug_assert_eq!(chunk.size, size, "freed size disagrees with bookkeeping");
    chunk.in_use = false;
    let stream = chunk.stream;

    let mut cur = cid;

    if let Some(next_id) = state.chunks.get(cur).next {
        let next = state.chunks.get(next_id);
        if !next.in_use && next.stream == stream {
            remove_from_bin(state, stream, next_id);
            cur = state.chunks.merge(cur, next_id);
        }
    }

    if let Some(prev_id) = state.chunks.get(cur).prev {
        let prev = state.chunks.get(prev_id);
        if !prev.in_use && prev.stream == stream {
            remove_from_bin(state, stream, prev_id);
            cur = state.chunks.merge(prev_id, cur);
        }
    }

    let merged_size = state.chunks.get(cur).size;
    state
        .arenas
        .entry(stream)
        .or_insert_with(Arena::new)
        .push(bin_index(merged_size), cur);
    Ok(())
}

fn remove_from_bin(state: &mut PoolState, stream: StreamId, cid: ChunkId) {
    let size = state.chunks.get(cid).size;
    let found = state
        .arenas
        .get_mut(&stream)
        .map(|arena| arena.remove(bin_index(size), cid))
        .unwrap_or(false);
    debug_assert!(found, "free chunk missing from its bin");
}

/// Pool-managed memory backing a [`MemoryPointer`].
///
/// Holds the parent allocation alive and a weak reference to the owning
/// pool; dropping it returns the chunk to the pool. If the pool is already
/// gone the drop degrades to a no-op (the parent allocation is still
/// released once its last chunk reference dies).
pub struct PooledMemory {
    pool: Weak<Mutex<PoolState>>,
    parent: Arc<DeviceMemory>,
    address: usize,
    size: usize,
}

impl MemoryOwner for PooledMemory {
    fn device_id(&self) -> i32 {
        self.parent.device_id()
    }

    fn ptr(&self) -> usize {
        self.address
    }

    fn size(&self) -> usize {
        self.size
    }

    fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        self.parent.runtime()
    }
}

impl Drop for PooledMemory {
    fn drop(&mut self) {
        let Some(state) = self.pool.upgrade() else {
            tracing::debug!(
                "pool dropped before pooled memory at 0x{:x}; skipping chunk return",
                self.address
            );
            return;
        };
        match state.lock() {
            Ok(mut state) => {
                if let Err(e) = free_chunk(&mut state, self.address, self.size) {
                    tracing::error!("failed to return chunk to pool: {}", e);
                }
            }
            Err(e) => {
                tracing::error!("pool lock poisoned during free: {}", e);
            }
        };
    }
}

impl std::fmt::Debug for PooledMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledMemory")
            .field("address", &format_args!("0x{:x}", self.address))
            .field("size", &self.size)
            .field("device", &self.parent.device_id())
            .finish()
    }
}
