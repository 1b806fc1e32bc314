//! HIP stream wrapper and the thread-local current stream
//!
//! Streams are the pool's reuse-safety key: a chunk freed under stream A is
//! only handed back to allocations on stream A, so the runtime's stream
//! ordering fences the previous user's work without explicit
//! synchronization.
//!
//! Stream identity is a process-unique id assigned at construction, not the
//! raw handle value. Two streams that happen to share a null handle are
//! still distinct; the shared default stream is the single object with id 0.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::runtime::{DeviceRuntime, HipResult};

/// Process-unique stream identity, the arena key inside the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Identity of the shared default stream
    pub const NULL: StreamId = StreamId(0);
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct StreamInner {
    id: StreamId,
    ptr: usize,
    /// None for the null stream, which is never destroyed
    runtime: Option<Arc<dyn DeviceRuntime>>,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if self.ptr != 0 {
            if let Some(rt) = &self.runtime {
                if let Err(e) = rt.stream_destroy(self.ptr) {
                    tracing::error!("failed to destroy stream {:?}: {}", self.id, e);
                }
            }
        }
    }
}

/// HIP stream handle
///
/// `Arc`-backed so clones share one underlying handle; the raw stream is
/// destroyed when the last clone drops.
#[derive(Debug, Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

static NULL_STREAM: Lazy<Stream> = Lazy::new(|| Stream {
    inner: Arc::new(StreamInner {
        id: StreamId::NULL,
        ptr: 0,
        runtime: None,
    }),
});

thread_local! {
    static CURRENT_STREAM: RefCell<Stream> = RefCell::new(Stream::null());
    static STREAM_STACK: RefCell<Vec<Stream>> = const { RefCell::new(Vec::new()) };
}

impl Stream {
    /// Create a new stream on the given runtime
    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> HipResult<Self> {
        let ptr = runtime.stream_create()?;
        let id = StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed));
        tracing::debug!("created stream {:?} (handle 0x{:x})", id, ptr);
        Ok(Stream {
            inner: Arc::new(StreamInner {
                id,
                ptr,
                runtime: Some(runtime),
            }),
        })
    }

    /// The shared default (null) stream
    pub fn null() -> Self {
        NULL_STREAM.clone()
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    /// Raw stream handle for async runtime calls
    pub fn as_ptr(&self) -> usize {
        self.inner.ptr
    }

    pub fn is_null(&self) -> bool {
        self.inner.id == StreamId::NULL
    }

    /// Wait for the stream to complete all queued work
    pub fn synchronize(&self) -> HipResult<()> {
        match &self.inner.runtime {
            Some(rt) => rt.stream_synchronize(self.inner.ptr),
            None => Ok(()),
        }
    }

    /// Make this stream current for the enclosing scope.
    ///
    /// The previous current stream is restored when the returned guard
    /// drops; scopes nest.
    pub fn activate(&self) -> StreamScope {
        STREAM_STACK.with(|stack| {
            let prev = CURRENT_STREAM.with(|cur| cur.replace(self.clone()));
            stack.borrow_mut().push(prev);
        });
        StreamScope {
            _not_send: PhantomData,
        }
    }

    /// Make this stream current with no scope to restore the previous one
    pub fn use_current(&self) {
        CURRENT_STREAM.with(|cur| *cur.borrow_mut() = self.clone());
    }
}

/// Restores the previously current stream on drop
pub struct StreamScope {
    // Thread-local discipline; the scope must drop on the thread it was
    // opened on.
    _not_send: PhantomData<*const ()>,
}

impl Drop for StreamScope {
    fn drop(&mut self) {
        STREAM_STACK.with(|stack| {
            if let Some(prev) = stack.borrow_mut().pop() {
                CURRENT_STREAM.with(|cur| *cur.borrow_mut() = prev);
            }
        });
    }
}

/// The calling thread's current stream (the null stream by default)
pub fn current_stream() -> Stream {
    CURRENT_STREAM.with(|cur| cur.borrow().clone())
}

/// Identity of the calling thread's current stream
pub fn current_stream_id() -> StreamId {
    CURRENT_STREAM.with(|cur| cur.borrow().id())
}
