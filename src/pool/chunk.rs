//! Chunk bookkeeping: contiguous subranges of a parent allocation
//!
//! Chunks live in a slab and reference each other by index, so the per-parent
//! neighbor list (a doubly-linked chain sorted by offset with contiguous
//! coverage) needs no cyclic ownership. Splitting and merging splice that
//! chain; the bins and the in-use map hold chunk ids, never chunks.

use std::sync::Arc;

use crate::memory::{DeviceMemory, MemoryOwner};
use crate::pool::arena::ALLOCATION_UNIT;
use crate::stream::StreamId;

/// Index of a chunk in its pool's slab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ChunkId(usize);

/// A contiguous subrange of a parent raw allocation
#[derive(Debug)]
pub(crate) struct Chunk {
    /// Parent allocation this chunk is carved out of
    pub parent: Arc<DeviceMemory>,
    /// Byte offset into the parent
    pub offset: usize,
    /// Size in bytes, always >= 1 and a multiple of the allocation unit
    pub size: usize,
    /// Stream the chunk was last allocated under; reuse and merging stay
    /// within this stream's arena
    pub stream: StreamId,
    pub in_use: bool,
    /// Previous chunk in the parent's neighbor chain (lower offset)
    pub prev: Option<ChunkId>,
    /// Next chunk in the parent's neighbor chain (higher offset)
    pub next: Option<ChunkId>,
}

impl Chunk {
    pub fn new(parent: Arc<DeviceMemory>, offset: usize, size: usize, stream: StreamId) -> Self {
        assert!(size >= 1, "chunk size must be at least 1");
        assert!(
            offset + size <= parent.size(),
            "chunk [{}, {}) out of parent bounds {}",
            offset,
            offset + size,
            parent.size()
        );
        Chunk {
            parent,
            offset,
            size,
            stream,
            in_use: false,
            prev: None,
            next: None,
        }
    }

    /// Absolute device address of the chunk's first byte
    pub fn address(&self) -> usize {
        self.parent.ptr() + self.offset
    }
}

/// Slab of chunks with free-slot recycling
#[derive(Debug, Default)]
pub(crate) struct ChunkSlab {
    slots: Vec<Option<Chunk>>,
    free_slots: Vec<usize>,
}

impl ChunkSlab {
    pub fn new() -> Self {
        ChunkSlab::default()
    }

    pub fn insert(&mut self, chunk: Chunk) -> ChunkId {
        match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx] = Some(chunk);
                ChunkId(idx)
            }
            None => {
                self.slots.push(Some(chunk));
                ChunkId(self.slots.len() - 1)
            }
        }
    }

    pub fn remove(&mut self, id: ChunkId) -> Chunk {
        let chunk = self.slots[id.0].take().expect("chunk slot already empty");
        self.free_slots.push(id.0);
        chunk
    }

    pub fn get(&self, id: ChunkId) -> &Chunk {
        self.slots[id.0].as_ref().expect("stale chunk id")
    }

    pub fn get_mut(&mut self, id: ChunkId) -> &mut Chunk {
        self.slots[id.0].as_mut().expect("stale chunk id")
    }

    /// Number of live chunks
    pub fn len(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    /// Iterate over live chunks
    pub fn iter(&self) -> impl Iterator<Item = (ChunkId, &Chunk)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|c| (ChunkId(i), c)))
    }

    /// Split a free chunk so its head covers exactly `size` bytes.
    ///
    /// Returns the head id and, when the chunk was larger than `size`, the
    /// id of the new tail chunk spliced in after it. The tail inherits the
    /// head's stream tag; the caller is responsible for binning it.
    pub fn split(&mut self, id: ChunkId, size: usize) -> (ChunkId, Option<ChunkId>) {
        let (parent, offset, old_size, stream, old_next) = {
            let c = self.get(id);
            assert!(!c.in_use, "cannot split an in-use chunk");
            assert!(size >= 1 && size <= c.size, "split size {} out of range", size);
            assert!(
                size % ALLOCATION_UNIT == 0,
                "split size {} not a multiple of the allocation unit",
                size
            );
            (c.parent.clone(), c.offset, c.size, c.stream, c.next)
        };

        if size == old_size {
            return (id, None);
        }

        let mut tail = Chunk::new(parent, offset + size, old_size - size, stream);
        tail.prev = Some(id);
        tail.next = old_next;
        let tail_id = self.insert(tail);

        let head = self.get_mut(id);
        head.size = size;
        head.next = Some(tail_id);

        if let Some(next_id) = old_next {
            self.get_mut(next_id).prev = Some(tail_id);
        }

        (id, Some(tail_id))
    }

    /// Merge free chunk `b` into its free predecessor `a`.
    ///
    /// Both must be free, adjacent (`a.next == b`), share a stream tag and a
    /// parent. The caller removes both from their bins beforehand and re-bins
    /// the returned chunk.
    pub fn merge(&mut self, a: ChunkId, b: ChunkId) -> ChunkId {
        let removed = self.remove(b);
        let head = self.get_mut(a);

        assert_eq!(head.next, Some(b), "merge of non-adjacent chunks");
        assert!(!head.in_use && !removed.in_use, "merge of in-use chunk");
        assert_eq!(head.stream, removed.stream, "merge across streams");
        assert!(
            Arc::ptr_eq(&head.parent, &removed.parent),
            "merge across parent allocations"
        );
        debug_assert_eq!(head.offset + head.size, removed.offset);

        head.size += removed.size;
        head.next = removed.next;

        if let Some(next_id) = removed.next {
            self.get_mut(next_id).prev = Some(a);
        }
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{DeviceRuntime, MockRuntime};

    fn parent(size: usize) -> Arc<DeviceMemory> {
        let rt: Arc<dyn DeviceRuntime> = Arc::new(MockRuntime::new());
        Arc::new(DeviceMemory::new(rt, 0, size).unwrap())
    }

    #[test]
    fn test_split_whole_chunk_is_identity() {
        let mut slab = ChunkSlab::new();
        let id = slab.insert(Chunk::new(parent(1024), 0, 1024, StreamId::NULL));

        let (head, tail) = slab.split(id, 1024);
        assert_eq!(head, id);
        assert!(tail.is_none());
        assert_eq!(slab.len(), 1);
    }

    #[test]
    fn test_split_creates_contiguous_tail() {
        let mut slab = ChunkSlab::new();
        let p = parent(2048);
        let base = p.ptr();
        let id = slab.insert(Chunk::new(p, 0, 2048, StreamId::NULL));

        let (head, tail) = slab.split(id, 512);
        let tail = tail.unwrap();

        let h = slab.get(head);
        let t = slab.get(tail);
        assert_eq!(h.size, 512);
        assert_eq!(h.offset, 0);
        assert_eq!(h.address(), base);
        assert_eq!(t.offset, 512);
        assert_eq!(t.size, 1536);
        assert_eq!(t.address(), base + 512);
        assert_eq!(h.next, Some(tail));
        assert_eq!(t.prev, Some(head));
        assert_eq!(t.next, None);
        assert_eq!(t.stream, h.stream);
    }

    #[test]
    fn test_split_fixes_outward_links() {
        let mut slab = ChunkSlab::new();
        let p = parent(2048);
        let id = slab.insert(Chunk::new(p, 0, 2048, StreamId::NULL));

        let (a, b) = slab.split(id, 512);
        let b = b.unwrap();
        let (b, c) = slab.split(b, 512);
        let c = c.unwrap();

        // a <-> b <-> c
        assert_eq!(slab.get(a).next, Some(b));
        assert_eq!(slab.get(b).prev, Some(a));
        assert_eq!(slab.get(b).next, Some(c));
        assert_eq!(slab.get(c).prev, Some(b));
        assert_eq!(slab.get(c).size, 1024);
    }

    #[test]
    #[should_panic(expected = "in-use")]
    fn test_split_in_use_panics() {
        let mut slab = ChunkSlab::new();
        let id = slab.insert(Chunk::new(parent(1024), 0, 1024, StreamId::NULL));
        slab.get_mut(id).in_use = true;
        slab.split(id, 512);
    }

    #[test]
    #[should_panic(expected = "multiple of the allocation unit")]
    fn test_split_misaligned_panics() {
        let mut slab = ChunkSlab::new();
        let id = slab.insert(Chunk::new(parent(1024), 0, 1024, StreamId::NULL));
        slab.split(id, 100);
    }

    #[test]
    fn test_merge_restores_span_and_links() {
        let mut slab = ChunkSlab::new();
        let p = parent(2048);
        let id = slab.insert(Chunk::new(p, 0, 2048, StreamId::NULL));

        let (a, b) = slab.split(id, 512);
        let b = b.unwrap();
        let (b, c) = slab.split(b, 512);
        let c = c.unwrap();

        let merged = slab.merge(a, b);
        assert_eq!(merged, a);
        let m = slab.get(merged);
        assert_eq!(m.offset, 0);
        assert_eq!(m.size, 1024);
        assert_eq!(m.next, Some(c));
        assert_eq!(slab.get(c).prev, Some(merged));
        assert_eq!(slab.len(), 2);
    }

    #[test]
    fn test_merge_back_to_whole_parent() {
        let mut slab = ChunkSlab::new();
        let id = slab.insert(Chunk::new(parent(2048), 0, 2048, StreamId::NULL));

        let (a, b) = slab.split(id, 1024);
        let merged = slab.merge(a, b.unwrap());

        let m = slab.get(merged);
        assert_eq!(m.size, 2048);
        assert_eq!(m.prev, None);
        assert_eq!(m.next, None);
        assert_eq!(slab.len(), 1);
    }

    #[test]
    fn test_slab_recycles_slots() {
        let mut slab = ChunkSlab::new();
        let p = parent(2048);
        let a = slab.insert(Chunk::new(p.clone(), 0, 1024, StreamId::NULL));
        let _b = slab.insert(Chunk::new(p.clone(), 1024, 1024, StreamId::NULL));

        slab.remove(a);
        assert_eq!(slab.len(), 1);
        let c = slab.insert(Chunk::new(p, 0, 1024, StreamId::NULL));
        assert_eq!(c, a);
        assert_eq!(slab.len(), 2);
    }
}
