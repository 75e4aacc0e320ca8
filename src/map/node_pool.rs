//! Per-bucket free-node pool
//!
//! The pool manages every node its bucket will ever use. Nodes come from
//! contiguous chunks reserved in the shared heap; chunks double in size,
//! up to [`MAX_GROW_COUNT`](crate::map::MAX_GROW_COUNT) of them, and are
//! never released before the pool is destroyed. Free nodes are chained
//! into one intrusive list through the same `next` field the bucket
//! chain uses, so handing a node out, taking one back, and splicing a
//! whole cleared chain are all O(1).
//!
//! The pool has no lock of its own: every mutation is already serialized
//! by the owning bucket's write lock. The counters are atomics only so
//! table-level statistics can read them without taking that lock; such
//! reads are advisory under concurrent mutation.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::map::{Node, MAX_GROW_COUNT};
use crate::shm::{RegionFlags, ShmHeap, NIL};

/// Intrusive free list plus the chunk bookkeeping for one bucket
#[repr(C)]
pub(crate) struct NodePool<K, V> {
    /// Configured size of the first chunk
    init_size: u32,
    /// Which bucket this pool belongs to; part of the chunk region names
    bucket_index: u32,
    /// Total nodes ever allocated across chunks
    capacity: AtomicU32,
    /// Nodes currently reachable from `head`
    free_entries: AtomicU32,
    /// Chunks allocated so far, at most `MAX_GROW_COUNT`
    chunk_count: AtomicU32,
    /// Size of the next chunk if growth occurs; doubles on each growth
    next_chunk_size: AtomicU32,
    /// Head of the free list, `NIL` when empty
    head: AtomicU32,
    /// Heap offsets of the chunk regions, `NIL` while unallocated
    chunks: [AtomicU32; MAX_GROW_COUNT],
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> NodePool<K, V> {
    /// Initialize a pool in place over zeroed shared memory and allocate
    /// its first chunk (growth failures here are silent, like every
    /// other growth; the pool then starts empty).
    ///
    /// # Safety
    ///
    /// `pool` must point to zero-initialized, properly aligned storage
    /// not yet visible to any other process.
    pub(crate) unsafe fn init(pool: *mut Self, init_size: u32, bucket_index: u32, heap: &ShmHeap) {
        let init_size = init_size.max(1);
        unsafe {
            ptr::addr_of_mut!((*pool).init_size).write(init_size);
            ptr::addr_of_mut!((*pool).bucket_index).write(bucket_index);
            (*pool).next_chunk_size.store(init_size, Ordering::Relaxed);
            (*pool).head.store(NIL, Ordering::Relaxed);
            for chunk in &(*pool).chunks {
                chunk.store(NIL, Ordering::Relaxed);
            }
        }
        let pool = unsafe { &*pool };
        pool.grow(heap);
    }

    /// Take a node off the free list, growing the pool if it is empty.
    /// Returns the node's heap offset, reset and ready to fill, or
    /// `None` when the pool is exhausted and cannot grow further.
    ///
    /// Caller must hold the owning bucket's write lock.
    pub(crate) fn get_node(&self, heap: &ShmHeap) -> Option<u32> {
        if self.head.load(Ordering::Acquire) == NIL {
            self.grow(heap);
        }

        let head = self.head.load(Ordering::Acquire);
        if head == NIL {
            return None;
        }

        let node = unsafe { &*heap.ptr::<Node<K, V>>(head) };
        self.head.store(node.next(), Ordering::Release);
        self.free_entries.fetch_sub(1, Ordering::Relaxed);
        node.reset();
        Some(head)
    }

    /// Push one node back onto the free list. `NIL` is ignored.
    ///
    /// Caller must hold the owning bucket's write lock.
    pub(crate) fn put_node(&self, heap: &ShmHeap, offset: u32) {
        if offset == NIL {
            return;
        }
        let node = unsafe { &*heap.ptr::<Node<K, V>>(offset) };
        node.set_next(self.head.load(Ordering::Acquire));
        self.head.store(offset, Ordering::Release);
        self.free_entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Splice the list `[start..=end]` of `count` nodes onto the free
    /// list in O(1). `NIL` endpoints are ignored.
    ///
    /// Caller must hold the owning bucket's write lock.
    pub(crate) fn put_nodelist(&self, heap: &ShmHeap, start: u32, end: u32, count: u32) {
        if start == NIL || end == NIL {
            return;
        }
        let tail = unsafe { &*heap.ptr::<Node<K, V>>(end) };
        tail.set_next(self.head.load(Ordering::Acquire));
        self.head.store(start, Ordering::Release);
        self.free_entries.fetch_add(count, Ordering::Relaxed);
    }

    /// Allocate the next chunk and thread it onto the free list.
    ///
    /// Fails silently when the chunk cap is reached or the heap cannot
    /// satisfy the reservation; the caller observes the failure as an
    /// empty pool. Caller must hold the owning bucket's write lock.
    fn grow(&self, heap: &ShmHeap) {
        let chunk_index = self.chunk_count.load(Ordering::Relaxed);
        if chunk_index as usize >= MAX_GROW_COUNT {
            return;
        }

        let count = self.next_chunk_size.load(Ordering::Relaxed);
        let node_size = mem::size_of::<Node<K, V>>();
        let name = format!("NodePool_FreeList_{}_{}", self.bucket_index, chunk_index);
        let region = match heap.reserve(&name, count as usize * node_size, RegionFlags::empty()) {
            Ok(region) => region,
            Err(e) => {
                log::debug!(
                    "node pool growth failed for bucket {}: {}",
                    self.bucket_index,
                    e
                );
                return;
            }
        };

        let capacity = self.capacity.load(Ordering::Relaxed);
        let stride = node_size as u32;
        for i in 0..count {
            let offset = region.offset + i * stride;
            let next = if i + 1 < count {
                offset + stride
            } else {
                NIL
            };
            unsafe { Node::<K, V>::init_at(heap.ptr(offset), capacity + i, next) };
        }

        self.put_nodelist(
            heap,
            region.offset,
            region.offset + (count - 1) * stride,
            count,
        );
        self.chunks[chunk_index as usize].store(region.offset, Ordering::Relaxed);
        self.capacity.store(capacity + count, Ordering::Relaxed);
        self.chunk_count.store(chunk_index + 1, Ordering::Relaxed);
        self.next_chunk_size.store(count << 1, Ordering::Relaxed);

        log::debug!(
            "bucket {} pool grew by {} nodes to capacity {}",
            self.bucket_index,
            count,
            capacity + count
        );
    }

    /// Release every chunk region and zero the bookkeeping. Only the
    /// primary process calls this, at teardown.
    pub(crate) fn destroy(&self, heap: &ShmHeap) {
        for chunk in &self.chunks {
            let offset = chunk.swap(NIL, Ordering::Relaxed);
            if offset != NIL {
                heap.free(offset);
            }
        }
        self.capacity.store(0, Ordering::Relaxed);
        self.free_entries.store(0, Ordering::Relaxed);
        self.chunk_count.store(0, Ordering::Relaxed);
        self.next_chunk_size.store(self.init_size, Ordering::Relaxed);
        self.head.store(NIL, Ordering::Release);
    }

    /// Total nodes ever allocated (lock-free, advisory)
    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Nodes currently on the free list (lock-free, advisory)
    #[inline]
    pub(crate) fn free_entries(&self) -> u32 {
        self.free_entries.load(Ordering::Relaxed)
    }

    /// Chunks allocated so far (lock-free, advisory)
    #[inline]
    pub(crate) fn chunk_count(&self) -> u32 {
        self.chunk_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;
    use tempfile::TempDir;

    type TestPool = NodePool<u64, u64>;

    fn test_heap(dir: &TempDir) -> ShmHeap {
        ShmHeap::create(&dir.path().join("pool_heap"), 1024 * 1024, 64).unwrap()
    }

    fn new_pool(init_size: u32, heap: &ShmHeap) -> Box<TestPool> {
        let mut slot: Box<MaybeUninit<TestPool>> = Box::new(MaybeUninit::zeroed());
        unsafe {
            NodePool::init(slot.as_mut_ptr(), init_size, 0, heap);
            Box::from_raw(Box::into_raw(slot) as *mut TestPool)
        }
    }

    #[test]
    fn test_first_chunk_is_eager() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);
        let pool = new_pool(4, &heap);

        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.free_entries(), 4);
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn test_get_and_put_cycle() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);
        let pool = new_pool(4, &heap);

        let a = pool.get_node(&heap).unwrap();
        let b = pool.get_node(&heap).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.free_entries(), 2);

        pool.put_node(&heap, a);
        assert_eq!(pool.free_entries(), 3);

        // LIFO recycling: the node just returned comes back first.
        assert_eq!(pool.get_node(&heap).unwrap(), a);
    }

    #[test]
    fn test_get_node_resets_state() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);
        let pool = new_pool(2, &heap);

        let off = pool.get_node(&heap).unwrap();
        let node = unsafe { &*heap.ptr::<Node<u64, u64>>(off) };
        node.fill(1, 2, 0xabcd);
        pool.put_node(&heap, off);

        let again = pool.get_node(&heap).unwrap();
        assert_eq!(again, off);
        let node = unsafe { &*heap.ptr::<Node<u64, u64>>(again) };
        assert_eq!(node.sig(), 0);
        assert_eq!(node.next(), NIL);
    }

    #[test]
    fn test_geometric_growth_law() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);
        let pool = new_pool(16, &heap);

        // Drain each chunk and check capacity = init * (2^chunks - 1).
        let mut taken = Vec::new();
        for expected_chunks in 1..=MAX_GROW_COUNT as u32 {
            let expected_capacity = 16 * ((1u32 << expected_chunks) - 1);
            while pool.free_entries() > 0 {
                taken.push(pool.get_node(&heap).unwrap());
            }
            assert_eq!(pool.capacity(), expected_capacity);
            assert_eq!(pool.chunk_count(), expected_chunks);
            if expected_chunks < MAX_GROW_COUNT as u32 {
                // Next take triggers the next chunk.
                taken.push(pool.get_node(&heap).unwrap());
            }
        }

        // All five chunks exist; the pool cannot grow again.
        assert_eq!(pool.capacity(), 16 * 31);
        while pool.free_entries() > 0 {
            taken.push(pool.get_node(&heap).unwrap());
        }
        assert!(pool.get_node(&heap).is_none());
        assert_eq!(taken.len(), 16 * 31);

        // Indexes are stable, unique, and dense.
        let mut indices: Vec<u32> = taken
            .iter()
            .map(|&off| unsafe { &*heap.ptr::<Node<u64, u64>>(off) }.index())
            .collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 16 * 31);
        assert_eq!(indices[0], 0);
        assert_eq!(*indices.last().unwrap(), 16 * 31 - 1);
    }

    #[test]
    fn test_put_nodelist_splices() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);
        let pool = new_pool(8, &heap);

        // Build a little chain a -> b -> c by hand.
        let a = pool.get_node(&heap).unwrap();
        let b = pool.get_node(&heap).unwrap();
        let c = pool.get_node(&heap).unwrap();
        unsafe {
            (*heap.ptr::<Node<u64, u64>>(a)).set_next(b);
            (*heap.ptr::<Node<u64, u64>>(b)).set_next(c);
            (*heap.ptr::<Node<u64, u64>>(c)).set_next(NIL);
        }
        assert_eq!(pool.free_entries(), 5);

        pool.put_nodelist(&heap, a, c, 3);
        assert_eq!(pool.free_entries(), 8);

        // The spliced nodes come back in order from the head.
        assert_eq!(pool.get_node(&heap).unwrap(), a);
        assert_eq!(pool.get_node(&heap).unwrap(), b);
        assert_eq!(pool.get_node(&heap).unwrap(), c);
    }

    #[test]
    fn test_nil_arguments_ignored() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);
        let pool = new_pool(2, &heap);

        pool.put_node(&heap, NIL);
        pool.put_nodelist(&heap, NIL, NIL, 5);
        assert_eq!(pool.free_entries(), 2);
    }

    #[test]
    fn test_growth_absorbs_heap_exhaustion() {
        let dir = TempDir::new().unwrap();
        // A heap far too small for the pool's first chunk.
        let heap = ShmHeap::create(&dir.path().join("tiny"), 512, 16).unwrap();
        let pool = new_pool(64 * 1024, &heap);

        // The eager first growth failed silently; the pool is usable but
        // empty, and every request keeps failing the same quiet way.
        assert_eq!(pool.capacity(), 0);
        assert_eq!(pool.chunk_count(), 0);
        assert!(pool.get_node(&heap).is_none());
        assert!(pool.get_node(&heap).is_none());
    }

    #[test]
    fn test_destroy_releases_regions() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);
        let pool = new_pool(4, &heap);
        assert_eq!(heap.region_count(), 1);

        pool.destroy(&heap);
        assert_eq!(heap.region_count(), 0);
        assert_eq!(pool.capacity(), 0);
        assert_eq!(pool.free_entries(), 0);
        assert_eq!(pool.chunk_count(), 0);

        // The chunk names were recycled with the directory entries, so a
        // destroyed pool can even start over.
        assert!(pool.get_node(&heap).is_some());
        assert_eq!(pool.capacity(), 4);
    }
}
