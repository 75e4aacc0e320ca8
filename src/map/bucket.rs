//! One slot of the hash table
//!
//! A bucket owns a singly-linked chain of occupied nodes, the node pool
//! those nodes come from, and the readers-writer lock that serializes
//! everything: lookups walk the chain under the read lock; insert,
//! erase, update and clear run under the write lock, which also covers
//! every pool mutation (the pool has no lock of its own).
//!
//! Lock order is bucket before node, never the reverse, and no operation
//! touches a second bucket. The chain keeps the most recently inserted
//! node at the head; lookups do not reorder it (reordering would need
//! the write lock and would serialize readers).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::map::{Node, NodePool, ShmSafe};
use crate::shm::{ShmHeap, NIL};
use crate::sync::RwSpinLock;

/// A lockable chain of occupied nodes plus its embedded pool
#[repr(C)]
pub(crate) struct Bucket<K, V> {
    lock: RwSpinLock,
    size: AtomicU32,
    head: AtomicU32,
    pool: NodePool<K, V>,
}

impl<K, V> Bucket<K, V> {
    /// Initialize a bucket in place over zeroed shared memory.
    ///
    /// # Safety
    ///
    /// `bucket` must point to zero-initialized, properly aligned storage
    /// not yet visible to any other process.
    pub(crate) unsafe fn init(bucket: *mut Self, index: u32, pool_chunk: u32, heap: &ShmHeap) {
        unsafe {
            (*bucket).head.store(NIL, Ordering::Relaxed);
            NodePool::init(
                std::ptr::addr_of_mut!((*bucket).pool),
                pool_chunk,
                index,
                heap,
            );
        }
    }

    /// Chain length (lock-free, advisory)
    #[inline]
    pub(crate) fn size(&self) -> u32 {
        self.size.load(Ordering::Relaxed)
    }

    /// The embedded node pool
    #[inline]
    pub(crate) fn pool(&self) -> &NodePool<K, V> {
        &self.pool
    }

    /// Splice the whole chain back onto the pool in one O(1) operation
    /// (aside from the walk that finds the tail) and reset the bucket.
    pub(crate) fn clear(&self, heap: &ShmHeap) {
        let _w = self.lock.write_lock();

        let head = self.head.load(Ordering::Acquire);
        if head == NIL {
            return;
        }

        let mut tail = head;
        loop {
            let node = unsafe { &*heap.ptr::<Node<K, V>>(tail) };
            let next = node.next();
            if next == NIL {
                break;
            }
            tail = next;
        }

        let count = self.size.load(Ordering::Relaxed);
        self.pool.put_nodelist(heap, head, tail, count);
        self.head.store(NIL, Ordering::Release);
        self.size.store(0, Ordering::Relaxed);
    }

    /// Tear down the bucket's pool. Primary-only, at destruction.
    pub(crate) fn destroy(&self, heap: &ShmHeap) {
        let _w = self.lock.write_lock();
        self.head.store(NIL, Ordering::Release);
        self.size.store(0, Ordering::Relaxed);
        self.pool.destroy(heap);
    }
}

impl<K: ShmSafe + Eq, V: ShmSafe> Bucket<K, V> {
    /// Insert a binding unless the key is already present.
    ///
    /// Returns `false` without mutating anything on a duplicate key or
    /// when the pool is exhausted.
    pub(crate) fn insert(&self, heap: &ShmHeap, sig: u32, key: K, value: V) -> bool {
        let _w = self.lock.write_lock();

        let head = self.head.load(Ordering::Acquire);
        let mut offset = head;
        while offset != NIL {
            let node = unsafe { &*heap.ptr::<Node<K, V>>(offset) };
            if node.sig() == sig && unsafe { node.key_ref() } == &key {
                return false;
            }
            offset = node.next();
        }

        let Some(node_offset) = self.pool.get_node(heap) else {
            return false;
        };
        let node = unsafe { &*heap.ptr::<Node<K, V>>(node_offset) };
        node.fill(key, value, sig);
        node.set_next(head);
        self.head.store(node_offset, Ordering::Release);
        self.size.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Find a binding and copy its value out.
    ///
    /// Runs entirely under the read lock; the value copy additionally
    /// holds the node's read lock.
    pub(crate) fn lookup(&self, heap: &ShmHeap, sig: u32, key: &K) -> Option<V> {
        let _r = self.lock.read_lock();

        let mut offset = self.head.load(Ordering::Acquire);
        while offset != NIL {
            let node = unsafe { &*heap.ptr::<Node<K, V>>(offset) };
            if node.sig() == sig && unsafe { node.key_ref() } == key {
                return Some(node.read_value());
            }
            offset = node.next();
        }
        None
    }

    /// Remove a binding, returning its value, and recycle the node.
    pub(crate) fn erase(&self, heap: &ShmHeap, sig: u32, key: &K) -> Option<V> {
        let _w = self.lock.write_lock();

        let mut prev = NIL;
        let mut offset = self.head.load(Ordering::Acquire);
        while offset != NIL {
            let node = unsafe { &*heap.ptr::<Node<K, V>>(offset) };
            if node.sig() == sig && unsafe { node.key_ref() } == key {
                let next = node.next();
                if prev == NIL {
                    self.head.store(next, Ordering::Release);
                } else {
                    unsafe { &*heap.ptr::<Node<K, V>>(prev) }.set_next(next);
                }
                let value = node.read_value();
                node.set_next(NIL);
                self.size.fetch_sub(1, Ordering::Relaxed);
                self.pool.put_node(heap, offset);
                return Some(value);
            }
            prev = offset;
            offset = node.next();
        }
        None
    }

    /// Apply `modifier` to the stored value of `key` under the node's
    /// write lock (taken after the bucket's write lock, never before).
    ///
    /// The modifier must not reenter the map.
    pub(crate) fn update<P, F: FnOnce(&mut V, P)>(
        &self,
        heap: &ShmHeap,
        sig: u32,
        key: &K,
        params: P,
        modifier: F,
    ) -> bool {
        let _w = self.lock.write_lock();

        let mut offset = self.head.load(Ordering::Acquire);
        while offset != NIL {
            let node = unsafe { &*heap.ptr::<Node<K, V>>(offset) };
            if node.sig() == sig && unsafe { node.key_ref() } == key {
                node.update_value(|value| modifier(value, params));
                return true;
            }
            offset = node.next();
        }
        false
    }

    /// Collect the diagnostic indexes along the chain, head first.
    /// Used by the table's report writer.
    pub(crate) fn chain_indexes(&self, heap: &ShmHeap) -> Vec<u32> {
        let _r = self.lock.read_lock();

        let mut indexes = Vec::new();
        let mut offset = self.head.load(Ordering::Acquire);
        while offset != NIL {
            let node = unsafe { &*heap.ptr::<Node<K, V>>(offset) };
            indexes.push(node.index());
            offset = node.next();
        }
        indexes
    }
}
