//! A single key/value node
//!
//! Nodes are carved out of pool chunks inside the shared heap and are in
//! exactly one of two states at any time: *free* (reachable from a pool
//! head through `next`) or *occupied* (reachable from a bucket head
//! through `next`). Transitions happen only under the owning bucket's
//! write lock. While free, the key, value and signature are undefined.
//!
//! The node carries its own small readers-writer lock scoped to the
//! value field alone: value updates take it for writing, lookup copies
//! the value out under it for reading. With the current bucket-level
//! discipline the bucket lock already excludes those paths from each
//! other, but keeping the node lock preserves the option of a read path
//! that skips the bucket lock entirely.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::shm::NIL;
use crate::sync::RwSpinLock;

/// One binding in the map: key, value, signature, intrusive link, stable
/// index, and the value lock.
#[repr(C)]
pub(crate) struct Node<K, V> {
    sig: AtomicU32,
    next: AtomicU32,
    /// Position of this node across its pool's chunks; assigned once at
    /// chunk initialization, never changed, used for diagnostics only.
    index: u32,
    lock: RwSpinLock,
    key: UnsafeCell<MaybeUninit<K>>,
    value: UnsafeCell<MaybeUninit<V>>,
}

// SAFETY: the key is written only under the bucket write lock while the
// node is unreachable or being filled, and the value is guarded by the
// node's own lock; all other fields are atomics. The lock discipline in
// `bucket` is what makes concurrent shared access sound.
unsafe impl<K: Send, V: Send> Send for Node<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Node<K, V> {}

impl<K, V> Node<K, V> {
    /// Initialize a node inside a freshly reserved (zeroed) chunk.
    ///
    /// # Safety
    ///
    /// `node` must point to zero-initialized, properly aligned storage
    /// that no other process can reach yet.
    pub(crate) unsafe fn init_at(node: *mut Self, index: u32, next: u32) {
        // The chunk is private until it is spliced onto the free list,
        // so plain writes are sufficient here.
        unsafe {
            ptr::addr_of_mut!((*node).index).write(index);
            (*node).next.store(next, Ordering::Relaxed);
        }
    }

    /// The stored 32-bit signature
    #[inline]
    pub(crate) fn sig(&self) -> u32 {
        self.sig.load(Ordering::Relaxed)
    }

    /// Heap offset of the following node, or `NIL`
    #[inline]
    pub(crate) fn next(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }

    /// Relink this node. Caller must hold the lock that owns the list
    /// this node is on (bucket write lock, or the pool's serialization).
    #[inline]
    pub(crate) fn set_next(&self, next: u32) {
        self.next.store(next, Ordering::Release);
    }

    /// Stable diagnostic index assigned at chunk initialization
    #[inline]
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Reset link and signature before the node is handed out again.
    /// Called under the owning bucket's write lock.
    pub(crate) fn reset(&self) {
        self.sig.store(0, Ordering::Relaxed);
        self.next.store(NIL, Ordering::Release);
    }
}

impl<K: Copy, V: Copy> Node<K, V> {
    /// Store a fresh binding. Called only on a node just obtained from
    /// the pool, under the owning bucket's write lock, before the node
    /// is linked into the chain.
    pub(crate) fn fill(&self, key: K, value: V, sig: u32) {
        unsafe {
            (*self.key.get()).write(key);
            (*self.value.get()).write(value);
        }
        self.sig.store(sig, Ordering::Relaxed);
    }

    /// Borrow the key. Caller must hold the bucket lock (either mode)
    /// and the node must be occupied.
    #[inline]
    pub(crate) unsafe fn key_ref(&self) -> &K {
        unsafe { (*self.key.get()).assume_init_ref() }
    }

    /// Copy the value out under the node's read lock. The node must be
    /// occupied and the caller must hold the bucket lock.
    pub(crate) fn read_value(&self) -> V {
        let _r = self.lock.read_lock();
        unsafe { (*self.value.get()).assume_init() }
    }

    /// Apply a mutation to the value under the node's write lock. The
    /// node must be occupied and the caller must hold the bucket write
    /// lock (bucket before node, never the reverse).
    pub(crate) fn update_value<F: FnOnce(&mut V)>(&self, f: F) {
        let _w = self.lock.write_lock();
        f(unsafe { (*self.value.get()).assume_init_mut() })
    }
}
