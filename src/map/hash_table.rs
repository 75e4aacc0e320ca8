//! The fixed bucket array
//!
//! The table is stateless beyond its bucket array: it rounds the
//! requested bucket count up to a power of two, keeps the mask, and
//! routes every operation to exactly one bucket by `signature & mask`.
//! The array lives in its own named region (`bucket_array`) and each
//! bucket is constructed in place there.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr;

use crate::error::{Result, ShmapError};
use crate::map::{Bucket, ShmSafe, DEFAULT_POOL_CHUNK};
use crate::shm::{RegionFlags, ShmHeap};

/// Region name of the bucket array, one per heap
pub(crate) const BUCKET_ARRAY_REGION: &str = "bucket_array";

/// Advisory occupancy counters summed across buckets without locks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TableStats {
    pub capacity: u64,
    pub used_entries: u64,
    pub free_entries: u64,
}

/// Fixed power-of-two array of buckets plus the dispatch mask
#[repr(C)]
pub(crate) struct HashTable<K, V> {
    bucket_count: u32,
    mask: u32,
    buckets_offset: u32,
    /// Stored so an attaching process can detect a key/value type whose
    /// layout disagrees with the creator's
    node_size: u32,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> HashTable<K, V> {
    /// Construct the table in place: reserve the bucket array region and
    /// initialize every bucket (each eagerly allocates its first pool
    /// chunk).
    ///
    /// # Safety
    ///
    /// `table` must point to zero-initialized, properly aligned storage
    /// inside `heap` that no other process can reach yet.
    pub(crate) unsafe fn init(
        table: *mut Self,
        heap: &ShmHeap,
        entries_hint: u32,
        buckets: u32,
    ) -> Result<()> {
        if buckets == 0 {
            return Err(ShmapError::configuration("bucket count must be non-zero"));
        }
        let bucket_count = round_up_power_of_2(buckets);
        let mask = bucket_count - 1;

        let bucket_size = mem::size_of::<Bucket<K, V>>();
        let region = heap.reserve(
            BUCKET_ARRAY_REGION,
            bucket_count as usize * bucket_size,
            RegionFlags::empty(),
        )?;

        let pool_chunk = per_bucket_chunk(entries_hint, bucket_count);
        for i in 0..bucket_count {
            let bucket = heap.ptr::<Bucket<K, V>>(region.offset + i * bucket_size as u32);
            unsafe { Bucket::init(bucket, i, pool_chunk, heap) };
        }

        unsafe {
            ptr::write(
                table,
                Self {
                    bucket_count,
                    mask,
                    buckets_offset: region.offset,
                    node_size: mem::size_of::<crate::map::Node<K, V>>() as u32,
                    _marker: PhantomData,
                },
            );
        }

        log::debug!(
            "hash table initialized: {} buckets, {} nodes per first chunk",
            bucket_count,
            pool_chunk
        );
        Ok(())
    }

    /// Check that an attached table was built with the same node layout
    pub(crate) fn validate_layout(&self) -> Result<()> {
        let expected = mem::size_of::<crate::map::Node<K, V>>() as u32;
        if self.bucket_count == 0 || !self.bucket_count.is_power_of_two() {
            return Err(ShmapError::invalid_heap(format!(
                "corrupt table: bucket count {}",
                self.bucket_count
            )));
        }
        if self.node_size != expected {
            return Err(ShmapError::invalid_heap(format!(
                "node size mismatch: table has {}, this process needs {}",
                self.node_size, expected
            )));
        }
        Ok(())
    }

    /// Number of buckets (always a power of two)
    #[inline]
    pub(crate) fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    #[inline]
    fn bucket<'h>(&self, heap: &'h ShmHeap, index: u32) -> &'h Bucket<K, V> {
        debug_assert!(index < self.bucket_count);
        let stride = mem::size_of::<Bucket<K, V>>() as u32;
        unsafe { &*heap.ptr::<Bucket<K, V>>(self.buckets_offset + index * stride) }
    }

    #[inline]
    fn bucket_for<'h>(&self, heap: &'h ShmHeap, sig: u32) -> &'h Bucket<K, V> {
        self.bucket(heap, sig & self.mask)
    }

    /// Sum the advisory occupancy counters across all buckets
    pub(crate) fn stats(&self, heap: &ShmHeap) -> TableStats {
        let mut stats = TableStats::default();
        for i in 0..self.bucket_count {
            let bucket = self.bucket(heap, i);
            stats.capacity += u64::from(bucket.pool().capacity());
            stats.free_entries += u64::from(bucket.pool().free_entries());
            stats.used_entries += u64::from(bucket.size());
        }
        stats
    }

    /// Clear every bucket in turn. Buckets are cleared independently, so
    /// a concurrent observer may see a partially cleared table.
    pub(crate) fn clear(&self, heap: &ShmHeap) {
        for i in 0..self.bucket_count {
            self.bucket(heap, i).clear(heap);
        }
    }

    /// Tear down every bucket's pool and release the bucket array.
    /// Primary-only, at destruction.
    pub(crate) fn destroy(&self, heap: &ShmHeap) {
        for i in 0..self.bucket_count {
            self.bucket(heap, i).destroy(heap);
        }
        heap.free(self.buckets_offset);
    }
}

impl<K: ShmSafe + Eq, V: ShmSafe> HashTable<K, V> {
    pub(crate) fn insert(&self, heap: &ShmHeap, sig: u32, key: K, value: V) -> bool {
        self.bucket_for(heap, sig).insert(heap, sig, key, value)
    }

    pub(crate) fn lookup(&self, heap: &ShmHeap, sig: u32, key: &K) -> Option<V> {
        self.bucket_for(heap, sig).lookup(heap, sig, key)
    }

    pub(crate) fn erase(&self, heap: &ShmHeap, sig: u32, key: &K) -> Option<V> {
        self.bucket_for(heap, sig).erase(heap, sig, key)
    }

    pub(crate) fn update<P, F: FnOnce(&mut V, P)>(
        &self,
        heap: &ShmHeap,
        sig: u32,
        key: &K,
        params: P,
        modifier: F,
    ) -> bool {
        self.bucket_for(heap, sig)
            .update(heap, sig, key, params, modifier)
    }

    /// Write a human-readable occupancy report: totals, then one line
    /// per non-empty bucket with the chain's node indexes head first.
    pub(crate) fn write_report<W: fmt::Write>(&self, heap: &ShmHeap, w: &mut W) -> fmt::Result {
        let stats = self.stats(heap);
        writeln!(w, "hash table: {} buckets", self.bucket_count)?;
        writeln!(w, "  total entries : {}", stats.capacity)?;
        writeln!(w, "  used entries  : {}", stats.used_entries)?;
        writeln!(w, "  free entries  : {}", stats.free_entries)?;

        for i in 0..self.bucket_count {
            let bucket = self.bucket(heap, i);
            if bucket.size() == 0 {
                continue;
            }
            let indexes = bucket.chain_indexes(heap);
            write!(w, "  bucket[{}] size={} chain:", i, indexes.len())?;
            for index in indexes {
                write!(w, " [{}]", index)?;
            }
            writeln!(w)?;
        }
        Ok(())
    }
}

/// Round up to the next power of two, bit-length style: 0 stays 0 and
/// anything above 2^31 saturates there.
pub(crate) fn round_up_power_of_2(num: u32) -> u32 {
    if num == 0 {
        return 0;
    }
    if num > 1 << 31 {
        return 1 << 31;
    }
    num.next_power_of_two()
}

/// Split the façade-level entries hint across buckets; each pool's first
/// chunk gets an equal share, never less than one node. A zero hint
/// falls back to the pool default.
pub(super) fn per_bucket_chunk(entries_hint: u32, bucket_count: u32) -> u32 {
    if entries_hint == 0 {
        DEFAULT_POOL_CHUNK
    } else {
        (entries_hint / bucket_count).max(1)
    }
}
