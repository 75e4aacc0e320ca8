//! The shared-memory hash map
//!
//! Structure, leaves first: `node` holds one key/value binding plus its
//! intrusive link; `node_pool` recycles nodes per bucket with bounded
//! geometric growth; `bucket` is one lockable slot of the table;
//! `hash_table` is the fixed power-of-two array of buckets; and
//! `shm_map` is the façade that places the table in a named heap and
//! handles the primary-creates / secondary-attaches lifecycle.
//!
//! Everything below the façade lives inside the shared heap and is
//! addressed by `u32` offsets, never pointers, so every attached process
//! sees the same structure regardless of where its mapping landed.

mod bucket;
mod hash_table;
mod node;
mod node_pool;
mod shm_map;

pub use shm_map::{MapConfig, MapStats, ShmMap};

pub(crate) use bucket::Bucket;
pub(crate) use hash_table::{round_up_power_of_2, HashTable};
pub(crate) use node::Node;
pub(crate) use node_pool::NodePool;

use std::hash::{BuildHasher, Hash, Hasher};

/// Maximum number of chunks a node pool may allocate, including the
/// initial one. Bounds the named regions one bucket can consume.
pub(crate) const MAX_GROW_COUNT: usize = 5;

/// Initial chunk size a pool falls back to when no hint is configured
pub(crate) const DEFAULT_POOL_CHUNK: u32 = 16;

/// Default façade-level hint for total pre-sized entries
pub(crate) const DEFAULT_ENTRIES: u32 = 4096;

/// Default requested bucket count
pub(crate) const DEFAULT_BUCKETS: u32 = 4096;

/// Marker for types that may live inside shared memory.
///
/// A `ShmSafe` type is plain old data: bit-copyable, free of pointers,
/// references, heap handles, or drop glue, and meaningful in every
/// process that maps the bytes. The crate implements it for the
/// primitive scalars, arrays and small tuples of them; implement it for
/// your own `#[repr(C)]` field-by-field POD structs.
///
/// # Safety
///
/// Implementors must guarantee the type is valid for any process that
/// observes its raw bytes: no indirection of any kind and no invariants
/// beyond what the bytes themselves carry.
pub unsafe trait ShmSafe: Copy + Send + Sync + 'static {}

macro_rules! impl_shm_safe {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl ShmSafe for $t {})*
    };
}

impl_shm_safe!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char, ());

unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}
unsafe impl<A: ShmSafe, B: ShmSafe> ShmSafe for (A, B) {}
unsafe impl<A: ShmSafe, B: ShmSafe, C: ShmSafe> ShmSafe for (A, B, C) {}
unsafe impl<A: ShmSafe, B: ShmSafe, C: ShmSafe, D: ShmSafe> ShmSafe for (A, B, C, D) {}

/// The default build-hasher.
///
/// Every attached process must compute identical signatures for
/// identical keys, so the usual per-process random hasher seeds would
/// shred the map. This wraps `ahash` with fixed seeds instead; supply
/// your own `BuildHasher` through [`ShmMap::with_hasher`] if you need a
/// different function, but keep it deterministic across processes.
#[derive(Clone)]
pub struct FixedState(ahash::RandomState);

impl std::fmt::Debug for FixedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FixedState")
    }
}

impl Default for FixedState {
    fn default() -> Self {
        Self(ahash::RandomState::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        ))
    }
}

impl BuildHasher for FixedState {
    type Hasher = ahash::AHasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        self.0.build_hasher()
    }
}

/// Fold a key's 64-bit hash into the 32-bit signature stored on nodes.
///
/// The low `log2(bucket_count)` bits select the bucket, so both hash
/// halves are mixed in to keep the low bits loaded.
#[inline]
pub(crate) fn signature_of<K: Hash + ?Sized, S: BuildHasher>(build: &S, key: &K) -> u32 {
    let mut hasher = build.build_hasher();
    key.hash(&mut hasher);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

/// Ready-made modifier for [`ShmMap::update`] that overwrites the
/// stored value with the supplied one.
///
/// ```rust,no_run
/// # use shmap::{map::assign, ShmMap};
/// # let mut map: ShmMap<u64, u64> = ShmMap::new("m")?;
/// # map.create_or_attach()?;
/// map.update(&7, 50u64, assign)?;
/// # Ok::<(), shmap::ShmapError>(())
/// ```
#[inline]
pub fn assign<V>(value: &mut V, new_value: V) {
    *value = new_value;
}
