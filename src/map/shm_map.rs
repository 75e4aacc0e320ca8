//! The map façade: a hash table inside a named heap
//!
//! `ShmMap` ties the pieces together for one named map. The configured
//! name becomes the heap file name (`HT_<name>`, truncated to the
//! 32-byte region name space) under the configured base directory. A
//! primary creates the heap and constructs the table in place; a
//! secondary attaches to the existing heap and looks the table up. Until
//! `create_or_attach` succeeds every data operation fails with
//! [`ShmapError::NotAttached`].

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::path::{Path, PathBuf};

use crate::error::{Result, ShmapError};
use crate::map::hash_table::per_bucket_chunk;
use crate::map::{
    round_up_power_of_2, signature_of, Bucket, FixedState, HashTable, Node, ShmSafe,
    DEFAULT_BUCKETS, DEFAULT_ENTRIES, MAX_GROW_COUNT,
};
use crate::runtime::{self, ProcessRole};
use crate::shm::{RegionFlags, ShmHeap, HEAP_ALIGN, REGION_NAME_LEN};

/// Region holding the table header inside the heap
const TABLE_REGION: &str = "hash_table";

/// Configuration for a [`ShmMap`]
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Hint for the number of pre-sized entries across the whole map.
    /// Each bucket's pool starts with an equal share and can grow to
    /// 31× its share; 0 means the pool default of 16 per bucket.
    pub entries_hint: u32,
    /// Requested bucket count; rounded up to a power of two. Zero is
    /// rejected at `create_or_attach`.
    pub buckets: u32,
    /// Directory the heap file lives in. Defaults to `/dev/shm` when
    /// present, the system temp directory otherwise.
    pub base_dir: PathBuf,
    /// Role override for this map; `None` uses the process-wide role.
    pub role: Option<ProcessRole>,
    /// Override for the heap's data-area size in bytes; `None` sizes it
    /// from the worst-case pool growth.
    pub heap_bytes: Option<usize>,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            entries_hint: DEFAULT_ENTRIES,
            buckets: DEFAULT_BUCKETS,
            base_dir: default_base_dir(),
            role: None,
            heap_bytes: None,
        }
    }
}

impl MapConfig {
    /// Default configuration (4096 entries hint, 4096 buckets)
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration with explicit sizing
    pub fn with_capacity(entries_hint: u32, buckets: u32) -> Self {
        Self {
            entries_hint,
            buckets,
            ..Self::default()
        }
    }

    /// Small map for tests and tools (256 entries hint, 64 buckets)
    pub fn small() -> Self {
        Self::with_capacity(256, 64)
    }
}

/// Advisory occupancy counters for one map
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStats {
    /// Total nodes allocated across every bucket pool
    pub capacity: u64,
    /// Nodes currently linked into bucket chains
    pub used_entries: u64,
    /// Nodes currently on pool free lists
    pub free_entries: u64,
    /// Number of buckets (power of two)
    pub buckets: u32,
}

/// A concurrent hash map shared between cooperating processes.
///
/// All data operations take `&self` and are safe to call from any number
/// of threads in any number of attached processes; consistency comes
/// from the per-bucket locks inside the shared heap, not from Rust
/// ownership of this handle.
pub struct ShmMap<K, V, S = FixedState> {
    name: String,
    config: MapConfig,
    hash_builder: S,
    heap: Option<ShmHeap>,
    table_offset: u32,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, S> ShmMap<K, V, S>
where
    K: ShmSafe + Hash + Eq,
    V: ShmSafe,
    S: BuildHasher + Default,
{
    /// New unattached map handle with the default configuration
    pub fn new(name: &str) -> Result<Self> {
        Self::with_config(name, MapConfig::default())
    }

    /// New unattached map handle with an explicit configuration
    pub fn with_config(name: &str, config: MapConfig) -> Result<Self> {
        Self::with_hasher(name, config, S::default())
    }
}

impl<K, V, S> ShmMap<K, V, S>
where
    K: ShmSafe + Hash + Eq,
    V: ShmSafe,
    S: BuildHasher,
{
    /// New unattached map handle with an explicit build-hasher.
    ///
    /// The hasher must produce identical hashes in every process that
    /// attaches to this map; see [`FixedState`].
    pub fn with_hasher(name: &str, config: MapConfig, hash_builder: S) -> Result<Self> {
        if name.is_empty() {
            return Err(ShmapError::configuration("map name must be non-empty"));
        }
        if name.contains(std::path::MAIN_SEPARATOR) {
            return Err(ShmapError::configuration(format!(
                "map name {:?} must not contain path separators",
                name
            )));
        }
        Ok(Self {
            name: heap_name(name),
            config,
            hash_builder,
            heap: None,
            table_offset: 0,
            _marker: PhantomData,
        })
    }

    /// Create the map (primary) or attach to it (secondary), according
    /// to the configured role or the process-wide role. Idempotent once
    /// attached.
    pub fn create_or_attach(&mut self) -> Result<()> {
        if self.heap.is_some() {
            return Ok(());
        }

        let role = self.config.role.unwrap_or_else(runtime::process_role);
        let path = self.config.base_dir.join(&self.name);
        match role {
            ProcessRole::Primary => self.create(&path),
            ProcessRole::Secondary => self.attach(&path),
            ProcessRole::Auto => match self.create(&path) {
                Ok(()) => Ok(()),
                Err(ShmapError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                    self.attach(&path)
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Insert a binding. `Ok(false)` on duplicate key or an exhausted
    /// bucket pool; nothing is mutated in either case.
    pub fn insert(&self, key: K, value: V) -> Result<bool> {
        let (heap, table) = self.table()?;
        let sig = signature_of(&self.hash_builder, &key);
        Ok(table.insert(heap, sig, key, value))
    }

    /// Look a key up and copy its value out
    pub fn find(&self, key: &K) -> Result<Option<V>> {
        let (heap, table) = self.table()?;
        let sig = signature_of(&self.hash_builder, key);
        Ok(table.lookup(heap, sig, key))
    }

    /// Remove a binding, returning the removed value
    pub fn erase(&self, key: &K) -> Result<Option<V>> {
        let (heap, table) = self.table()?;
        let sig = signature_of(&self.hash_builder, key);
        Ok(table.erase(heap, sig, key))
    }

    /// Apply `modifier` to the value bound to `key`, under the node's
    /// write lock. `Ok(false)` if the key is missing. The modifier must
    /// not reenter this or any other map.
    pub fn update<P, F: FnOnce(&mut V, P)>(
        &self,
        key: &K,
        params: P,
        modifier: F,
    ) -> Result<bool> {
        let (heap, table) = self.table()?;
        let sig = signature_of(&self.hash_builder, key);
        Ok(table.update(heap, sig, key, params, modifier))
    }

    /// Clear every bucket. Buckets are cleared one at a time, so a
    /// concurrent observer may see a partially cleared map.
    pub fn clear(&self) -> Result<()> {
        let (heap, table) = self.table()?;
        table.clear(heap);
        Ok(())
    }

    /// Advisory occupancy counters, read without taking any lock
    pub fn stats(&self) -> Result<MapStats> {
        let (heap, table) = self.table()?;
        let stats = table.stats(heap);
        Ok(MapStats {
            capacity: stats.capacity,
            used_entries: stats.used_entries,
            free_entries: stats.free_entries,
            buckets: table.bucket_count(),
        })
    }

    /// Write a human-readable occupancy report to `sink`
    pub fn dump<W: fmt::Write>(&self, sink: &mut W) -> fmt::Result {
        match self.table() {
            Ok((heap, table)) => table.write_report(heap, sink),
            Err(_) => writeln!(sink, "hash table is not created"),
        }
    }

    /// Whether `create_or_attach` has succeeded
    pub fn is_attached(&self) -> bool {
        self.heap.is_some()
    }

    /// The full region name of this map (`HT_` prefix included)
    pub fn name(&self) -> &str {
        &self.name
    }

    fn create(&mut self, path: &Path) -> Result<()> {
        let bucket_count = round_up_power_of_2(self.config.buckets);
        if bucket_count == 0 {
            return Err(ShmapError::configuration("bucket count must be non-zero"));
        }

        let data_bytes = self.config.heap_bytes.unwrap_or_else(|| {
            required_heap_bytes::<K, V>(self.config.entries_hint, bucket_count)
        });
        let max_regions = 2u32.saturating_add(bucket_count.saturating_mul(MAX_GROW_COUNT as u32));
        let heap = ShmHeap::create(path, data_bytes, max_regions)?;

        let table_bytes = mem::size_of::<HashTable<K, V>>();
        let region = heap.reserve(TABLE_REGION, table_bytes, RegionFlags::SIZE_HINT_ONLY)?;
        if (region.size as usize) < table_bytes {
            return Err(ShmapError::region_exhausted(
                "heap too small for the table header",
            ));
        }
        unsafe {
            HashTable::<K, V>::init(
                heap.ptr(region.offset),
                &heap,
                self.config.entries_hint,
                self.config.buckets,
            )?;
        }

        log::debug!(
            "created map {} with {} buckets in {:?}",
            self.name,
            bucket_count,
            path
        );
        self.table_offset = region.offset;
        self.heap = Some(heap);
        Ok(())
    }

    fn attach(&mut self, path: &Path) -> Result<()> {
        let heap = ShmHeap::attach(path)?;
        let region = heap.lookup(TABLE_REGION)?;
        if (region.size as usize) < mem::size_of::<HashTable<K, V>>() {
            return Err(ShmapError::invalid_heap(format!(
                "table region is {} bytes, need {}",
                region.size,
                mem::size_of::<HashTable<K, V>>()
            )));
        }
        let table = unsafe { &*heap.ptr::<HashTable<K, V>>(region.offset) };
        table.validate_layout()?;

        log::debug!("attached map {} from {:?}", self.name, path);
        self.table_offset = region.offset;
        self.heap = Some(heap);
        Ok(())
    }

    fn table(&self) -> Result<(&ShmHeap, &HashTable<K, V>)> {
        let heap = self.heap.as_ref().ok_or(ShmapError::NotAttached)?;
        let table = unsafe { &*heap.ptr::<HashTable<K, V>>(self.table_offset) };
        Ok((heap, table))
    }
}

impl<K, V, S> Drop for ShmMap<K, V, S> {
    fn drop(&mut self) {
        if let Some(heap) = self.heap.take() {
            if heap.is_owner() {
                // Primary teardown: release every region, then the heap
                // handle unlinks the file.
                let table = unsafe { &*heap.ptr::<HashTable<K, V>>(self.table_offset) };
                table.destroy(&heap);
                heap.free(self.table_offset);
            }
        }
    }
}

impl<K, V, S> fmt::Debug for ShmMap<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmMap")
            .field("name", &self.name)
            .field("attached", &self.heap.is_some())
            .finish()
    }
}

/// Prefix the user name and fit it into the region name space, the same
/// silent truncation the runtime applies to long names
fn heap_name(name: &str) -> String {
    let mut full = format!("HT_{}", name);
    if full.len() > REGION_NAME_LEN {
        let mut cut = REGION_NAME_LEN;
        while !full.is_char_boundary(cut) {
            cut -= 1;
        }
        full.truncate(cut);
    }
    full
}

/// Worst-case data-area size: the table header, the bucket array, and
/// every pool fully grown (31× its first chunk), plus per-region
/// alignment slack.
fn required_heap_bytes<K, V>(entries_hint: u32, bucket_count: u32) -> usize {
    let per_bucket = per_bucket_chunk(entries_hint, bucket_count) as usize;
    let max_nodes = per_bucket * ((1usize << MAX_GROW_COUNT) - 1) * bucket_count as usize;
    let node_bytes = max_nodes * mem::size_of::<Node<K, V>>();
    let bucket_bytes = bucket_count as usize * mem::size_of::<Bucket<K, V>>();
    let table_bytes = mem::size_of::<HashTable<K, V>>();
    let region_count = 2 + bucket_count as usize * MAX_GROW_COUNT;
    table_bytes + bucket_bytes + node_bytes + region_count * HEAP_ALIGN
}

fn default_base_dir() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    if shm.is_dir() {
        shm
    } else {
        std::env::temp_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestMap = ShmMap<u64, u64>;

    fn config_in(dir: &TempDir) -> MapConfig {
        MapConfig {
            base_dir: dir.path().to_path_buf(),
            ..MapConfig::small()
        }
    }

    #[test]
    fn test_heap_name_prefix_and_truncation() {
        assert_eq!(heap_name("flows"), "HT_flows");

        let long = "a".repeat(64);
        let truncated = heap_name(&long);
        assert_eq!(truncated.len(), REGION_NAME_LEN);
        assert!(truncated.starts_with("HT_a"));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(TestMap::with_config("", config_in(&dir)).is_err());
        assert!(TestMap::with_config("a/b", config_in(&dir)).is_err());
    }

    #[test]
    fn test_operations_require_attach() {
        let dir = TempDir::new().unwrap();
        let map = TestMap::with_config("unattached", config_in(&dir)).unwrap();

        assert!(matches!(map.insert(1, 1), Err(ShmapError::NotAttached)));
        assert!(matches!(map.find(&1), Err(ShmapError::NotAttached)));
        assert!(matches!(map.erase(&1), Err(ShmapError::NotAttached)));
        assert!(matches!(map.clear(), Err(ShmapError::NotAttached)));
        assert!(matches!(map.stats(), Err(ShmapError::NotAttached)));

        let mut report = String::new();
        map.dump(&mut report).unwrap();
        assert!(report.contains("not created"));
    }

    #[test]
    fn test_create_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut map = TestMap::with_config("idem", config_in(&dir)).unwrap();
        map.create_or_attach().unwrap();
        assert!(map.is_attached());
        map.create_or_attach().unwrap();
        assert!(map.insert(1, 2).unwrap());
    }

    #[test]
    fn test_zero_buckets_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.buckets = 0;
        let mut map = TestMap::with_config("zero", config).unwrap();
        let err = map.create_or_attach().unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_secondary_needs_existing_heap() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.role = Some(ProcessRole::Secondary);
        let mut map = TestMap::with_config("absent", config).unwrap();
        assert!(map.create_or_attach().is_err());
        assert!(!map.is_attached());
    }

    #[test]
    fn test_primary_refuses_existing_heap() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.role = Some(ProcessRole::Primary);

        let mut first = TestMap::with_config("owned", config.clone()).unwrap();
        first.create_or_attach().unwrap();

        let mut second = TestMap::with_config("owned", config).unwrap();
        assert!(second.create_or_attach().is_err());
    }

    #[test]
    fn test_primary_drop_unlinks_heap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("HT_short");
        {
            let mut map = TestMap::with_config("short", config_in(&dir)).unwrap();
            map.create_or_attach().unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_attach_rejects_layout_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut primary = TestMap::with_config("typed", config_in(&dir)).unwrap();
        primary.create_or_attach().unwrap();

        let mut config = config_in(&dir);
        config.role = Some(ProcessRole::Secondary);
        let mut wrong: ShmMap<u64, [u64; 4]> = ShmMap::with_config("typed", config).unwrap();
        let err = wrong.create_or_attach().unwrap_err();
        assert_eq!(err.category(), "invalid_heap");
    }
}
