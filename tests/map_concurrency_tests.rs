//! Concurrency tests: many threads, and handles attached through
//! independent mappings of one heap (which is what distinct processes
//! observe).

use std::sync::Arc;
use std::thread;

use shmap::{MapConfig, ProcessRole, ShmMap};
use tempfile::TempDir;

fn primary_in(dir: &TempDir, name: &str, entries: u32, buckets: u32) -> ShmMap<u64, u64> {
    let config = MapConfig {
        base_dir: dir.path().to_path_buf(),
        ..MapConfig::with_capacity(entries, buckets)
    };
    let mut map = ShmMap::with_config(name, config).unwrap();
    map.create_or_attach().unwrap();
    map
}

fn secondary_in(dir: &TempDir, name: &str) -> ShmMap<u64, u64> {
    let config = MapConfig {
        base_dir: dir.path().to_path_buf(),
        role: Some(ProcessRole::Secondary),
        ..MapConfig::default()
    };
    let mut map = ShmMap::with_config(name, config).unwrap();
    map.create_or_attach().unwrap();
    map
}

#[test]
fn disjoint_inserts_all_land() {
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 500;

    let dir = TempDir::new().unwrap();
    let map = Arc::new(primary_in(&dir, "disjoint", 8192, 256));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let key = t * 10_000 + i;
                    assert!(map.insert(key, key * 2).unwrap());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.stats().unwrap().used_entries, THREADS * PER_THREAD);
    for t in 0..THREADS {
        for i in 0..PER_THREAD {
            let key = t * 10_000 + i;
            assert_eq!(map.find(&key).unwrap(), Some(key * 2));
        }
    }
}

#[test]
fn concurrent_updates_accumulate_exactly() {
    const WRITERS: u64 = 2;
    const UPDATES: u64 = 20_000;

    let dir = TempDir::new().unwrap();
    let map = Arc::new(primary_in(&dir, "accumulate", 64, 8));
    assert!(map.insert(1, 0).unwrap());

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for _ in 0..UPDATES {
                    assert!(map.update(&1, 1u64, |v, p| *v += p).unwrap());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.find(&1).unwrap(), Some(WRITERS * UPDATES));
}

#[test]
fn readers_run_during_writes() {
    const KEYS: u64 = 64;

    let dir = TempDir::new().unwrap();
    let map = Arc::new(primary_in(&dir, "readers", 256, 16));
    for key in 0..KEYS {
        assert!(map.insert(key, key).unwrap());
    }

    let writer = {
        let map = Arc::clone(&map);
        thread::spawn(move || {
            for round in 0..200u64 {
                for key in 0..KEYS {
                    assert!(map.update(&key, 1u64, |v, p| *v += p).unwrap());
                }
                let _ = round;
            }
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for _ in 0..2_000 {
                    for key in 0..KEYS {
                        // Values move monotonically from key to key+200;
                        // a torn read would fall outside that window.
                        let value = map.find(&key).unwrap().unwrap();
                        assert!(value >= key && value <= key + 200);
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    for key in 0..KEYS {
        assert_eq!(map.find(&key).unwrap(), Some(key + 200));
    }
}

#[test]
fn churn_on_one_bucket_stays_balanced() {
    const THREADS: u64 = 4;
    const ROUNDS: u64 = 1_000;

    let dir = TempDir::new().unwrap();
    // Everything hashes into the single bucket; inserts and erases from
    // all threads fight over one lock and one pool.
    let map = Arc::new(primary_in(&dir, "churn", 64, 1));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let key = t;
                for round in 0..ROUNDS {
                    if round % 2 == 0 {
                        map.insert(key, round).unwrap();
                    } else {
                        map.erase(&key).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = map.stats().unwrap();
    assert_eq!(stats.used_entries + stats.free_entries, stats.capacity);
    // Every thread ended on an erase, so the bucket is empty again.
    assert_eq!(stats.used_entries, 0);

    assert!(map.insert(99, 99).unwrap());
    assert_eq!(map.find(&99).unwrap(), Some(99));
}

#[test]
fn cross_mapping_visibility_under_load() {
    const KEYS: u64 = 256;

    let dir = TempDir::new().unwrap();
    let primary = Arc::new(primary_in(&dir, "xmap", 1024, 32));
    // A second, independent mapping of the same heap: different base
    // address, same bytes.
    let secondary = Arc::new(secondary_in(&dir, "xmap"));

    let writer = {
        let primary = Arc::clone(&primary);
        thread::spawn(move || {
            for key in 0..KEYS {
                assert!(primary.insert(key, key + 1).unwrap());
            }
        })
    };

    let reader = {
        let secondary = Arc::clone(&secondary);
        thread::spawn(move || {
            // Spin until every key written through the other mapping is
            // visible through this one.
            let mut seen = 0u64;
            while seen < KEYS {
                seen = 0;
                for key in 0..KEYS {
                    if secondary.find(&key).unwrap() == Some(key + 1) {
                        seen += 1;
                    }
                }
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();

    assert_eq!(primary.stats().unwrap().used_entries, KEYS);
    assert_eq!(secondary.stats().unwrap().used_entries, KEYS);

    // Erase through the secondary, observe through the primary.
    for key in 0..KEYS {
        assert_eq!(secondary.erase(&key).unwrap(), Some(key + 1));
    }
    assert_eq!(primary.stats().unwrap().used_entries, 0);
}
