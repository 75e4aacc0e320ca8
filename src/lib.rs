//! # Shmap: Concurrent Shared-Memory Hash Map
//!
//! This crate provides a hash map that lives entirely inside a named
//! shared-memory region, built for packet-processing runtimes where
//! cooperating processes are pinned to cores and share state through
//! mapped memory rather than sockets.
//!
//! ## Key Features
//!
//! - **Multi-process**: a primary process constructs the map in a named
//!   heap; secondaries attach and observe a fully usable map
//! - **Per-bucket locking**: independent readers-writer spinlocks, so
//!   well-distributed keys scale linearly with core count
//! - **Bounded node pools**: each bucket recycles nodes through an
//!   intrusive free list that grows geometrically, at most five chunks
//! - **Offset addressing**: no pointers in shared memory, so every
//!   process may map the heap at a different address
//! - **In-place updates**: caller-supplied modifiers run under a
//!   per-node lock, ready for read paths that skip the bucket lock
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shmap::{MapConfig, ShmMap};
//!
//! // Primary and secondaries run the same code; roles resolve
//! // automatically from who creates the heap file first.
//! let mut map: ShmMap<u64, u64> = ShmMap::new("flows")?;
//! map.create_or_attach()?;
//!
//! map.insert(7, 49)?;
//! assert_eq!(map.find(&7)?, Some(49));
//!
//! // Accumulate in place under the node lock.
//! map.update(&7, 1u64, |value, delta| *value += delta)?;
//! assert_eq!(map.find(&7)?, Some(50));
//!
//! assert_eq!(map.erase(&7)?, Some(50));
//! # Ok::<(), shmap::ShmapError>(())
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod map;
pub mod runtime;
pub mod shm;
pub mod sync;

// Re-export core types
pub use error::{Result, ShmapError};
pub use map::{FixedState, MapConfig, MapStats, ShmMap, ShmSafe};
pub use runtime::{process_role, set_process_role, ProcessRole};
pub use shm::{RegionFlags, ShmHeap, ShmRegion};
pub use sync::RwSpinLock;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library (currently logging only)
pub fn init() {
    log::debug!("initializing shmap v{}", VERSION);
}
