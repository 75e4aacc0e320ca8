//! The shared heap: one file mapping with a region directory inside it
//!
//! Layout of the mapping:
//!
//! ```text
//! +--------------+----------------------+--------------------------------+
//! | HeapHeader   | RegionEntry × N      | data area (bump-allocated)     |
//! +--------------+----------------------+--------------------------------+
//! 0              64                     data_start (64-byte aligned)
//! ```
//!
//! The header holds the magic, a readiness flag published with a release
//! store once the creator finished initialization, the directory bounds,
//! and the bump cursor. Directory mutations and reservations are
//! serialized by the spinlock in the header, so they are safe from any
//! attached process.
//!
//! The data area is monotonic: `free` recycles a directory entry (its
//! name becomes available again) but never the storage behind it. Freshly
//! created file pages read as zero and the cursor never moves backwards,
//! so every reservation hands out zero-initialized memory.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Result, ShmapError};
use crate::shm::{align_up, RegionFlags, NIL, REGION_NAME_LEN};
use crate::sync::RwSpinLock;

/// Identifies the heap format; bumped on layout changes
const HEAP_MAGIC: u32 = 0x5348_4d50; // "SHMP"

/// Alignment of the directory, the data area, and every reservation
pub(crate) const HEAP_ALIGN: usize = 64;

/// Bounded wait for the creator to publish readiness during attach
const ATTACH_SPINS: u32 = 4096;

#[repr(C, align(64))]
struct HeapHeader {
    magic: u32,
    ready: AtomicU32,
    lock: RwSpinLock,
    dir_capacity: u32,
    dir_used: AtomicU32,
    bump: AtomicU32,
    heap_len: u64,
}

#[repr(C)]
struct RegionEntry {
    /// NUL-padded region name; a zero first byte marks the slot unused
    name: [u8; REGION_NAME_LEN],
    offset: u32,
    size: u32,
    state: u32,
    _reserved: u32,
}

const ENTRY_USED: u32 = 1;

const _: () = assert!(std::mem::size_of::<HeapHeader>() == 64);
const _: () = assert!(std::mem::size_of::<RegionEntry>() == 48);

/// A named range handed out by [`ShmHeap::reserve`] or found by
/// [`ShmHeap::lookup`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmRegion {
    /// Byte offset of the region from the heap base
    pub offset: u32,
    /// Usable size of the region in bytes
    pub size: u32,
}

/// A process-local handle to one shared heap.
///
/// The handle that created the heap owns its lifecycle and unlinks the
/// backing file on drop; attached handles only unmap.
pub struct ShmHeap {
    mmap: MmapMut,
    base: *mut u8,
    len: usize,
    path: PathBuf,
    owner: bool,
}

// SAFETY: the raw base pointer refers to a shared mapping that stays
// valid for the lifetime of `mmap`; all mutation of shared state goes
// through atomics or is serialized by the header spinlock.
unsafe impl Send for ShmHeap {}
unsafe impl Sync for ShmHeap {}

impl ShmHeap {
    /// Create a new heap file with room for `data_bytes` of reservations
    /// and `max_regions` directory entries.
    ///
    /// Fails with `AlreadyExists` I/O error if the file is present, which
    /// is how the caller discovers it should attach instead.
    pub fn create(path: &Path, data_bytes: usize, max_regions: u32) -> Result<Self> {
        if max_regions == 0 {
            return Err(ShmapError::configuration("max_regions must be non-zero"));
        }

        let dir_bytes = max_regions as usize * std::mem::size_of::<RegionEntry>();
        let data_start = align_up(std::mem::size_of::<HeapHeader>() + dir_bytes, HEAP_ALIGN);
        let total = align_up(data_start + data_bytes, page_size());
        if total > u32::MAX as usize {
            return Err(ShmapError::configuration(format!(
                "heap of {} bytes exceeds the 4 GiB offset space",
                total
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(total as u64)?;

        let mut mmap = unsafe {
            MmapOptions::new()
                .map_mut(&file)
                .map_err(|e| ShmapError::io_error(format!("failed to map heap: {}", e)))?
        };
        let base = mmap.as_mut_ptr();

        let header = base as *mut HeapHeader;
        // The mapping is private to this process until `ready` is
        // published, so plain writes are fine here.
        unsafe {
            ptr::write(
                header,
                HeapHeader {
                    magic: HEAP_MAGIC,
                    ready: AtomicU32::new(0),
                    lock: RwSpinLock::new(),
                    dir_capacity: max_regions,
                    dir_used: AtomicU32::new(0),
                    bump: AtomicU32::new(data_start as u32),
                    heap_len: total as u64,
                },
            );
            (*header).ready.store(1, Ordering::Release);
        }

        log::debug!(
            "created heap {:?}: {} bytes, {} directory slots, data at {:#x}",
            path,
            total,
            max_regions,
            data_start
        );

        Ok(Self {
            mmap,
            base,
            len: total,
            path: path.to_path_buf(),
            owner: true,
        })
    }

    /// Attach to an existing heap file created by another handle or
    /// another process.
    pub fn attach(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < std::mem::size_of::<HeapHeader>() {
            return Err(ShmapError::invalid_heap(format!(
                "heap file {:?} is truncated ({} bytes)",
                path, len
            )));
        }

        let mut mmap = unsafe {
            MmapOptions::new()
                .map_mut(&file)
                .map_err(|e| ShmapError::io_error(format!("failed to map heap: {}", e)))?
        };
        let base = mmap.as_mut_ptr();
        let header = unsafe { &*(base as *const HeapHeader) };

        // The creator may still be between file creation and header
        // publication; wait a bounded while for the release store.
        let mut spins = 0;
        while header.ready.load(Ordering::Acquire) != 1 {
            spins += 1;
            if spins > ATTACH_SPINS {
                return Err(ShmapError::invalid_heap(format!(
                    "heap {:?} was never initialized",
                    path
                )));
            }
            thread::yield_now();
        }

        if header.magic != HEAP_MAGIC {
            return Err(ShmapError::invalid_heap(format!(
                "bad magic {:#x} in {:?}",
                header.magic, path
            )));
        }
        if header.heap_len != len as u64 {
            return Err(ShmapError::invalid_heap(format!(
                "heap length mismatch: header says {}, file is {}",
                header.heap_len, len
            )));
        }

        log::debug!("attached heap {:?}: {} bytes", path, len);

        Ok(Self {
            mmap,
            base,
            len,
            path: path.to_path_buf(),
            owner: false,
        })
    }

    /// Reserve a zero-initialized, 64-byte-aligned region under `name`.
    ///
    /// Fails if the name is already present, the directory is full, or
    /// the data area cannot fit `size` (unless
    /// [`RegionFlags::SIZE_HINT_ONLY`] allows clamping to what is left).
    pub fn reserve(&self, name: &str, size: usize, flags: RegionFlags) -> Result<ShmRegion> {
        if name.is_empty() || name.len() > REGION_NAME_LEN {
            return Err(ShmapError::configuration(format!(
                "region name must be 1..={} bytes, got {}",
                REGION_NAME_LEN,
                name.len()
            )));
        }
        if size == 0 {
            return Err(ShmapError::configuration("region size must be non-zero"));
        }

        let header = self.header();
        let _w = header.lock.write_lock();

        let mut slot = None;
        for i in 0..header.dir_capacity {
            let entry = unsafe { &*self.entry_ptr(i) };
            if entry.state == ENTRY_USED {
                if entry_name_matches(entry, name) {
                    return Err(ShmapError::duplicate_region(name));
                }
            } else if slot.is_none() {
                slot = Some(i);
            }
        }
        let slot = slot.ok_or_else(|| {
            ShmapError::region_exhausted(format!(
                "directory full ({} slots)",
                header.dir_capacity
            ))
        })?;

        let offset = align_up(header.bump.load(Ordering::Relaxed) as usize, HEAP_ALIGN);
        let available = self.len.saturating_sub(offset);
        let granted = if size <= available {
            size
        } else if flags.contains(RegionFlags::SIZE_HINT_ONLY) && available >= HEAP_ALIGN {
            log::debug!(
                "region {} clamped from {} to {} bytes",
                name,
                size,
                available
            );
            available
        } else {
            return Err(ShmapError::region_exhausted(format!(
                "need {} bytes for {}, {} left",
                size, name, available
            )));
        };

        let entry = self.entry_ptr(slot);
        unsafe {
            let mut bytes = [0u8; REGION_NAME_LEN];
            bytes[..name.len()].copy_from_slice(name.as_bytes());
            ptr::write(
                entry,
                RegionEntry {
                    name: bytes,
                    offset: offset as u32,
                    size: granted as u32,
                    state: ENTRY_USED,
                    _reserved: 0,
                },
            );
        }
        header.bump.store((offset + granted) as u32, Ordering::Relaxed);
        header.dir_used.fetch_add(1, Ordering::Relaxed);

        Ok(ShmRegion {
            offset: offset as u32,
            size: granted as u32,
        })
    }

    /// Find a region previously reserved under `name`
    pub fn lookup(&self, name: &str) -> Result<ShmRegion> {
        let header = self.header();
        let _r = header.lock.read_lock();

        for i in 0..header.dir_capacity {
            let entry = unsafe { &*self.entry_ptr(i) };
            if entry.state == ENTRY_USED && entry_name_matches(entry, name) {
                return Ok(ShmRegion {
                    offset: entry.offset,
                    size: entry.size,
                });
            }
        }
        Err(ShmapError::region_not_found(name))
    }

    /// Release the directory entry of the region starting at `offset`.
    ///
    /// The storage itself is not reclaimed; only the name becomes
    /// available again. Returns whether an entry was released.
    pub fn free(&self, offset: u32) -> bool {
        let header = self.header();
        let _w = header.lock.write_lock();

        for i in 0..header.dir_capacity {
            let entry = self.entry_ptr(i);
            let used = unsafe { (*entry).state == ENTRY_USED && (*entry).offset == offset };
            if used {
                unsafe {
                    (*entry).name = [0u8; REGION_NAME_LEN];
                    (*entry).state = 0;
                }
                header.dir_used.fetch_sub(1, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    /// Number of live directory entries (advisory)
    pub fn region_count(&self) -> u32 {
        self.header().dir_used.load(Ordering::Relaxed)
    }

    /// Total size of the mapping in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a valid heap)
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this handle created the heap and owns its teardown
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Resolve an intra-heap offset to a typed pointer.
    ///
    /// The returned pointer is valid for the lifetime of this handle.
    /// Callers must only resolve offsets produced by this heap and must
    /// respect the locking discipline of the structure stored there.
    #[inline]
    pub fn ptr<T>(&self, offset: u32) -> *mut T {
        debug_assert_ne!(offset, NIL, "dereferencing a NIL offset");
        debug_assert!(
            offset as usize + std::mem::size_of::<T>() <= self.len,
            "offset {:#x} out of bounds",
            offset
        );
        debug_assert_eq!(offset as usize % std::mem::align_of::<T>(), 0);
        unsafe { self.base.add(offset as usize) as *mut T }
    }

    #[inline]
    fn header(&self) -> &HeapHeader {
        unsafe { &*(self.base as *const HeapHeader) }
    }

    #[inline]
    fn entry_ptr(&self, index: u32) -> *mut RegionEntry {
        debug_assert!(index < self.header().dir_capacity);
        unsafe {
            (self.base.add(std::mem::size_of::<HeapHeader>()) as *mut RegionEntry)
                .add(index as usize)
        }
    }
}

impl Drop for ShmHeap {
    fn drop(&mut self) {
        // Keep the mapping alive until here; the unmap happens when
        // `mmap` drops after this body.
        let _ = &self.mmap;
        if self.owner {
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("failed to unlink heap {:?}: {}", self.path, e);
            } else {
                log::debug!("unlinked heap {:?}", self.path);
            }
        }
    }
}

impl std::fmt::Debug for ShmHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmHeap")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .field("regions", &self.region_count())
            .finish()
    }
}

fn entry_name_matches(entry: &RegionEntry, name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() > REGION_NAME_LEN {
        return false;
    }
    entry.name[..bytes.len()] == *bytes
        && (bytes.len() == REGION_NAME_LEN || entry.name[bytes.len()] == 0)
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}
