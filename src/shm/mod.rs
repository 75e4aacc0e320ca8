//! Named-region shared-memory allocation
//!
//! This module provides the allocation substrate the map is built on: one
//! shared file mapping (the *heap*) per map, carved into named regions
//! through a directory kept inside the mapping itself. A primary process
//! creates the heap; any number of secondaries attach to it.
//!
//! Because POSIX gives no guarantee that two processes map the same file
//! at the same virtual address, nothing stored inside the heap is a raw
//! pointer. All intra-heap links are `u32` byte offsets from the heap
//! base, with [`NIL`] as the null value, and are resolved against the
//! local mapping on every dereference.

mod heap;

pub use heap::{ShmHeap, ShmRegion};

pub(crate) use heap::HEAP_ALIGN;

use bitflags::bitflags;

/// Null value for intra-heap offsets
pub const NIL: u32 = u32::MAX;

/// Maximum length of a region name, in bytes
pub const REGION_NAME_LEN: usize = 32;

bitflags! {
    /// Flags accepted by [`ShmHeap::reserve`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// Treat `size` as a hint: if the heap cannot satisfy the full
        /// request, hand out the largest remaining aligned block instead
        /// of failing.
        const SIZE_HINT_ONLY = 1 << 0;
    }
}

/// Round `value` up to a multiple of `align` (`align` must be a power of two)
#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(100, 8), 104);
    }

    #[test]
    fn test_region_flags() {
        let flags = RegionFlags::SIZE_HINT_ONLY;
        assert!(flags.contains(RegionFlags::SIZE_HINT_ONLY));
        assert!(RegionFlags::empty().is_empty());
    }
}
