//! The compressed-heap reservation.
//!
//! One process-lifetime span, reserved inaccessible, from which all
//! non-executable managed memory is carved so object references fit in 32
//! bits. Grants are handed out at a fixed granularity from a page bitmap;
//! releasing a grant only clears bitmap bits and decommits — the virtual
//! mapping stays intact until the whole reservation is unmapped at
//! teardown.

use fixedbitset::FixedBitSet;

use crate::aligned::{allocated_size_for, map_aligned};
use crate::os::{PlatformVmOps, VmError, VmOps};
use crate::region::{round_up, Region};

/// Grant granularity. Matches the heap's page size; one bitmap bit covers
/// one granule.
pub(crate) const GRANULE: usize = 512 * 1024;

/// Size and alignment of the compressed-heap reservation.
#[derive(Debug, Clone, Copy)]
pub struct CompressedConfig {
    /// Total reservation size. Must be a multiple of the grant granularity.
    pub size: usize,
    /// Reservation alignment; also the upper bound on per-grant alignment.
    pub alignment: usize,
}

impl Default for CompressedConfig {
    /// 4 GiB at 4 GiB alignment: the span addressable by a 32-bit offset.
    fn default() -> Self {
        Self {
            size: 4 * 1024 * 1024 * 1024,
            alignment: 4 * 1024 * 1024 * 1024,
        }
    }
}

pub(crate) struct CompressedHeap {
    region: Region,
    /// Occupancy per granule.
    granules: FixedBitSet,
}

impl CompressedHeap {
    /// Reserve the whole span, inaccessible, at the configured alignment.
    pub(crate) fn reserve(config: &CompressedConfig) -> Result<Self, VmError> {
        let page_size = PlatformVmOps::page_size();
        debug_assert!(config.size > 0 && config.size % GRANULE == 0);
        debug_assert!(config.alignment.is_power_of_two());
        debug_assert!(config.alignment % page_size == 0);

        // Safety: size/alignment contract checked above.
        let start = unsafe {
            map_aligned(
                std::ptr::null_mut(),
                libc::PROT_NONE,
                config.size,
                config.alignment,
                allocated_size_for(config.size, config.alignment),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            )
        }?;
        Ok(Self {
            region: Region::new(start, config.size),
            granules: FixedBitSet::with_capacity(config.size / GRANULE),
        })
    }

    pub(crate) fn region(&self) -> Region {
        self.region
    }

    pub(crate) fn contains(&self, address: usize) -> bool {
        self.region.contains(address)
    }

    /// First-fit grant of `size` bytes at `alignment`. Returns `None` when
    /// no run of free granules is large enough; the caller treats that as an
    /// ordinary allocation failure.
    ///
    /// The granted range is still inaccessible; the caller promotes it to
    /// Read+Write.
    pub(crate) fn allocate(&mut self, size: usize, alignment: usize) -> Option<Region> {
        debug_assert!(size > 0);
        debug_assert!(alignment.is_power_of_two());
        // Grants inherit the reservation's alignment; anything coarser than
        // the granule must divide the base.
        debug_assert!(alignment <= GRANULE || self.region.start() % alignment == 0);

        let count = round_up(size, GRANULE) / GRANULE;
        let stride = alignment.max(GRANULE) / GRANULE;
        let total = self.granules.len();

        let mut index = 0;
        while index + count <= total {
            if let Some(taken) = (index..index + count).find(|&i| self.granules.contains(i)) {
                // Skip past the conflict, keeping the stride.
                index = (taken + 1).div_ceil(stride) * stride;
                continue;
            }
            for i in index..index + count {
                self.granules.set(i, true);
            }
            let start = self.region.start() + index * GRANULE;
            // Safety: start is inside a live non-null mapping.
            let ptr = unsafe { std::ptr::NonNull::new_unchecked(start as *mut u8) };
            return Some(Region::new(ptr, size));
        }
        None
    }

    /// Return a granted range to the bitmap. The pages themselves are only
    /// decommitted (by the handle), never unmapped.
    pub(crate) fn free(&mut self, start: usize, size: usize) {
        debug_assert!(self.contains(start));
        debug_assert_eq!((start - self.region.start()) % GRANULE, 0);
        let first = (start - self.region.start()) / GRANULE;
        let count = round_up(size, GRANULE) / GRANULE;
        for i in first..first + count {
            debug_assert!(self.granules.contains(i), "double free of granule {i}");
            self.granules.set(i, false);
        }
    }
}

impl Drop for CompressedHeap {
    fn drop(&mut self) {
        // The one call that unmaps the reservation, at process teardown.
        // Safety: the span was mapped by reserve() and all grants are views
        // into it; nothing survives the context that owns this heap.
        unsafe { PlatformVmOps::unmap(self.region.start(), self.region.end()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> CompressedConfig {
        CompressedConfig {
            size: 32 * GRANULE,
            alignment: 4 * 1024 * 1024,
        }
    }

    #[test]
    fn test_reservation_alignment_and_bounds() {
        let config = small_config();
        let heap = CompressedHeap::reserve(&config).expect("reserve failed");
        assert_eq!(heap.region().start() % config.alignment, 0);
        assert_eq!(heap.region().size(), config.size);
        assert!(heap.contains(heap.region().start()));
        assert!(!heap.contains(heap.region().end()));
    }

    #[test]
    fn test_first_fit_and_reuse() {
        let mut heap = CompressedHeap::reserve(&small_config()).expect("reserve failed");
        let page = PlatformVmOps::page_size();

        let a = heap.allocate(GRANULE, page).expect("grant a");
        let b = heap.allocate(GRANULE, page).expect("grant b");
        assert_eq!(a.start(), heap.region().start());
        assert_eq!(b.start(), a.start() + GRANULE);

        heap.free(a.start(), a.size());
        let c = heap.allocate(GRANULE, page).expect("grant c");
        // First fit reuses the freed slot.
        assert_eq!(c.start(), a.start());
    }

    #[test]
    fn test_sub_granule_request_rounds_up() {
        let mut heap = CompressedHeap::reserve(&small_config()).expect("reserve failed");
        let page = PlatformVmOps::page_size();

        let a = heap.allocate(page, page).expect("grant a");
        assert_eq!(a.size(), page);
        let b = heap.allocate(page, page).expect("grant b");
        // The whole granule is consumed even for a one-page grant.
        assert_eq!(b.start(), a.start() + GRANULE);
    }

    #[test]
    fn test_aligned_grant() {
        let mut heap = CompressedHeap::reserve(&small_config()).expect("reserve failed");
        let page = PlatformVmOps::page_size();

        // Occupy the first granule so an aligned request must skip ahead.
        let _first = heap.allocate(GRANULE, page).expect("grant");
        let alignment = 4 * GRANULE;
        let aligned = heap.allocate(GRANULE, alignment).expect("aligned grant");
        assert_eq!(aligned.start() % alignment, 0);
        assert!(aligned.start() > heap.region().start());
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let config = CompressedConfig {
            size: 4 * GRANULE,
            alignment: 4 * 1024 * 1024,
        };
        let mut heap = CompressedHeap::reserve(&config).expect("reserve failed");
        let page = PlatformVmOps::page_size();
        assert!(heap.allocate(4 * GRANULE, page).is_some());
        assert!(heap.allocate(GRANULE, page).is_none());
    }

    #[test]
    fn test_grant_becomes_writable_after_promotion() {
        let mut heap = CompressedHeap::reserve(&small_config()).expect("reserve failed");
        let page = PlatformVmOps::page_size();
        let grant = heap.allocate(page, page).expect("grant");
        // Safety: Test code; the grant is a live sub-range of the
        // reservation.
        unsafe {
            PlatformVmOps::protect(
                grant.start(),
                grant.size(),
                libc::PROT_READ | libc::PROT_WRITE,
            )
            .expect("promotion failed");
            *grant.pointer().as_ptr() = 77;
            assert_eq!(*grant.pointer().as_ptr(), 77);
        }
        heap.free(grant.start(), grant.size());
    }
}
