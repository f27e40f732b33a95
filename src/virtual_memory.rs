//! The owning handle over a reserved span.
//!
//! A `VirtualMemory` tracks one primary region and, for dual-mapped code,
//! an alias of the same physical pages at a different address and
//! protection. It is created by [`VirtualMemory::allocate_aligned`], mutated
//! only through protection changes, and destroyed exactly once — Rust's
//! move semantics make the single-use destruction contract structural.

use std::ffi::c_void;
use std::io;
use std::sync::Arc;

use crate::aligned::{allocated_size_for, map_aligned};
use crate::context::{DataStrategy, VmContext};
use crate::os::{PlatformVmOps, VmError, VmOps};
use crate::region::{round_down, Protection, Region};

#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::context::ExecStrategy;

pub struct VirtualMemory {
    ctx: Arc<VmContext>,
    /// The primary span handed to the caller. Read+Write under dual
    /// mapping.
    region: Region,
    /// Read+Execute view of the same physical pages when dual-mapped;
    /// equal to `region` otherwise.
    alias: Region,
    /// False for views into the compressed heap, whose mapping outlives
    /// every handle.
    owns_mapping: bool,
}

/// A hint address near the engine's own code image. Some
/// microarchitectures predict only the low 32 bits of indirect branch
/// targets, so generated code should land within 4 GiB of the code calling
/// into it.
fn engine_image_hint(page_size: usize) -> *mut c_void {
    fn anchor() {}
    round_down(anchor as fn() as usize, page_size) as *mut c_void
}

impl std::fmt::Debug for VirtualMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMemory")
            .field("region", &self.region)
            .field("alias", &self.alias)
            .field("owns_mapping", &self.owns_mapping)
            .finish_non_exhaustive()
    }
}

impl VirtualMemory {
    /// Allocate `size` bytes at `alignment`, routed by the strategies fixed
    /// at startup: a compressed-heap view for non-executable requests when
    /// that addressing mode is active, a dual mapping for executable
    /// requests when the capability and the write-protection policy allow
    /// it, otherwise a single mapping (named for attribution where the
    /// backing-object primitive is known to work).
    ///
    /// When the write-protection policy is active, executable requests are
    /// allocated Read+Write and transition to Read+Execute later via
    /// [`VirtualMemory::protect`]; a dual-mapped alias is Read+Execute from
    /// the start and never changes.
    ///
    /// `size` must be a page-size multiple, `alignment` a power-of-two
    /// page-size multiple, `name` non-empty (attribution only). Violations
    /// are checked in debug builds.
    ///
    /// # Errors
    /// [`VmError::MapFailed`]/[`VmError::BackingFailed`] on resource
    /// exhaustion; the caller may collect garbage or report out-of-memory.
    pub fn allocate_aligned(
        ctx: &Arc<VmContext>,
        size: usize,
        alignment: usize,
        executable: bool,
        name: &str,
    ) -> Result<Self, VmError> {
        let page_size = ctx.page_size();
        debug_assert!(
            size > 0 && size % page_size == 0,
            "size {size:#x} is not a page-size multiple"
        );
        debug_assert!(
            alignment.is_power_of_two() && alignment % page_size == 0,
            "alignment {alignment:#x} must be a power-of-two page-size multiple"
        );
        debug_assert!(!name.is_empty(), "allocation name must be non-empty");

        // Compressed-pointer mode routes every non-executable request into
        // the heap reservation; executable requests never compose with it.
        if !executable && ctx.data_strategy() == DataStrategy::CompressedHeap {
            return Self::allocate_compressed_view(ctx, size, alignment);
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if executable && ctx.exec_strategy() == ExecStrategy::DualMapped {
            let (region, alias) =
                crate::dual::allocate(size, alignment, name, engine_image_hint(page_size))?;
            return Ok(Self {
                ctx: Arc::clone(ctx),
                region,
                alias,
                owns_mapping: true,
            });
        }

        let prot = if executable && !ctx.write_protect_code() {
            Protection::ReadWriteExecute
        } else {
            Protection::ReadWrite
        }
        .as_posix();

        // The backing-object primitive is known to work: use it for single
        // mappings too, so the span carries a name in OS accounting.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if ctx.dual_mapping_enabled() {
            let start = crate::dual::allocate_named_single(size, alignment, prot, name)?;
            let region = Region::new(start, size);
            return Ok(Self {
                ctx: Arc::clone(ctx),
                region,
                alias: region,
                owns_mapping: true,
            });
        }

        #[allow(unused_mut)]
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        #[cfg(target_os = "macos")]
        if executable {
            flags |= libc::MAP_JIT;
        }
        let hint = if executable {
            engine_image_hint(page_size)
        } else {
            std::ptr::null_mut()
        };
        // Safety: size/alignment contract checked above.
        let start = unsafe {
            map_aligned(
                hint,
                prot,
                size,
                alignment,
                allocated_size_for(size, alignment),
                flags,
            )
        }?;
        let region = Region::new(start, size);
        Ok(Self {
            ctx: Arc::clone(ctx),
            region,
            alias: region,
            owns_mapping: true,
        })
    }

    fn allocate_compressed_view(
        ctx: &Arc<VmContext>,
        size: usize,
        alignment: usize,
    ) -> Result<Self, VmError> {
        let heap = ctx
            .compressed()
            .expect("compressed strategy without a reservation");
        let grant = heap.lock().unwrap().allocate(size, alignment);
        let Some(grant) = grant else {
            return Err(VmError::MapFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "compressed heap exhausted",
            )));
        };
        // Promote the grant from the reservation's NoAccess to ReadWrite.
        // Safety: the grant is a live sub-range of the reservation.
        if let Err(e) =
            unsafe { PlatformVmOps::protect(grant.start(), grant.size(), libc::PROT_READ | libc::PROT_WRITE) }
        {
            panic!("failed to promote compressed-heap grant: {e}");
        }
        Ok(Self {
            ctx: Arc::clone(ctx),
            region: grant,
            alias: grant,
            owns_mapping: false,
        })
    }

    /// Change access rights on `[address, address + size)`, rounded out to
    /// page boundaries, in one protection-change call. The range's base and
    /// size never change.
    ///
    /// Precondition (unenforced in release builds; see
    /// [`crate::SafepointChecker`]): either the calling context is the sole
    /// mutator of this code, or every other context that could execute or
    /// read the range is parked at a safe point.
    ///
    /// # Panics
    /// Protection-change failure has no valid continuation state; the
    /// process terminates with the OS error code.
    pub fn protect(ctx: &VmContext, address: usize, size: usize, mode: Protection) {
        ctx.safepoint().assert_code_mutation_safe(address, size);
        let page_address = round_down(address, ctx.page_size());
        let end_address = address + size;
        // Safety: page-rounded range; liveness is the caller's contract.
        if let Err(e) = unsafe {
            PlatformVmOps::protect(page_address, end_address - page_address, mode.as_posix())
        } {
            panic!(
                "mprotect({page_address:#x}, {:#x}, {mode:?}) failed: {e}",
                end_address - page_address
            );
        }
    }

    /// Unmap exactly `[address, address + size)` without destroying the
    /// owning handle. Returns `false` without unmapping anything when the
    /// address lies inside the compressed-heap reservation — that memory is
    /// reclaimed only through the heap's own accounting, never unmapped
    /// mid-process.
    pub fn free_sub_segment(ctx: &VmContext, address: usize, size: usize) -> bool {
        if ctx.compressed_contains(address) {
            return false;
        }
        // Safety: the caller owns the sub-range and stops using it here.
        unsafe { PlatformVmOps::unmap(address, address + size) };
        true
    }

    /// Shrink the handle to `new_size` bytes, unmapping the tail. For a
    /// compressed-heap view the tail is not applicable to direct unmapping
    /// and the handle keeps its full grant.
    ///
    /// Dual-mapped handles are never truncated; code spans are freed whole.
    pub fn truncate(&mut self, new_size: usize) {
        debug_assert!(new_size % self.ctx.page_size() == 0);
        debug_assert!(new_size <= self.region.size());
        debug_assert_eq!(self.alias_offset(), 0, "cannot truncate a dual-mapped span");
        if new_size == self.region.size() {
            return;
        }
        if Self::free_sub_segment(
            &self.ctx,
            self.region.start() + new_size,
            self.region.size() - new_size,
        ) {
            self.region = Region::new(self.region.pointer(), new_size);
            self.alias = self.region;
        }
    }

    /// Start address of the primary region.
    #[must_use]
    pub fn address(&self) -> usize {
        self.region.start()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.region.size()
    }

    #[must_use]
    pub fn region(&self) -> Region {
        self.region
    }

    /// Distance from the primary region to its executable alias; zero when
    /// not dual-mapped.
    #[must_use]
    pub fn alias_offset(&self) -> isize {
        self.alias.start() as isize - self.region.start() as isize
    }

    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        self.region.contains(address)
    }

    #[must_use]
    pub fn contains_alias(&self, address: usize) -> bool {
        self.alias_offset() != 0 && self.alias.contains(address)
    }

    /// False for views into the compressed heap.
    #[must_use]
    pub fn owns_mapping(&self) -> bool {
        self.owns_mapping
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        let start = self.region.start();
        if self.ctx.compressed_contains(start) {
            // Non-owning view: hint the pages away and hand the range back
            // to the heap's bookkeeping. The virtual mapping stays intact.
            // Safety: the grant is a live sub-range of the reservation.
            unsafe { PlatformVmOps::decommit(start, self.region.size()) };
            if let Some(heap) = self.ctx.compressed() {
                heap.lock().unwrap().free(start, self.region.size());
            }
            return;
        }
        if !self.owns_mapping {
            return;
        }
        // Safety: owned mappings; the handle is being destroyed and cannot
        // be used again.
        unsafe {
            PlatformVmOps::unmap(self.region.start(), self.region.end());
            if self.alias != self.region {
                PlatformVmOps::unmap(self.alias.start(), self.alias.end());
            }
        }
    }
}
