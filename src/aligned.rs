//! Over-allocate-and-trim aligned mapping.
//!
//! The OS mapping primitive only guarantees page alignment. To obtain a
//! coarser power-of-two alignment, request `size + alignment - page_size`
//! bytes, round the base up, and unmap the prefix and suffix. Both the
//! plain and the fd-backed allocation paths are built on this.

use std::ffi::c_void;
use std::ptr::NonNull;

use crate::os::{PlatformVmOps, VmError, VmOps};
use crate::region::round_up;

/// Bytes to request so that an aligned span of `size` bytes fits somewhere
/// inside the allocation.
pub(crate) fn allocated_size_for(size: usize, alignment: usize) -> usize {
    size + alignment - PlatformVmOps::page_size()
}

/// Map `allocated_size` anonymous bytes, trim to an `alignment`-aligned span
/// of exactly `size` bytes.
///
/// On mapping failure nothing has been trimmed yet, so there is no residual
/// state to clean up.
///
/// # Safety
/// `size` must be a page-size multiple, `alignment` a power-of-two page-size
/// multiple, `allocated_size` the value from [`allocated_size_for`].
pub(crate) unsafe fn map_aligned(
    hint: *mut c_void,
    prot: libc::c_int,
    size: usize,
    alignment: usize,
    allocated_size: usize,
    flags: libc::c_int,
) -> Result<NonNull<u8>, VmError> {
    // Safety: anonymous mapping; preconditions upheld by caller.
    let address = unsafe { PlatformVmOps::map(hint, allocated_size, prot, flags, -1) }?;

    let base = address.as_ptr() as usize;
    let aligned_base = round_up(base, alignment);

    // Safety: both trims are sub-ranges of the mapping just created and are
    // not yet handed to anyone.
    unsafe {
        PlatformVmOps::unmap(base, aligned_base);
        PlatformVmOps::unmap(aligned_base + size, base + allocated_size);
    }
    // Safety: aligned_base lies inside a successful non-null mapping.
    Ok(unsafe { NonNull::new_unchecked(aligned_base as *mut u8) })
}

/// The fd-backed variant used for named (and dual) mappings: reserve an
/// inaccessible span, then map the backing object `MAP_FIXED` at the aligned
/// base inside it. The fixed mapping atomically replaces the overlapping
/// part of the reservation; the non-overlapping prefix and suffix are
/// trimmed manually.
///
/// Mid-sequence failure unmaps the reservation, leaving zero residual state.
///
/// # Safety
/// Same alignment preconditions as [`map_aligned`]; `fd` must be a live
/// descriptor of at least `size` bytes.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) unsafe fn map_aligned_fd(
    hint: *mut c_void,
    fd: libc::c_int,
    prot: libc::c_int,
    size: usize,
    alignment: usize,
    allocated_size: usize,
) -> Result<NonNull<u8>, VmError> {
    // Safety: anonymous reservation; preconditions upheld by caller.
    let address = unsafe {
        PlatformVmOps::map(
            hint,
            allocated_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
        )
    }?;

    let base = address.as_ptr() as usize;
    let aligned_base = round_up(base, alignment);

    // Safety: MAP_FIXED inside our own fresh reservation.
    let fixed = unsafe {
        PlatformVmOps::map(
            aligned_base as *mut c_void,
            size,
            prot,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
        )
    };
    let fixed = match fixed {
        Ok(p) => p,
        Err(e) => {
            // Safety: the reservation is still wholly ours.
            unsafe { PlatformVmOps::unmap(base, base + allocated_size) };
            return Err(e);
        }
    };
    debug_assert_eq!(fixed.as_ptr() as usize, aligned_base);

    // Safety: prefix and suffix of the reservation, not covered by the fixed
    // mapping.
    unsafe {
        PlatformVmOps::unmap(base, aligned_base);
        PlatformVmOps::unmap(aligned_base + size, base + allocated_size);
    }
    Ok(fixed)
}
