//! Write-xor-execute code memory via dual virtual aliases.
//!
//! One memfd backing object is mapped twice: a Read+Write "region" used by
//! the code generator and a Read+Execute "alias" used by the running
//! program. Both views share physical pages, so a write through the region
//! is immediately observable through the alias, and no byte is ever
//! writable and executable at the same address. The descriptor is closed as
//! soon as the mappings exist; mappings persist independent of it.
//!
//! Linux/Android only; macOS has no anonymous shareable object primitive
//! here and falls back to single mappings with `MAP_JIT`.

use std::ffi::c_void;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;

use crate::aligned::{allocated_size_for, map_aligned_fd};
use crate::os::{create_backing, PlatformVmOps, VmError, VmOps};
use crate::region::Region;

/// Allocate a dual-mapped code span: `(region, alias)`, both `size` bytes,
/// both `alignment`-aligned, at distinct addresses.
///
/// `exec_hint` is passed for the executable alias so indirect branch
/// targets stay within the displacement range favorable to branch
/// predictors. Any failure mid-sequence unwinds every mapping and the
/// backing object created so far.
pub(crate) fn allocate(
    size: usize,
    alignment: usize,
    name: &str,
    exec_hint: *mut c_void,
) -> Result<(Region, Region), VmError> {
    let fd = create_backing(name, size)?;
    let allocated_size = allocated_size_for(size, alignment);

    // Safety: fd is live and sized to `size`; alignment preconditions are
    // the caller's contract.
    let region = unsafe {
        map_aligned_fd(
            std::ptr::null_mut(),
            fd.as_raw_fd(),
            libc::PROT_READ | libc::PROT_WRITE,
            size,
            alignment,
            allocated_size,
        )
    }?;

    // The alias is RX from the start and never changes protection until it
    // is eventually unmapped.
    // Safety: same contract as above.
    let alias = unsafe {
        map_aligned_fd(
            exec_hint,
            fd.as_raw_fd(),
            libc::PROT_READ | libc::PROT_EXEC,
            size,
            alignment,
            allocated_size,
        )
    };
    let alias = match alias {
        Ok(a) => a,
        Err(e) => {
            let start = region.as_ptr() as usize;
            // Safety: the region mapping is ours and unused.
            unsafe { PlatformVmOps::unmap(start, start + size) };
            return Err(e);
        }
    };
    debug_assert_ne!(region, alias);
    // fd drops here; both mappings outlive it.
    Ok((Region::new(region, size), Region::new(alias, size)))
}

/// A single mapping backed by a named object, so the span carries an
/// attribution name in OS accounting. Used for ordinary allocations while
/// the backing-object primitive is known to work.
pub(crate) fn allocate_named_single(
    size: usize,
    alignment: usize,
    prot: libc::c_int,
    name: &str,
) -> Result<NonNull<u8>, VmError> {
    let fd = create_backing(name, size)?;
    // Safety: fd is live and sized to `size`.
    unsafe {
        map_aligned_fd(
            std::ptr::null_mut(),
            fd.as_raw_fd(),
            prot,
            size,
            alignment,
            allocated_size_for(size, alignment),
        )
    }
}
