//! Raw OS mapping primitives.
//!
//! The only place in the crate that issues mapping syscalls. Everything
//! above works in terms of [`VmOps`] so the syscall surface stays in one
//! spot and the failure policy (which errors are recoverable, which
//! terminate) is decided here.

use std::ffi::c_void;
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::OnceLock;

#[derive(Debug)]
pub enum VmError {
    /// A mapping request was refused by the OS. Recoverable: the caller may
    /// retry with a smaller size or trigger a collection.
    MapFailed(io::Error),
    /// Creating or sizing the named backing object failed. Recoverable; on
    /// the capability probe path it permanently disables dual mapping.
    BackingFailed(io::Error),
    /// A protection change was refused. Unrecoverable: page permissions are
    /// in an unknown state. Public `protect` terminates instead of returning
    /// this; it only surfaces from the capability probe.
    ProtectionFailed(io::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed(e) => write!(f, "mapping failed: {e}"),
            VmError::BackingFailed(e) => write!(f, "backing object failed: {e}"),
            VmError::ProtectionFailed(e) => write!(f, "protection change failed: {e}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed(e) | VmError::BackingFailed(e) | VmError::ProtectionFailed(e) => {
                Some(e)
            }
        }
    }
}

impl VmError {
    /// Distinguishes "retry smaller" from "must terminate".
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, VmError::ProtectionFailed(_))
    }
}

/// Syscall seam. One implementation per platform family; tests and the
/// layers above go through this trait only.
pub(crate) trait VmOps {
    /// Create a mapping. `hint` may be null for an OS-chosen address.
    ///
    /// # Safety
    /// FFI. `size` must be non-zero; `fd` must be -1 for anonymous flags or
    /// a live descriptor for file-backed ones.
    unsafe fn map(
        hint: *mut c_void,
        size: usize,
        prot: libc::c_int,
        flags: libc::c_int,
        fd: libc::c_int,
    ) -> Result<NonNull<u8>, VmError>;

    /// Remove the mapping covering `[start, end)`. A zero-length range is a
    /// no-op with no syscall issued.
    ///
    /// # Safety
    /// `start..end` must be page-aligned and must not cover memory still in
    /// use.
    ///
    /// # Panics
    /// Unmap failure means the address-space bookkeeping is corrupt; the
    /// process terminates with the OS error.
    unsafe fn unmap(start: usize, end: usize);

    /// Change protection on `[address, address + size)`.
    ///
    /// # Safety
    /// The range must be page-aligned and mapped.
    unsafe fn protect(address: usize, size: usize, prot: libc::c_int) -> Result<(), VmError>;

    /// Advise the OS that the physical pages behind the range are unneeded.
    /// A hint only; the result is ignored and the virtual mapping stays
    /// valid.
    ///
    /// # Safety
    /// The range must be page-aligned and mapped.
    unsafe fn decommit(address: usize, size: usize);

    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

impl VmOps for PlatformVmOps {
    unsafe fn map(
        hint: *mut c_void,
        size: usize,
        prot: libc::c_int,
        flags: libc::c_int,
        fd: libc::c_int,
    ) -> Result<NonNull<u8>, VmError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe { libc::mmap(hint, size, prot, flags, fd, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(VmError::MapFailed(io::Error::last_os_error()));
        }
        log::trace!("mmap({hint:p}, {size:#x}, {prot}) -> {ptr:p}");
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| VmError::MapFailed(io::Error::other("mmap returned null")))
    }

    unsafe fn unmap(start: usize, end: usize) {
        debug_assert!(start <= end);
        let size = end - start;
        if size == 0 {
            return;
        }
        // Safety: FFI call to munmap; range validity upheld by caller.
        if unsafe { libc::munmap(start as *mut c_void, size) } != 0 {
            let err = io::Error::last_os_error();
            panic!("munmap({start:#x}, {size:#x}) failed: {err}");
        }
        log::trace!("munmap({start:#x}, {size:#x})");
    }

    unsafe fn protect(address: usize, size: usize, prot: libc::c_int) -> Result<(), VmError> {
        // Safety: FFI call to mprotect; range validity upheld by caller.
        if unsafe { libc::mprotect(address as *mut c_void, size, prot) } != 0 {
            return Err(VmError::ProtectionFailed(io::Error::last_os_error()));
        }
        log::trace!("mprotect({address:#x}, {size:#x}, {prot})");
        Ok(())
    }

    unsafe fn decommit(address: usize, size: usize) {
        // Safety: FFI call to madvise; range validity upheld by caller.
        unsafe {
            libc::madvise(address as *mut c_void, size, libc::MADV_DONTNEED);
        }
    }

    fn page_size() -> usize {
        static CACHED: OnceLock<usize> = OnceLock::new();
        *CACHED.get_or_init(|| {
            // Safety: FFI call to sysconf.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            assert!(
                raw > 0,
                "sysconf(_SC_PAGESIZE) failed: {}",
                io::Error::last_os_error()
            );
            let size = raw as usize;
            assert!(size.is_power_of_two(), "page size {size} is not a power of two");
            size
        })
    }
}

/// An anonymous shareable memory object named for OS-level attribution,
/// sized to `size` bytes and marked close-on-exec. The descriptor closes
/// when dropped; mappings made from it persist independently.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn create_backing(name: &str, size: usize) -> Result<std::os::fd::OwnedFd, VmError> {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    debug_assert!(!name.is_empty());
    let cname = std::ffi::CString::new(name).map_err(|_| {
        VmError::BackingFailed(io::Error::new(
            io::ErrorKind::InvalidInput,
            "backing name contains an interior nul",
        ))
    })?;
    // Safety: FFI call to memfd_create with a valid C string.
    let raw = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
    if raw == -1 {
        return Err(VmError::BackingFailed(io::Error::last_os_error()));
    }
    // Safety: raw is a freshly created, owned descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    // Safety: FFI call to ftruncate on a live descriptor.
    if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } == -1 {
        return Err(VmError::BackingFailed(io::Error::last_os_error()));
    }
    Ok(fd)
}
