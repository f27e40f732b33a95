use std::ptr::NonNull;

/// A contiguous span of virtual address space.
///
/// Invariant: `start` and `size` are both multiples of the OS page size.
/// A `Region` is a plain value; ownership of the underlying mapping is
/// tracked by [`crate::VirtualMemory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    start: NonNull<u8>,
    size: usize,
}

// Safety: a Region is an address span, not a live reference; accessing the
// memory it names is gated by unsafe code elsewhere.
unsafe impl Send for Region {}
// Safety: same as Send; Region itself holds no interior mutability.
unsafe impl Sync for Region {}

impl Region {
    pub(crate) fn new(start: NonNull<u8>, size: usize) -> Self {
        Self { start, size }
    }

    #[must_use]
    pub fn pointer(&self) -> NonNull<u8> {
        self.start
    }

    /// Start address as an integer, for alignment arithmetic.
    #[must_use]
    pub fn start(&self) -> usize {
        self.start.as_ptr() as usize
    }

    /// One past the last byte of the span.
    #[must_use]
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.start() && address < self.end()
    }
}

/// Access rights for a span of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    NoAccess,
    ReadOnly,
    ReadWrite,
    ReadExecute,
    ReadWriteExecute,
}

impl Protection {
    pub(crate) fn as_posix(self) -> libc::c_int {
        match self {
            Protection::NoAccess => libc::PROT_NONE,
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ReadWriteExecute => {
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
            }
        }
    }
}

pub(crate) fn round_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub(crate) fn round_down(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_bounds() {
        let start = NonNull::new(0x10000 as *mut u8).unwrap();
        let region = Region::new(start, 0x4000);
        assert_eq!(region.start(), 0x10000);
        assert_eq!(region.end(), 0x14000);
        assert_eq!(region.size(), 0x4000);
        assert!(region.contains(0x10000));
        assert!(region.contains(0x13fff));
        assert!(!region.contains(0x14000));
        assert!(!region.contains(0xffff));
    }

    #[test]
    fn test_round_up_down() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(round_down(4097, 4096), 4096);
        assert_eq!(round_down(4095, 4096), 0);
    }

    #[test]
    fn test_protection_bits() {
        assert_eq!(Protection::NoAccess.as_posix(), libc::PROT_NONE);
        assert_eq!(
            Protection::ReadWrite.as_posix(),
            libc::PROT_READ | libc::PROT_WRITE
        );
        // W^X pairs never share a writable+executable bit set.
        let rx = Protection::ReadExecute.as_posix();
        assert_eq!(rx & libc::PROT_WRITE, 0);
        let rw = Protection::ReadWrite.as_posix();
        assert_eq!(rw & libc::PROT_EXEC, 0);
    }
}
