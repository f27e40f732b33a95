//! Virtual-memory reservation layer for a managed-runtime heap and its
//! generated-code regions.
//!
//! Wraps the host's mapping primitives to provide what application code
//! cannot get directly: regions aligned to arbitrary power-of-two
//! boundaries coarser than a page, write-xor-execute code memory (via a
//! permanent dual virtual alias where the host supports it, protection
//! transitions where it does not), and an optional single giant
//! reservation from which all managed-object memory is carved so object
//! references fit in 32 bits.
//!
//! Create a [`VmContext`] once during single-threaded startup, then
//! allocate through [`VirtualMemory::allocate_aligned`]. Independent
//! handles share no mutable state and may be used from any thread.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("vmregion supports only 64-bit targets.");

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
compile_error!("vmregion supports only Linux, Android and macOS hosts.");

mod aligned;
mod compressed;
mod context;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod dual;
mod os;
mod region;
mod virtual_memory;

pub use compressed::CompressedConfig;
pub use context::{NoSafepointChecks, SafepointChecker, VmConfig, VmContext};
pub use os::VmError;
pub use region::{Protection, Region};
pub use virtual_memory::VirtualMemory;
