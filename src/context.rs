//! Process-wide configuration, capability probing and lifecycle.
//!
//! A [`VmContext`] is created exactly once, during single-threaded startup,
//! before any allocation request, and threaded explicitly through every
//! call. Initialization is not self-synchronizing; the caller serializes
//! it. Dropping the context unmaps the compressed-heap reservation; no
//! other process-wide state is held.

use std::sync::{Arc, Mutex};

use crate::compressed::{CompressedConfig, CompressedHeap};
use crate::os::{PlatformVmOps, VmOps};
use crate::region::Region;

/// Engine-wide policy knobs consumed by this layer.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Code pages are kept non-writable while executable; executable
    /// allocations start Read+Write and transition via `protect`.
    pub write_protect_code: bool,
    /// Permit the dual-mapping technique for code memory. Subject to the
    /// runtime capability probe.
    pub dual_map_code: bool,
    /// A profiling/tracing integration is active that misattributes samples
    /// collected through aliased code pages; forces dual mapping off.
    pub profiler_active: bool,
    /// Configured heap capacity in bytes, for the mapping-count advisory.
    pub heap_capacity: usize,
    /// Compressed-pointer addressing mode: reserve one giant span and carve
    /// all non-executable managed memory out of it.
    pub compressed: Option<CompressedConfig>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            write_protect_code: true,
            dual_map_code: false,
            profiler_active: false,
            heap_capacity: 2 * 1024 * 1024 * 1024,
            compressed: None,
        }
    }
}

/// Safety collaborator consulted before every protection change.
///
/// Racing a protection change against another execution context running the
/// same instructions is undefined behavior, not a recoverable error, so the
/// precondition cannot be enforced here. Production embedders install
/// [`NoSafepointChecks`]; debug/test embedders install an implementation
/// that asserts every other context is parked at a safe point.
pub trait SafepointChecker: Send + Sync {
    fn assert_code_mutation_safe(&self, address: usize, size: usize);
}

/// The production no-op checker.
pub struct NoSafepointChecks;

impl SafepointChecker for NoSafepointChecks {
    fn assert_code_mutation_safe(&self, _address: usize, _size: usize) {}
}

/// Allocation route for executable requests, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecStrategy {
    /// Permanent RW region + RX alias over shared physical pages.
    DualMapped,
    /// One mapping; protection transitions happen later via `protect`.
    SingleMapped,
}

/// Allocation route for non-executable requests, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataStrategy {
    /// Carve a non-owning view out of the compressed-heap reservation.
    CompressedHeap,
    SingleMapped,
}

pub struct VmContext {
    config: VmConfig,
    page_size: usize,
    /// Capability-probe result; false permanently downgrades executable
    /// allocation to single mappings for the rest of the process.
    dual_map_enabled: bool,
    exec_strategy: ExecStrategy,
    data_strategy: DataStrategy,
    /// Copy of the reservation bounds, readable without the heap lock.
    compressed_span: Option<Region>,
    compressed: Option<Mutex<CompressedHeap>>,
    safepoint: Box<dyn SafepointChecker>,
}

impl VmContext {
    /// Initialize with the default (no-op) safepoint checker.
    pub fn init(config: VmConfig) -> Arc<Self> {
        Self::init_with_safety(config, Box::new(NoSafepointChecks))
    }

    /// Initialize the layer: validate the page size, eagerly reserve the
    /// compressed heap, run the dual-mapping capability probe and fix the
    /// allocation strategies.
    ///
    /// Must run once, during single-threaded startup, before any
    /// allocation.
    ///
    /// # Panics
    /// The startup reservations have no fallback: a compressed-heap
    /// reservation failure terminates with the OS error.
    pub fn init_with_safety(config: VmConfig, safepoint: Box<dyn SafepointChecker>) -> Arc<Self> {
        let page_size = PlatformVmOps::page_size();

        let compressed = config.compressed.as_ref().map(|c| {
            CompressedHeap::reserve(c)
                .unwrap_or_else(|e| panic!("failed to reserve region for compressed heap: {e}"))
        });
        let compressed_span = compressed.as_ref().map(CompressedHeap::region);

        let dual_map_enabled = probe_dual_mapping(&config, page_size);

        let exec_strategy = if dual_map_enabled && config.write_protect_code {
            ExecStrategy::DualMapped
        } else {
            ExecStrategy::SingleMapped
        };
        let data_strategy = if compressed.is_some() {
            DataStrategy::CompressedHeap
        } else {
            DataStrategy::SingleMapped
        };

        max_map_count_advisory(config.heap_capacity);

        Arc::new(Self {
            config,
            page_size,
            dual_map_enabled,
            exec_strategy,
            data_strategy,
            compressed_span,
            compressed: compressed.map(Mutex::new),
            safepoint,
        })
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether code memory is dual-mapped process-wide.
    #[must_use]
    pub fn dual_mapping_enabled(&self) -> bool {
        self.dual_map_enabled
    }

    #[must_use]
    pub fn write_protect_code(&self) -> bool {
        self.config.write_protect_code
    }

    pub(crate) fn exec_strategy(&self) -> ExecStrategy {
        self.exec_strategy
    }

    pub(crate) fn data_strategy(&self) -> DataStrategy {
        self.data_strategy
    }

    pub(crate) fn compressed(&self) -> Option<&Mutex<CompressedHeap>> {
        self.compressed.as_ref()
    }

    /// Containment check against the reservation bounds; lock-free.
    pub(crate) fn compressed_contains(&self, address: usize) -> bool {
        self.compressed_span.is_some_and(|span| span.contains(address))
    }

    pub(crate) fn safepoint(&self) -> &dyn SafepointChecker {
        &*self.safepoint
    }
}

/// One-time trial allocation: dual mapping is usable only if the backing
/// object primitive works, the two views land at distinct addresses, and
/// protection changes on them are honored (write demoted on the region,
/// execute promoted on the alias). Sandboxed containers fail the first
/// check; some kernels fail the latter two.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn probe_dual_mapping(config: &VmConfig, page_size: usize) -> bool {
    if !config.dual_map_code {
        return false;
    }
    if config.profiler_active {
        // Sample attribution through aliased code pages is garbled.
        log::info!("dual code mapping disabled for the active profiler integration");
        return false;
    }

    let size = page_size;
    let alignment = crate::compressed::GRANULE;
    let (region, alias) = match crate::dual::allocate(size, alignment, "vmregion-probe", std::ptr::null_mut()) {
        Ok(pair) => pair,
        Err(e) => {
            log::info!("memfd_create not usable ({e}); disabling dual mapping of code");
            return false;
        }
    };

    // Safety: probe-owned mappings, sized and aligned by dual::allocate.
    let ok = unsafe {
        region.start() != alias.start()
            && PlatformVmOps::protect(region.start(), size, libc::PROT_READ).is_ok()
            && PlatformVmOps::protect(alias.start(), size, libc::PROT_READ | libc::PROT_EXEC)
                .is_ok()
    };
    if !ok {
        log::info!("protection probe failed; disabling dual mapping of code");
    }
    // Safety: probe-owned mappings, no longer referenced.
    unsafe {
        PlatformVmOps::unmap(region.start(), region.end());
        PlatformVmOps::unmap(alias.start(), alias.end());
    }
    ok
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn probe_dual_mapping(_config: &VmConfig, _page_size: usize) -> bool {
    // No anonymous shareable memory object primitive on this host.
    false
}

/// Compare the kernel's mapping-count limit against what the configured
/// heap could need. Non-fatal: an undersized limit surfaces later as an
/// ordinary allocation failure.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn max_map_count_advisory(heap_capacity: usize) {
    let Ok(contents) = std::fs::read_to_string("/proc/sys/vm/max_map_count") else {
        return;
    };
    let Ok(max_map_count) = contents.trim().parse::<usize>() else {
        return;
    };
    let max_heap_pages = heap_capacity / crate::compressed::GRANULE;
    if max_map_count < max_heap_pages {
        log::warn!(
            "vm.max_map_count ({max_map_count}) is not large enough to support a \
             {heap_capacity}-byte heap; consider increasing it with \
             `sysctl -w vm.max_map_count={max_heap_pages}`"
        );
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn max_map_count_advisory(_heap_capacity: usize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressed::GRANULE;

    #[test]
    fn test_default_init() {
        let ctx = VmContext::init(VmConfig::default());
        assert_eq!(ctx.page_size(), PlatformVmOps::page_size());
        assert!(!ctx.dual_mapping_enabled());
        assert_eq!(ctx.exec_strategy(), ExecStrategy::SingleMapped);
        assert_eq!(ctx.data_strategy(), DataStrategy::SingleMapped);
        assert!(!ctx.compressed_contains(0x1000));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_probe_enables_dual_mapping() {
        let ctx = VmContext::init(VmConfig {
            dual_map_code: true,
            ..VmConfig::default()
        });
        // On a host where memfd works the probe must succeed; if it is
        // sandboxed away, the flag must be off and the strategy downgraded.
        if ctx.dual_mapping_enabled() {
            assert_eq!(ctx.exec_strategy(), ExecStrategy::DualMapped);
        } else {
            assert_eq!(ctx.exec_strategy(), ExecStrategy::SingleMapped);
        }
    }

    #[test]
    fn test_profiler_disables_dual_mapping() {
        let ctx = VmContext::init(VmConfig {
            dual_map_code: true,
            profiler_active: true,
            ..VmConfig::default()
        });
        assert!(!ctx.dual_mapping_enabled());
        assert_eq!(ctx.exec_strategy(), ExecStrategy::SingleMapped);
    }

    #[test]
    fn test_dual_mapping_without_write_protection_stays_single() {
        // Dual mapping only pays off when code pages are write-protected by
        // policy; otherwise executable memory is mapped RWX directly.
        let ctx = VmContext::init(VmConfig {
            dual_map_code: true,
            write_protect_code: false,
            ..VmConfig::default()
        });
        assert_eq!(ctx.exec_strategy(), ExecStrategy::SingleMapped);
    }

    #[test]
    fn test_compressed_reservation_lifecycle() {
        let config = VmConfig {
            compressed: Some(CompressedConfig {
                size: 8 * GRANULE,
                alignment: 4 * 1024 * 1024,
            }),
            ..VmConfig::default()
        };
        let span = {
            let ctx = VmContext::init(config);
            assert_eq!(ctx.data_strategy(), DataStrategy::CompressedHeap);
            let span = ctx.compressed_span.expect("span recorded");
            assert!(ctx.compressed_contains(span.start()));
            assert!(!ctx.compressed_contains(span.end()));
            span
        };
        // Context dropped: the reservation is gone. mincore on an unmapped
        // page reports ENOMEM. (Another thread could in principle map the
        // hole in the meantime, so only the common case is asserted.)
        let mut residency = [0u8; 1];
        // Safety: Test code; mincore only inspects, never touches, the range.
        let rc = unsafe {
            libc::mincore(
                span.start() as *mut std::ffi::c_void,
                PlatformVmOps::page_size(),
                residency.as_mut_ptr().cast(),
            )
        };
        if rc == -1 {
            assert_eq!(
                std::io::Error::last_os_error().raw_os_error(),
                Some(libc::ENOMEM)
            );
        }
    }
}
