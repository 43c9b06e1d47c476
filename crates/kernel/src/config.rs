//! Runtime kernel configuration.
//!
//! The reference implementation selected its paging and instrumentation
//! behavior with compile-time switches; here each switch is a field chosen
//! at boot.  `use_tlb`, `demand_loading` and `swap` form the paging matrix:
//! demand loading requires the software TLB, and swapping requires demand
//! loading.

use std::path::PathBuf;

/// Physical frames installed when nothing else is requested.
pub const DEFAULT_NUM_PHYS_PAGES: usize = 32;

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Route user translations through the software TLB.
    pub use_tlb: bool,
    /// Defer frame allocation and segment I/O until first touch.
    pub demand_loading: bool,
    /// Page out to per-process `SWAP.<id>` files when frames run out.
    pub swap: bool,
    /// Pick eviction victims by age instead of FIFO rotation.
    pub use_lru: bool,
    /// Extra tracing in the semaphore path.
    pub semaphore_test: bool,
    /// Timer ticks between preemption requests, if any.
    pub time_slice: Option<u64>,
    /// Number of physical frames in the simulated machine.
    pub num_phys_pages: usize,
    /// Host file backing the simulated disk.
    pub disk_path: PathBuf,
    /// Lay down a fresh filesystem on the disk at boot.
    pub format_disk: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            use_tlb: false,
            demand_loading: false,
            swap: false,
            use_lru: false,
            semaphore_test: false,
            time_slice: None,
            num_phys_pages: DEFAULT_NUM_PHYS_PAGES,
            disk_path: PathBuf::from("DISK"),
            format_disk: false,
        }
    }
}

impl KernelConfig {
    /// Panics if the paging switches contradict each other.
    pub fn validate(&self) {
        assert!(
            !self.demand_loading || self.use_tlb,
            "demand loading requires the software TLB"
        );
        assert!(
            !self.swap || self.demand_loading,
            "swapping requires demand loading"
        );
        assert!(self.num_phys_pages > 0, "need at least one physical frame");
    }
}
