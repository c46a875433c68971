/// Bytes per page. Fixed power of two shared by virtual and physical pages.
pub const PAGE_SIZE: usize = 1024;

/// Machine geometry. Everything the kernel needs to know about the simulated
/// hardware before it boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    /// Number of physical page frames backing the machine.
    pub num_phys_pages: usize,
    /// Number of entries in the software-managed TLB.
    pub tlb_size: usize,
    /// Number of page-sized slots in the backing swap file.
    pub num_swap_slots: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            num_phys_pages: 32,
            tlb_size: 4,
            num_swap_slots: 64,
        }
    }
}

impl MachineConfig {
    pub fn with_phys_pages(num_phys_pages: usize) -> Self {
        Self {
            num_phys_pages,
            ..Self::default()
        }
    }
}
