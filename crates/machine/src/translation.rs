use std::sync::{Arc, Mutex};

/// One row of a page table: a virtual page mapped to a physical frame plus
/// status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    /// Virtual page number.
    pub vpn: usize,
    /// Physical page number. Meaningless unless `valid` is set.
    pub ppn: usize,
    /// The mapping is resident and may be used for translation.
    pub valid: bool,
    /// User-mode writes through this entry trap.
    pub read_only: bool,
    /// Set on any access through the entry.
    pub used: bool,
    /// Set on any write through the entry.
    pub dirty: bool,
}

impl TranslationEntry {
    pub fn new(vpn: usize, ppn: usize, valid: bool, read_only: bool) -> Self {
        Self {
            vpn,
            ppn,
            valid,
            read_only,
            used: false,
            dirty: false,
        }
    }

    /// An entry that translates nothing yet.
    pub fn invalid(vpn: usize) -> Self {
        Self::new(vpn, 0, false, false)
    }
}

/// A process page table, shared by handle between the owning process, the
/// CPU context running its user thread, and (under demand paging) the
/// kernel's inverted table. The handle plays the role of the single table
/// object the hardware's `setPageTable` points at.
pub type PageTable = Arc<Mutex<Vec<TranslationEntry>>>;

pub fn new_page_table(entries: Vec<TranslationEntry>) -> PageTable {
    Arc::new(Mutex::new(entries))
}
