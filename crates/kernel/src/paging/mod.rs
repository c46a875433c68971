//! The seam between address spaces and physical memory policy.
//!
//! The basic kernel commits every frame at load time; the demand-paging
//! kernel hands out frames at fault time and steals them back under
//! pressure. Both sit behind [`Pager`] so the process and syscall layers
//! are identical either way.

mod demand;
mod swap;

pub use demand::DemandPager;
pub use swap::{SwapStore, SWAP_FILE};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use machine::translation::{new_page_table, TranslationEntry};
use machine::{Machine, PageTable};

use crate::error::LoadError;
use crate::frames::FrameAllocator;
use crate::process::Space;
use crate::Pid;

/// Why a page fault could not be served. Every variant is fatal to the
/// faulting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The page lies outside the process's address space.
    OutOfRange,
    /// The kernel does not demand-page, so no fault is ever legitimate.
    NotDemandPaged,
    /// The ELF image could not be re-read.
    LoadFailed,
    /// No swap slot left to evict into.
    OutOfSwap,
    /// Every resident frame is pinned.
    NoVictim,
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Self::OutOfRange => "virtual page out of range",
            Self::NotDemandPaged => "page fault on a fully resident kernel",
            Self::LoadFailed => "executable page could not be reloaded",
            Self::OutOfSwap => "swap space exhausted",
            Self::NoVictim => "no evictable frame",
        };
        f.write_str(what)
    }
}

impl std::error::Error for FaultError {}

/// Frames currently partaking in a kernel-driven memory transfer. Pinned
/// frames are never chosen for eviction. Reference counted: the same frame
/// may back transfers from several kernel threads at once.
#[derive(Debug, Default)]
pub struct PinSet {
    counts: Mutex<HashMap<usize, usize>>,
}

impl PinSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, ppn: usize) {
        *self.counts.lock().unwrap().entry(ppn).or_insert(0) += 1;
    }

    pub fn unpin(&self, ppn: usize) {
        let mut counts = self.counts.lock().unwrap();
        match counts.get_mut(&ppn) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.remove(&ppn);
            }
            None => log::warn!("unpinning frame {ppn}, which is not pinned"),
        }
    }

    pub fn pinned_count(&self) -> usize {
        self.counts.lock().unwrap().len()
    }

    /// Holds the set stable while the replacement scanner runs.
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<usize, usize>> {
        self.counts.lock().unwrap()
    }
}

/// RAII pin on the frames backing one kernel transfer.
pub struct PinGuard {
    inner: Option<(Arc<PinSet>, Vec<usize>)>,
}

impl PinGuard {
    pub(crate) fn none() -> Self {
        Self { inner: None }
    }

    pub(crate) fn pinned(pins: Arc<PinSet>, frames: Vec<usize>) -> Self {
        Self {
            inner: Some((pins, frames)),
        }
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        if let Some((pins, frames)) = self.inner.take() {
            for ppn in frames {
                pins.unpin(ppn);
            }
        }
    }
}

/// Physical-memory policy for a kernel. Implementations own frame wiring;
/// the process layer only ever sees the shared page table.
pub trait Pager: Send + Sync {
    /// Whether unmapped user accesses should fault (`TlbMiss`) rather than
    /// bus-error.
    fn demand_paged(&self) -> bool;

    /// Builds the page table for a fresh address space of `num_pages`.
    fn build_table(&self, pid: Pid, num_pages: usize) -> Result<PageTable, LoadError>;

    /// Populates the image described by the space's sections, eagerly or
    /// not at all.
    fn map_image(&self, pid: Pid, space: &Space) -> Result<(), LoadError>;

    /// Makes `[vaddr, vaddr+len)` safe for a kernel-driven copy, pinning the
    /// backing frames until the guard drops.
    fn prepare(&self, pid: Pid, space: &Space, vaddr: u32, len: usize, write: bool) -> PinGuard;

    /// Serves a fault on `vpn`, evicting if memory is tight.
    fn page_fault(&self, pid: Pid, space: &Space, vpn: usize) -> Result<(), FaultError>;

    /// Context-switch-in: reconciles the process table with the kernel's
    /// own residence records.
    fn restore_state(&self, pid: Pid, space: &Space);

    /// Returns every frame and swap slot the space holds.
    fn release(&self, pid: Pid, space: &Space);

    /// Kernel termination: tear down any backing store.
    fn shutdown(&self);
}

/// The basic kernel's policy: all frames reserved up front, every entry
/// valid for the life of the process, faults impossible.
pub struct EagerPager {
    machine: Arc<Machine>,
    frames: Arc<FrameAllocator>,
}

impl EagerPager {
    pub fn new(machine: Arc<Machine>, frames: Arc<FrameAllocator>) -> Self {
        Self { machine, frames }
    }
}

impl Pager for EagerPager {
    fn demand_paged(&self) -> bool {
        false
    }

    fn build_table(&self, pid: Pid, num_pages: usize) -> Result<PageTable, LoadError> {
        let ppns = self
            .frames
            .allocate(pid, num_pages)
            .ok_or(LoadError::OutOfMemory)?;
        let entries = ppns
            .into_iter()
            .enumerate()
            .map(|(vpn, ppn)| TranslationEntry::new(vpn, ppn, true, false))
            .collect();
        Ok(new_page_table(entries))
    }

    fn map_image(&self, pid: Pid, space: &Space) -> Result<(), LoadError> {
        for span in &space.sections {
            log::debug!(
                "pid {pid}: initializing section {} ({} pages)",
                span.index,
                span.num_pages
            );
            for page in 0..span.num_pages {
                let vpn = span.first_vpn + page;
                let ppn = {
                    let mut entries = space.page_table.lock().unwrap();
                    let entry = &mut entries[vpn];
                    if span.read_only {
                        entry.read_only = true;
                    }
                    entry.ppn
                };
                space
                    .elf
                    .lock()
                    .unwrap()
                    .load_page(span.index, page, ppn, self.machine.memory())?;
            }
        }
        Ok(())
    }

    fn prepare(&self, _pid: Pid, _space: &Space, _vaddr: u32, _len: usize, _write: bool) -> PinGuard {
        PinGuard::none()
    }

    fn page_fault(&self, _pid: Pid, _space: &Space, _vpn: usize) -> Result<(), FaultError> {
        Err(FaultError::NotDemandPaged)
    }

    fn restore_state(&self, _pid: Pid, _space: &Space) {}

    fn release(&self, pid: Pid, _space: &Space) {
        self.frames.free_all(pid);
    }

    fn shutdown(&self) {}
}
