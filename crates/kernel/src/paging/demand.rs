use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;

use machine::translation::{new_page_table, TranslationEntry};
use machine::{Machine, PageTable, PAGE_SIZE};

use super::swap::SwapStore;
use super::{FaultError, Pager, PinGuard, PinSet};
use crate::error::LoadError;
use crate::frames::FrameAllocator;
use crate::process::Space;
use crate::Pid;

/// Attempts to fault-and-pin one page before a kernel copy gives up.
const PIN_RETRIES: usize = 8;

/// A resident page: which frame holds it, and a handle on the owning
/// process's page table so the scanner can read its status bits and the
/// evictor can unmap it.
struct Resident {
    ppn: usize,
    table: PageTable,
}

/// The demand-paging kernel's memory policy.
///
/// Frames are handed out at fault time. The inverted table records exactly
/// the resident `(pid, vpn)` pairs; the swap-slot table records exactly the
/// pairs with a copy in the swap file. A slot binding survives swap-in, so
/// a page that stays clean after coming back can be dropped on its next
/// eviction without another write. Pages of the image can always be
/// re-read from the ELF, and untouched stack pages re-derive as zeros, so
/// only dirty victims are ever written out.
pub struct DemandPager {
    machine: Arc<Machine>,
    frames: Arc<FrameAllocator>,
    pins: Arc<PinSet>,
    swap: SwapStore,
    inverted: Mutex<HashMap<(Pid, usize), Resident>>,
}

impl DemandPager {
    pub fn new(machine: Arc<Machine>, frames: Arc<FrameAllocator>) -> Self {
        let swap = SwapStore::new(machine.file_system(), machine.config().num_swap_slots);
        Self {
            machine,
            frames,
            pins: Arc::new(PinSet::new()),
            swap,
            inverted: Mutex::new(HashMap::new()),
        }
    }

    pub fn pins(&self) -> &Arc<PinSet> {
        &self.pins
    }

    /// How many pages are resident machine-wide.
    pub fn resident_count(&self) -> usize {
        self.inverted.lock().unwrap().len()
    }

    pub fn is_resident(&self, pid: Pid, vpn: usize) -> bool {
        self.inverted.lock().unwrap().contains_key(&(pid, vpn))
    }

    /// How many pages currently have a copy in the swap file.
    pub fn swap_bound_count(&self) -> usize {
        self.swap.slots().bound_count()
    }

    /// A free frame for `pid`, evicting somebody if none is free.
    fn obtain_frame(&self, pid: Pid) -> Result<usize, FaultError> {
        if let Some(ppns) = self.frames.allocate(pid, 1) {
            return Ok(ppns[0]);
        }
        self.evict(pid)
    }

    /// Chooses a victim frame, writes it out if it must be, and hands the
    /// frame to `for_pid`.
    ///
    /// Frames are scanned in rotating order from a random start and looked
    /// up in the inverted table. Preference passes: clean and unused, then
    /// unused, then anything resident. Pinned frames never qualify; dirty
    /// candidates qualify only while a swap slot can back them.
    fn evict(&self, for_pid: Pid) -> Result<usize, FaultError> {
        let num_phys = self.machine.memory().num_pages();
        let start = rand::thread_rng().gen_range(0..num_phys);

        // Pin set and slot table stay locked through selection so a page
        // pinned mid-scan cannot be chosen and a chosen dirty victim cannot
        // lose its slot.
        let pins = self.pins.lock();
        let mut slots = self.swap.slots();
        let mut inverted = self.inverted.lock().unwrap();

        let mut by_frame: Vec<Option<(Pid, usize)>> = vec![None; num_phys];
        for (&key, resident) in inverted.iter() {
            by_frame[resident.ppn] = Some(key);
        }

        let mut victim = None;
        let mut blocked_on_swap = false;
        'select: for pass in 0..3 {
            for i in 0..num_phys {
                let frame = (start + i) % num_phys;
                if pins.contains_key(&frame) {
                    continue;
                }
                let Some(key) = by_frame[frame] else { continue };
                let entry = {
                    let resident = &inverted[&key];
                    resident.table.lock().unwrap()[key.1]
                };
                if !entry.valid {
                    continue;
                }
                let preferred = match pass {
                    0 => !entry.dirty && !entry.used,
                    1 => {
                        // Second-chance sweep: spare the page this time but
                        // clear its reference so it cannot stay hot forever.
                        if entry.used {
                            inverted[&key].table.lock().unwrap()[key.1].used = false;
                        }
                        !entry.used
                    }
                    _ => true,
                };
                if !preferred {
                    continue;
                }
                if entry.dirty && !slots.can_bind(key.0, key.1) {
                    blocked_on_swap = true;
                    continue;
                }
                victim = Some((key, entry));
                break 'select;
            }
        }

        let Some(((vpid, vvpn), entry)) = victim else {
            return Err(if blocked_on_swap {
                FaultError::OutOfSwap
            } else {
                FaultError::NoVictim
            });
        };

        let resident = inverted.remove(&(vpid, vvpn)).unwrap();
        {
            let mut table = resident.table.lock().unwrap();
            table[vvpn].valid = false;
        }
        if entry.dirty {
            // Write-back happens before the locks drop, so a concurrent
            // fault on the victim cannot read the slot early.
            let slot = slots
                .bind(vpid, vvpn)
                .expect("victim chosen without a bindable slot");
            let page = self.machine.memory().read_page(resident.ppn);
            self.swap.write_slot(slot, &page);
            log::trace!("pid {vpid}: page {vvpn} evicted from frame {} to slot {slot}", resident.ppn);
        } else {
            log::trace!("pid {vpid}: clean page {vvpn} dropped from frame {}", resident.ppn);
        }
        drop(inverted);
        drop(slots);
        drop(pins);

        self.frames.transfer(vpid, resident.ppn, for_pid);
        Ok(resident.ppn)
    }
}

impl Pager for DemandPager {
    fn demand_paged(&self) -> bool {
        true
    }

    fn build_table(&self, _pid: Pid, num_pages: usize) -> Result<PageTable, LoadError> {
        let entries = (0..num_pages).map(TranslationEntry::invalid).collect();
        Ok(new_page_table(entries))
    }

    fn map_image(&self, _pid: Pid, _space: &Space) -> Result<(), LoadError> {
        // Image pages come in through faults.
        Ok(())
    }

    fn prepare(&self, pid: Pid, space: &Space, vaddr: u32, len: usize, write: bool) -> PinGuard {
        let _ = write;
        if len == 0 || space.num_pages == 0 {
            return PinGuard::none();
        }
        let first = vaddr as usize / PAGE_SIZE;
        let last = ((vaddr as usize + len - 1) / PAGE_SIZE).min(space.num_pages - 1);
        if first > last {
            return PinGuard::none();
        }

        let mut pinned = Vec::new();
        'pages: for vpn in first..=last {
            for _attempt in 0..PIN_RETRIES {
                let entry = { space.page_table.lock().unwrap()[vpn] };
                if !entry.valid {
                    if self.page_fault(pid, space, vpn).is_err() {
                        // The transfer will stop at this page on its own.
                        break 'pages;
                    }
                    continue;
                }
                self.pins.pin(entry.ppn);
                let check = { space.page_table.lock().unwrap()[vpn] };
                if check.valid && check.ppn == entry.ppn {
                    pinned.push(entry.ppn);
                    continue 'pages;
                }
                // Lost the frame between the fault and the pin; try again.
                self.pins.unpin(entry.ppn);
            }
            log::warn!("pid {pid}: could not stabilize page {vpn} for a kernel copy");
            break 'pages;
        }
        PinGuard::pinned(Arc::clone(&self.pins), pinned)
    }

    fn page_fault(&self, pid: Pid, space: &Space, vpn: usize) -> Result<(), FaultError> {
        if vpn >= space.num_pages {
            return Err(FaultError::OutOfRange);
        }
        if space.page_table.lock().unwrap()[vpn].valid {
            // Another kernel path already brought the page in.
            return Ok(());
        }

        let frame = self.obtain_frame(pid)?;
        let mut entry = TranslationEntry::new(vpn, frame, true, false);
        entry.used = true;

        if let Some(slot) = self.swap.binding(pid, vpn) {
            let page = self.swap.read_slot(slot);
            self.machine.memory().write_page(frame, &page);
            log::trace!("pid {pid}: page {vpn} swapped in from slot {slot} to frame {frame}");
        } else if let Some((span, page)) = space.section_for(vpn) {
            let loaded = space
                .elf
                .lock()
                .unwrap()
                .load_page(span.index, page, frame, self.machine.memory());
            if let Err(err) = loaded {
                log::warn!("pid {pid}: reload of image page {vpn} failed: {err}");
                self.frames.free(pid, frame);
                return Err(FaultError::LoadFailed);
            }
            entry.read_only = span.read_only;
            log::trace!("pid {pid}: image page {vpn} loaded into frame {frame}");
        } else {
            // Stack or argument page touched for the first time.
            self.machine.memory().zero_page(frame);
            log::trace!("pid {pid}: zero page {vpn} materialized in frame {frame}");
        }

        space.page_table.lock().unwrap()[vpn] = entry;
        self.inverted.lock().unwrap().insert(
            (pid, vpn),
            Resident {
                ppn: frame,
                table: Arc::clone(&space.page_table),
            },
        );
        Ok(())
    }

    fn restore_state(&self, pid: Pid, space: &Space) {
        // The inverted table is authoritative across a context switch.
        let inverted = self.inverted.lock().unwrap();
        let mut table = space.page_table.lock().unwrap();
        for vpn in 0..table.len() {
            match inverted.get(&(pid, vpn)) {
                Some(resident) => {
                    table[vpn].ppn = resident.ppn;
                    table[vpn].valid = true;
                }
                None => table[vpn].valid = false,
            }
        }
    }

    fn release(&self, pid: Pid, _space: &Space) {
        let resident: Vec<((Pid, usize), Resident)> = {
            let mut inverted = self.inverted.lock().unwrap();
            let keys: Vec<(Pid, usize)> = inverted
                .keys()
                .filter(|(owner, _)| *owner == pid)
                .copied()
                .collect();
            keys.into_iter()
                .map(|key| (key, inverted.remove(&key).unwrap()))
                .collect()
        };
        for ((_, vpn), page) in resident {
            page.table.lock().unwrap()[vpn].valid = false;
            self.frames.free(pid, page.ppn);
        }
        self.swap.release_all(pid);
        let swept = self.frames.free_all(pid);
        if swept > 0 {
            log::warn!("pid {pid}: {swept} frames were still owned at release");
        }
    }

    fn shutdown(&self) {
        self.swap.shutdown(self.machine.file_system());
    }
}

impl std::fmt::Debug for DemandPager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemandPager")
            .field("resident", &self.inverted.lock().unwrap().len())
            .field("pinned", &self.pins.pinned_count())
            .finish()
    }
}
