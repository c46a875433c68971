use std::sync::Arc;

use crate::config::{MachineConfig, PAGE_SIZE};
use crate::memory::PhysMemory;
use crate::translation::{PageTable, TranslationEntry};

/// Register file size: 32 general-purpose registers plus the special slots
/// below.
pub const NUM_REGS: usize = 38;

/// MIPS o32 register numbers the syscall ABI cares about, plus the special
/// registers kept at the end of the file.
pub mod reg {
    pub const ZERO: usize = 0;
    pub const V0: usize = 2;
    pub const V1: usize = 3;
    pub const A0: usize = 4;
    pub const A1: usize = 5;
    pub const A2: usize = 6;
    pub const A3: usize = 7;
    pub const SP: usize = 29;
    pub const RA: usize = 31;
    pub const LO: usize = 32;
    pub const HI: usize = 33;
    pub const PC: usize = 34;
    pub const NEXT_PC: usize = 35;
    pub const PREV_PC: usize = 36;
    pub const BAD_VADDR: usize = 37;
}

/// Why control transferred from user mode to the kernel. Any cause not in
/// this set is kernel-fatal by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// The program executed a syscall instruction; number in v0, arguments
    /// in a0..a3.
    Syscall,
    /// A store hit a read-only page.
    ReadOnly { vaddr: u32 },
    /// An access hit an unmapped or unmappable address.
    BusError { vaddr: u32 },
    /// A misaligned access.
    AddressError { vaddr: u32 },
    /// The program hit an undecodable instruction.
    IllegalInstruction,
    /// No valid translation for the page; raised instead of `BusError` when
    /// the kernel runs demand paged.
    TlbMiss { vaddr: u32 },
}

/// The register and translation context of one user thread.
///
/// The real machine multiplexes a single processor and lets the kernel
/// save and restore contexts around switches; here every user thread owns
/// its context and the host scheduler does the multiplexing, with the
/// save/restore hooks kept on the process. User-mode accesses translate
/// through the page table installed by `set_page_table`, maintain the
/// `used`/`dirty` bits, and report failures as `Trap` values — they never
/// touch memory outside the process's mapping.
pub struct Cpu {
    pub regs: [u32; NUM_REGS],
    memory: Arc<PhysMemory>,
    page_table: Option<PageTable>,
    tlb: Vec<TranslationEntry>,
    demand_paged: bool,
}

impl Cpu {
    pub fn new(memory: Arc<PhysMemory>, config: &MachineConfig) -> Self {
        Self {
            regs: [0; NUM_REGS],
            memory,
            page_table: None,
            tlb: vec![TranslationEntry::invalid(0); config.tlb_size],
            demand_paged: false,
        }
    }

    pub fn read_register(&self, number: usize) -> u32 {
        self.regs[number]
    }

    pub fn write_register(&mut self, number: usize, value: u32) {
        if number != reg::ZERO {
            self.regs[number] = value;
        }
    }

    /// Installs the page table user-mode accesses translate through.
    pub fn set_page_table(&mut self, table: PageTable) {
        self.page_table = Some(table);
    }

    pub fn page_table(&self) -> Option<&PageTable> {
        self.page_table.as_ref()
    }

    /// Unmapped pages raise `TlbMiss` instead of `BusError` once the kernel
    /// declares itself demand paged.
    pub fn set_demand_paged(&mut self, demand_paged: bool) {
        self.demand_paged = demand_paged;
    }

    pub fn tlb_size(&self) -> usize {
        self.tlb.len()
    }

    pub fn read_tlb_entry(&self, index: usize) -> TranslationEntry {
        self.tlb[index]
    }

    pub fn write_tlb_entry(&mut self, index: usize, entry: TranslationEntry) {
        self.tlb[index] = entry;
    }

    /// Drops every cached translation. Called on context restore.
    pub fn invalidate_tlb(&mut self) {
        for entry in &mut self.tlb {
            entry.valid = false;
        }
    }

    /// Moves past the current instruction after a handled syscall.
    pub fn advance_pc(&mut self) {
        self.regs[reg::PREV_PC] = self.regs[reg::PC];
        self.regs[reg::PC] = self.regs[reg::NEXT_PC];
        self.regs[reg::NEXT_PC] = self.regs[reg::NEXT_PC].wrapping_add(4);
    }

    fn unmapped(&mut self, vaddr: u32) -> Trap {
        self.regs[reg::BAD_VADDR] = vaddr;
        if self.demand_paged {
            Trap::TlbMiss { vaddr }
        } else {
            Trap::BusError { vaddr }
        }
    }

    /// Translates a user virtual address for an access of `size` bytes,
    /// updating the status bits and refilling the TLB on the way through.
    fn translate(&mut self, vaddr: u32, size: usize, write: bool) -> Result<usize, Trap> {
        if vaddr as usize % size != 0 {
            self.regs[reg::BAD_VADDR] = vaddr;
            return Err(Trap::AddressError { vaddr });
        }

        let vpn = vaddr as usize / PAGE_SIZE;
        let offset = vaddr as usize % PAGE_SIZE;

        let table = match &self.page_table {
            Some(table) => Arc::clone(table),
            None => return Err(self.unmapped(vaddr)),
        };
        let mut entries = table.lock().unwrap();
        if vpn >= entries.len() {
            drop(entries);
            return Err(self.unmapped(vaddr));
        }
        let entry = &mut entries[vpn];
        if !entry.valid {
            drop(entries);
            return Err(self.unmapped(vaddr));
        }
        if write && entry.read_only {
            drop(entries);
            self.regs[reg::BAD_VADDR] = vaddr;
            return Err(Trap::ReadOnly { vaddr });
        }
        entry.used = true;
        if write {
            entry.dirty = true;
        }
        let snapshot = *entry;
        drop(entries);

        if snapshot.ppn >= self.memory.num_pages() {
            self.regs[reg::BAD_VADDR] = vaddr;
            return Err(Trap::BusError { vaddr });
        }
        if !self.tlb.is_empty() {
            let slot = vpn % self.tlb.len();
            self.tlb[slot] = snapshot;
        }
        Ok(snapshot.ppn * PAGE_SIZE + offset)
    }

    pub fn load_u8(&mut self, vaddr: u32) -> Result<u8, Trap> {
        let paddr = self.translate(vaddr, 1, false)?;
        Ok(self.memory.read_u8(paddr))
    }

    pub fn load_u32(&mut self, vaddr: u32) -> Result<u32, Trap> {
        let paddr = self.translate(vaddr, 4, false)?;
        Ok(self.memory.read_u32(paddr))
    }

    pub fn store_u8(&mut self, vaddr: u32, value: u8) -> Result<(), Trap> {
        let paddr = self.translate(vaddr, 1, true)?;
        self.memory.write_u8(paddr, value);
        Ok(())
    }

    pub fn store_u32(&mut self, vaddr: u32, value: u32) -> Result<(), Trap> {
        let paddr = self.translate(vaddr, 4, true)?;
        self.memory.write_u32(paddr, value);
        Ok(())
    }

    /// Byte-wise translated read, stopping at the first fault.
    pub fn load_bytes(&mut self, vaddr: u32, buf: &mut [u8]) -> Result<(), Trap> {
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = self.load_u8(vaddr + i as u32)?;
        }
        Ok(())
    }

    /// Byte-wise translated write, stopping at the first fault.
    pub fn store_bytes(&mut self, vaddr: u32, buf: &[u8]) -> Result<(), Trap> {
        for (i, byte) in buf.iter().enumerate() {
            self.store_u8(vaddr + i as u32, *byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::new_page_table;

    fn cpu_with_pages(valid: &[(usize, bool)]) -> Cpu {
        let memory = Arc::new(PhysMemory::new(valid.len().max(1)));
        let table = new_page_table(
            valid
                .iter()
                .enumerate()
                .map(|(vpn, &(ppn, read_only))| TranslationEntry::new(vpn, ppn, true, read_only))
                .collect(),
        );
        let mut cpu = Cpu::new(memory, &MachineConfig::with_phys_pages(valid.len().max(1)));
        cpu.set_page_table(table);
        cpu
    }

    #[test]
    fn translated_store_and_load() {
        let mut cpu = cpu_with_pages(&[(1, false), (0, false)]);
        cpu.store_u32(4, 0xdead_beef).unwrap();
        assert_eq!(cpu.load_u32(4).unwrap(), 0xdead_beef);
        // vpn 0 maps to frame 1, so the bytes landed in the second frame.
        let table = cpu.page_table().unwrap().lock().unwrap();
        assert!(table[0].used && table[0].dirty);
        assert!(!table[1].dirty);
    }

    #[test]
    fn read_only_store_traps() {
        let mut cpu = cpu_with_pages(&[(0, true)]);
        assert_eq!(
            cpu.store_u8(8, 1),
            Err(Trap::ReadOnly { vaddr: 8 })
        );
        assert_eq!(cpu.read_register(reg::BAD_VADDR), 8);
    }

    #[test]
    fn unmapped_access_is_bus_error_until_demand_paged() {
        let mut cpu = cpu_with_pages(&[(0, false)]);
        let far = (2 * PAGE_SIZE) as u32;
        assert_eq!(cpu.load_u8(far), Err(Trap::BusError { vaddr: far }));
        cpu.set_demand_paged(true);
        assert_eq!(cpu.load_u8(far), Err(Trap::TlbMiss { vaddr: far }));
    }

    #[test]
    fn misaligned_word_is_address_error() {
        let mut cpu = cpu_with_pages(&[(0, false)]);
        assert_eq!(cpu.load_u32(2), Err(Trap::AddressError { vaddr: 2 }));
    }
}
