use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use machine::elf::{Elf, ProgramType};
use machine::{reg, Cpu, Machine, PageTable, PhysMemory, NUM_REGS, PAGE_SIZE};

use crate::error::LoadError;
use crate::fd_table::FdTable;
use crate::paging::Pager;
use crate::sync::Semaphore;
use crate::Pid;

/// Pages of stack every process gets above its image.
pub const STACK_PAGES: usize = 8;

/// Longest string argument a syscall will read from user memory, not
/// counting the terminator.
pub const MAX_ARG_STR: usize = 256;

/// The page-granular shadow of one loadable ELF section, kept so the demand
/// pager can find and reload image pages without walking the ELF itself.
#[derive(Debug, Clone)]
pub struct SectionSpan {
    /// Section index inside the ELF.
    pub index: usize,
    pub first_vpn: usize,
    pub num_pages: usize,
    pub read_only: bool,
}

/// A process's address translation state: the page table, the layout that
/// produced it, and the executable it came from (held open so pages can be
/// reloaded on demand).
#[derive(Debug, Clone)]
pub struct Space {
    pub page_table: PageTable,
    pub num_pages: usize,
    pub sections: Vec<SectionSpan>,
    pub elf: Arc<Mutex<Elf>>,
    pub init_pc: u32,
    pub init_sp: u32,
    pub argc: u32,
    /// Virtual address of the argv pointer array.
    pub argv: u32,
}

impl Space {
    /// The loadable section covering `vpn`, with the page's index inside it.
    pub fn section_for(&self, vpn: usize) -> Option<(&SectionSpan, usize)> {
        self.sections
            .iter()
            .find(|span| vpn >= span.first_vpn && vpn < span.first_vpn + span.num_pages)
            .map(|span| (span, vpn - span.first_vpn))
    }
}

/// How a child ended, held for the parent until it joins.
#[derive(Debug, Clone, Copy)]
pub struct ChildExit {
    pub status: i32,
    pub clean: bool,
}

/// Mutable process state guarded by the per-process lock: the descriptor
/// table, the address-space pointer, and the parent/child bookkeeping.
#[derive(Debug)]
pub struct ProcState {
    pub fd_table: FdTable,
    pub space: Option<Space>,
    pub children: HashSet<Pid>,
    /// Exit statuses of children that finished before being reaped.
    pub exited_children: HashMap<Pid, ChildExit>,
    /// The child this process is currently blocked joining on.
    pub joined_to: Option<Pid>,
    pub exit_code: i32,
    pub abnormal: bool,
    pub exited: bool,
}

/// Everything about a user process that does not live in its user thread:
/// translation state, the file table, and lifecycle bookkeeping.
pub struct Process {
    pid: Pid,
    parent: Option<Pid>,
    pager: Arc<dyn Pager>,
    memory: Arc<PhysMemory>,
    state: Mutex<ProcState>,
    join_sem: Semaphore,
}

impl Process {
    pub fn new(
        pid: Pid,
        parent: Option<Pid>,
        pager: Arc<dyn Pager>,
        memory: Arc<PhysMemory>,
    ) -> Self {
        Self {
            pid,
            parent,
            pager,
            memory,
            state: Mutex::new(ProcState {
                fd_table: FdTable::new(),
                space: None,
                children: HashSet::new(),
                exited_children: HashMap::new(),
                joined_to: None,
                exit_code: 0,
                abnormal: false,
                exited: false,
            }),
            join_sem: Semaphore::new(0),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ProcState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn join_sem(&self) -> &Semaphore {
        &self.join_sem
    }

    /// A handle on the current address space, if one is loaded.
    pub fn space(&self) -> Option<Space> {
        self.state().space.clone()
    }

    /// Loads the named executable and prepares its arguments, building the
    /// page table and (eagerly or lazily, per the pager) the memory image.
    pub fn load(&self, machine: &Machine, name: &str, argv: &[String]) -> Result<(), LoadError> {
        log::debug!("pid {}: loading {name:?} with {} args", self.pid, argv.len());

        let file = machine
            .file_system()
            .open(name, false)
            .ok_or(LoadError::NoSuchFile)?;
        let elf = Elf::new(file)?;

        // Loadable sections must tile the address space from vpn 0.
        let mut num_pages = 0usize;
        let mut sections = Vec::new();
        for (index, section) in elf.sections().iter().enumerate() {
            if !section.loadable() {
                continue;
            }
            if section.first_vpn != num_pages {
                log::debug!("pid {}: section {:?} breaks contiguity", self.pid, section.name);
                return Err(LoadError::Fragmented);
            }
            sections.push(SectionSpan {
                index,
                first_vpn: section.first_vpn,
                num_pages: section.num_pages,
                read_only: section.read_only(),
            });
            num_pages += section.num_pages;
        }

        // The argv pointer array and strings must fit in the final page.
        let args_size: usize = argv.iter().map(|arg| 4 + arg.len() + 1).sum();
        if args_size > PAGE_SIZE {
            return Err(LoadError::ArgsTooLong);
        }

        if let Some(load) = elf.program_entry_for_type(ProgramType::Load) {
            let image_bytes = num_pages * PAGE_SIZE;
            if load.memsz as usize > image_bytes {
                log::warn!(
                    "pid {}: LOAD segment wants {} bytes but sections cover only {image_bytes}",
                    self.pid,
                    load.memsz
                );
            }
        }

        let init_pc = elf.entry_point();
        num_pages += STACK_PAGES;
        let init_sp = (num_pages * PAGE_SIZE) as u32;
        num_pages += 1; // argument page

        let page_table = self.pager.build_table(self.pid, num_pages)?;
        let argv_vaddr = ((num_pages - 1) * PAGE_SIZE) as u32;
        let space = Space {
            page_table,
            num_pages,
            sections,
            elf: Arc::new(Mutex::new(elf)),
            init_pc,
            init_sp,
            argc: argv.len() as u32,
            argv: argv_vaddr,
        };
        // Publish the space before touching memory so the transfer
        // primitives (and a failure cleanup) can see it.
        self.state().space = Some(space.clone());
        self.pager.map_image(self.pid, &space)?;

        // Argument page: argc little-endian pointers, then the packed
        // NUL-terminated strings they point at.
        let mut entry_offset = argv_vaddr;
        let mut string_offset = argv_vaddr + 4 * argv.len() as u32;
        for arg in argv {
            let wrote = self.write_vm(entry_offset, &string_offset.to_le_bytes());
            assert_eq!(wrote, 4, "argv pointer write fell short");
            entry_offset += 4;
            let wrote = self.write_vm(string_offset, arg.as_bytes());
            assert_eq!(wrote, arg.len(), "argv string write fell short");
            string_offset += arg.len() as u32;
            let wrote = self.write_vm(string_offset, &[0]);
            assert_eq!(wrote, 1, "argv terminator write fell short");
            string_offset += 1;
        }

        log::debug!(
            "pid {}: loaded {name:?}: {num_pages} pages, entry {init_pc:#x}",
            self.pid
        );
        Ok(())
    }

    /// Walks pages from `vaddr`, copying between process memory and the
    /// buffer until the range ends or translation stops. Returns the bytes
    /// actually moved; never fails outright.
    fn transfer(
        &self,
        vaddr: u32,
        len: usize,
        write: bool,
        mut copy: impl FnMut(&PhysMemory, usize, usize, usize),
    ) -> usize {
        if len == 0 {
            return 0;
        }
        let space = match self.space() {
            Some(space) => space,
            None => return 0,
        };
        // Under demand paging this faults the range in and pins it until
        // the guard drops; the eager pager has nothing to do.
        let _pins = self.pager.prepare(self.pid, &space, vaddr, len, write);

        let mut vaddr = vaddr as usize;
        let mut done = 0;
        while done < len {
            let vpn = vaddr / PAGE_SIZE;
            let mut entries = space.page_table.lock().unwrap();
            if vpn >= entries.len() {
                break;
            }
            let entry = &mut entries[vpn];
            if !entry.valid || (write && entry.read_only) {
                break;
            }
            entry.used = true;
            if write {
                entry.dirty = true;
            }
            let ppn = entry.ppn;
            drop(entries);

            let page_offset = vaddr % PAGE_SIZE;
            let n = (len - done).min(PAGE_SIZE - page_offset);
            copy(&self.memory, ppn * PAGE_SIZE + page_offset, done, n);
            vaddr += n;
            done += n;
        }
        done
    }

    /// Copies bytes out of process virtual memory into `data`, returning the
    /// length of the prefix actually read.
    pub fn read_vm(&self, vaddr: u32, data: &mut [u8]) -> usize {
        let len = data.len();
        self.transfer(vaddr, len, false, |memory, paddr, off, n| {
            memory.read(paddr, &mut data[off..off + n]);
        })
    }

    /// Copies `data` into process virtual memory, returning the length of
    /// the prefix actually written. A read-only page stops the transfer.
    pub fn write_vm(&self, vaddr: u32, data: &[u8]) -> usize {
        self.transfer(vaddr, data.len(), true, |memory, paddr, off, n| {
            memory.write(paddr, &data[off..off + n]);
        })
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes, or nothing
    /// if no terminator shows up in the window.
    pub fn read_vm_string(&self, vaddr: u32, max_len: usize) -> Option<String> {
        let mut bytes = vec![0u8; max_len + 1];
        let got = self.read_vm(vaddr, &mut bytes);
        let nul = bytes[..got].iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&bytes[..nul]).into_owned())
    }

    /// Sets up the register file for first entry into user mode: everything
    /// zero except PC, SP, and the two argument registers.
    pub fn init_registers(&self, cpu: &mut Cpu) {
        let space = self.space().expect("initializing registers with no image loaded");
        for number in 0..NUM_REGS {
            cpu.regs[number] = 0;
        }
        cpu.regs[reg::PC] = space.init_pc;
        cpu.regs[reg::NEXT_PC] = space.init_pc.wrapping_add(4);
        cpu.regs[reg::SP] = space.init_sp;
        cpu.regs[reg::A0] = space.argc;
        cpu.regs[reg::A1] = space.argv;
    }

    /// Context-switch-out hook. Register state lives in the thread's own
    /// CPU context, so there is nothing to save.
    pub fn save_state(&self, _cpu: &mut Cpu) {}

    /// Context-switch-in hook: installs the page table, flushes the TLB,
    /// and lets the pager resynchronize the table with its own records.
    pub fn restore_state(&self, cpu: &mut Cpu) {
        if let Some(space) = self.space() {
            cpu.set_page_table(Arc::clone(&space.page_table));
            cpu.invalidate_tlb();
            self.pager.restore_state(self.pid, &space);
        }
    }

    /// Gives every frame (and any swap space) back. Idempotent.
    pub fn unload(&self) {
        let space = self.state().space.take();
        if let Some(space) = space {
            self.pager.release(self.pid, &space);
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("parent", &self.parent)
            .finish()
    }
}
