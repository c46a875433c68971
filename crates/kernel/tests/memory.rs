//! Address-space construction and the virtual-memory transfer primitives,
//! driven directly (no user threads) on the eager kernel's pager.

mod common;

use std::sync::Arc;

use common::*;
use kernel::{EagerPager, FrameAllocator, LoadError, Pager, Process};
use machine::{Machine, MachineConfig, MemFileSystem, PAGE_SIZE};

struct Rig {
    machine: Arc<Machine>,
    frames: Arc<FrameAllocator>,
}

impl Rig {
    fn new(phys_pages: usize, files: &[(&str, Vec<u8>)]) -> Self {
        let fs = MemFileSystem::new();
        for (name, image) in files {
            fs.add_file(name, image.clone());
        }
        let (machine, _out) = boot_machine(MachineConfig::with_phys_pages(phys_pages), fs, b"");
        let frames = Arc::new(FrameAllocator::new(phys_pages));
        Self { machine, frames }
    }

    fn process(&self, pid: u32) -> Arc<Process> {
        let pager: Arc<dyn Pager> = Arc::new(EagerPager::new(
            Arc::clone(&self.machine),
            Arc::clone(&self.frames),
        ));
        Arc::new(Process::new(
            pid,
            None,
            pager,
            Arc::clone(self.machine.memory()),
        ))
    }

    fn loaded(&self, pid: u32, name: &str, args: &[&str]) -> Arc<Process> {
        let process = self.process(pid);
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        process.load(&self.machine, name, &args).unwrap();
        process
    }
}

#[test]
fn write_then_read_round_trips_across_pages() {
    let rig = Rig::new(32, &[("prog", one_page_exe())]);
    let process = rig.loaded(1, "prog", &[]);

    let pattern: Vec<u8> = (0..3000).map(|i| (i * 7 % 251) as u8).collect();
    let vaddr = PAGE_SIZE as u32 + 100; // first stack page, crossing two boundaries
    assert_eq!(process.write_vm(vaddr, &pattern), pattern.len());

    let mut back = vec![0u8; pattern.len()];
    assert_eq!(process.read_vm(vaddr, &mut back), pattern.len());
    assert_eq!(back, pattern);
}

#[test]
fn transfers_stop_at_the_end_of_the_address_space() {
    let rig = Rig::new(32, &[("prog", one_page_exe())]);
    let process = rig.loaded(1, "prog", &[]);
    let num_pages = process.space().unwrap().num_pages;

    let vaddr = (num_pages * PAGE_SIZE - 100) as u32;
    let data = vec![0xAB; 2000];
    assert_eq!(process.write_vm(vaddr, &data), 100);

    let mut back = vec![0u8; 2000];
    assert_eq!(process.read_vm(vaddr, &mut back), 100);
    assert_eq!(&back[..100], &data[..100]);

    // Entirely out of range.
    assert_eq!(process.read_vm((num_pages * PAGE_SIZE) as u32, &mut back), 0);
}

#[test]
fn kernel_writes_stop_at_read_only_pages() {
    let rig = Rig::new(32, &[("prog", one_page_exe())]);
    let process = rig.loaded(1, "prog", &[]);

    // Page 0 is the text section.
    assert_eq!(process.write_vm(0, b"overwrite"), 0);
    // Reading it is fine.
    let mut first = [0u8; 4];
    assert_eq!(process.read_vm(0, &mut first), 4);
}

#[test]
fn vm_strings_need_a_terminator_in_the_window() {
    let rig = Rig::new(32, &[("prog", one_page_exe())]);
    let process = rig.loaded(1, "prog", &[]);
    let vaddr = PAGE_SIZE as u32 + 10;

    process.write_vm(vaddr, b"hi\0junk");
    assert_eq!(process.read_vm_string(vaddr, 16).as_deref(), Some("hi"));
    assert_eq!(process.read_vm_string(vaddr, 2).as_deref(), Some("hi"));

    process.write_vm(vaddr, &[b'x'; 32]);
    assert_eq!(process.read_vm_string(vaddr, 8), None);
}

#[test]
fn argv_page_holds_pointers_then_packed_strings() {
    let rig = Rig::new(32, &[("prog", one_page_exe())]);
    let process = rig.loaded(1, "prog", &["one", "two"]);
    let space = process.space().unwrap();

    assert_eq!(space.argc, 2);
    assert_eq!(space.argv as usize, (space.num_pages - 1) * PAGE_SIZE);
    assert_eq!(space.init_sp as usize, (space.num_pages - 1) * PAGE_SIZE);

    let mut pointers = [0u8; 8];
    assert_eq!(process.read_vm(space.argv, &mut pointers), 8);
    let p0 = u32::from_le_bytes(pointers[0..4].try_into().unwrap());
    let p1 = u32::from_le_bytes(pointers[4..8].try_into().unwrap());
    assert_eq!(p0, space.argv + 8);
    assert_eq!(p1, p0 + 4); // "one" plus its terminator

    assert_eq!(process.read_vm_string(p0, 16).as_deref(), Some("one"));
    assert_eq!(process.read_vm_string(p1, 16).as_deref(), Some("two"));
}

#[test]
fn frames_are_conserved_across_load_and_unload() {
    let rig = Rig::new(32, &[("prog", one_page_exe())]);
    let total = rig.frames.num_frames();
    let process = rig.loaded(1, "prog", &[]);

    let num_pages = process.space().unwrap().num_pages;
    assert_eq!(rig.frames.free_count(), total - num_pages);
    assert_eq!(rig.frames.owned_frames(1).len(), num_pages);

    process.unload();
    assert_eq!(rig.frames.free_count(), total);
    assert!(rig.frames.owned_frames(1).is_empty());

    // Unload twice is harmless.
    process.unload();
    assert_eq!(rig.frames.free_count(), total);
}

#[test]
fn live_processes_never_share_frames() {
    let rig = Rig::new(32, &[("prog", one_page_exe())]);
    let a = rig.loaded(1, "prog", &[]);
    let b = rig.loaded(2, "prog", &[]);

    let owned_a = rig.frames.owned_frames(1);
    let owned_b = rig.frames.owned_frames(2);
    assert!(owned_a.iter().all(|ppn| !owned_b.contains(ppn)));

    // Every valid table entry points into the owner's frames.
    for (process, owned) in [(&a, &owned_a), (&b, &owned_b)] {
        let space = process.space().unwrap();
        let table = space.page_table.lock().unwrap();
        for entry in table.iter() {
            assert!(entry.valid);
            assert!(owned.contains(&entry.ppn));
        }
    }
}

#[test]
fn failed_loads_leave_no_frames_behind() {
    let rig = Rig::new(8, &[("prog", one_page_exe())]);
    let process = rig.process(1);
    // 1 image page + 8 stack + 1 argv > 8 frames.
    assert_eq!(
        process.load(&rig.machine, "prog", &[]),
        Err(LoadError::OutOfMemory)
    );
    process.unload();
    assert_eq!(rig.frames.free_count(), 8);
}
