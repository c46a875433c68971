//! Shared fixtures for the kernel test suites: a capturing console, boot
//! helpers, and synthesized executables.

#![allow(dead_code)]

use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use machine::elf::ElfBuilder;
use machine::{Console, Machine, MachineConfig, MemFileSystem, PAGE_SIZE};
use once_cell::sync::Lazy;

/// The smallest image that loads, parsed once for the whole suite.
static ONE_PAGE_EXE: Lazy<Vec<u8>> = Lazy::new(|| {
    let code: Vec<u8> = (0u32..PAGE_SIZE as u32 / 4)
        .flat_map(|i| (0x2400_0000 | (i & 0xFFFF)).to_le_bytes())
        .collect();
    ElfBuilder::new().entry(0).code(0, &code).build()
});

/// Console output sink the test can read after the machine halts.
#[derive(Clone, Default)]
pub struct SharedSink(pub Arc<Mutex<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedSink {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

/// A machine over the given file system, with the console fed from `input`
/// and captured into the returned sink.
pub fn boot_machine(
    config: MachineConfig,
    fs: MemFileSystem,
    input: &[u8],
) -> (Arc<Machine>, SharedSink) {
    let sink = SharedSink::default();
    let console = Console::new(Cursor::new(input.to_vec()), sink.clone());
    let machine = Machine::new(config, Box::new(fs), console);
    (machine, sink)
}

pub fn wait_halt(machine: &Machine) {
    assert!(
        machine.wait_for_halt_timeout(Duration::from_secs(10)),
        "machine did not halt"
    );
}

/// One read-only code page, entry at 0.
pub fn one_page_exe() -> Vec<u8> {
    ONE_PAGE_EXE.clone()
}

/// A code page followed by `bss_pages` of writable zero-fill.
pub fn exe_with_bss(bss_pages: usize) -> Vec<u8> {
    let code: Vec<u8> = (0u32..PAGE_SIZE as u32 / 4)
        .flat_map(|i| (0x2400_0000 | (i & 0xFFFF)).to_le_bytes())
        .collect();
    ElfBuilder::new()
        .entry(0)
        .code(0, &code)
        .bss(PAGE_SIZE as u32, (bss_pages * PAGE_SIZE) as u32)
        .build()
}

/// An image whose sections do not tile from vpn 0.
pub fn fragmented_exe() -> Vec<u8> {
    ElfBuilder::new()
        .entry(0)
        .code(0, b"\x00\x00\x00\x00")
        // A hole: the data section starts two pages up.
        .data(3 * PAGE_SIZE as u32, b"hole")
        .build()
}

/// Loads the registers for a syscall and hands control to the kernel.
pub fn sys(cpu: &mut machine::Cpu, number: u32, a0: u32, a1: u32, a2: u32) -> machine::Trap {
    cpu.write_register(machine::reg::V0, number);
    cpu.write_register(machine::reg::A0, a0);
    cpu.write_register(machine::reg::A1, a1);
    cpu.write_register(machine::reg::A2, a2);
    machine::Trap::Syscall
}

/// A shared cell guests use to report observations back to the test.
pub type Report<T> = Arc<Mutex<Option<T>>>;

pub fn report<T>() -> Report<T> {
    Arc::new(Mutex::new(None))
}

pub fn take<T: Clone>(cell: &Report<T>) -> T {
    cell.lock().unwrap().clone().expect("guest never reported")
}
