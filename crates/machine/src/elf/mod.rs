//! Reader for statically linked little-endian ELF32 executables.
//!
//! The loader expects the linker to have placed every ALLOC section on a
//! page boundary and packed them at the front of the address space; it does
//! not relocate or realign anything.

mod builder;
mod program;
mod section;

pub use builder::ElfBuilder;
pub use program::{ElfProgram, ProgramType};
pub use section::{ElfSection, SectionFlags, SectionType};

use std::fmt;
use std::io;

use crate::config::PAGE_SIZE;
use crate::fs::OpenFile;
use crate::memory::PhysMemory;

/// Size of the ELF32 file header.
const HEADER_SIZE: usize = 52;
/// `e_type` value for an executable file.
const ET_EXEC: u16 = 2;
/// Longest section name the reader will resolve.
const MAX_SECTION_NAME: usize = 256;

/// Why a binary was rejected.
#[derive(Debug)]
pub enum ElfError {
    /// The file is not a little-endian 32-bit executable this loader
    /// understands. The message names the offending field.
    BadFormat(&'static str),
    Io(io::Error),
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadFormat(what) => write!(f, "malformed ELF binary: {what}"),
            Self::Io(err) => write!(f, "ELF read failed: {err}"),
        }
    }
}

impl std::error::Error for ElfError {}

impl From<io::Error> for ElfError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// A parsed ELF32 executable, held open so pages can be (re)loaded from it
/// on demand.
pub struct Elf {
    file: Box<dyn OpenFile>,
    entry: u32,
    machine: u16,
    version: u32,
    flags: u32,
    sections: Vec<ElfSection>,
    programs: Vec<ElfProgram>,
}

impl fmt::Debug for Elf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Elf")
            .field("file", &self.file.name())
            .field("entry", &format_args!("{:#010x}", self.entry))
            .field("sections", &self.sections.len())
            .field("programs", &self.programs.len())
            .finish()
    }
}

/// Little-endian half-word at `off`, zero-extended. All multi-byte header
/// fields are unsigned.
fn half(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

/// Little-endian word at `off`, zero-extended.
fn word(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

impl Elf {
    /// Reads and validates the file header, then loads every section header
    /// (resolving names from the string table) and every program header.
    pub fn new(mut file: Box<dyn OpenFile>) -> Result<Self, ElfError> {
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact_at(0, &mut header)
            .map_err(|_| ElfError::BadFormat("truncated header"))?;

        if header[0..4] != [0x7F, b'E', b'L', b'F'] {
            return Err(ElfError::BadFormat("bad magic"));
        }
        if header[4] != 1 {
            return Err(ElfError::BadFormat("not a 32-bit class binary"));
        }
        if header[5] != 1 {
            return Err(ElfError::BadFormat("not little-endian"));
        }

        let e_type = half(&header, 16);
        if e_type != ET_EXEC {
            return Err(ElfError::BadFormat("not an executable"));
        }

        let machine = half(&header, 18);
        let version = word(&header, 20);
        let entry = word(&header, 24);
        let phoff = word(&header, 28);
        let shoff = word(&header, 32);
        let flags = word(&header, 36);
        let ehsize = half(&header, 40);
        let phentsize = half(&header, 42) as usize;
        let phnum = half(&header, 44) as usize;
        let shentsize = half(&header, 46) as usize;
        let shnum = half(&header, 48) as usize;
        let shstrndx = half(&header, 50) as usize;

        if (ehsize as usize) < HEADER_SIZE {
            return Err(ElfError::BadFormat("header too small"));
        }
        if shnum > 0 && shentsize < 40 {
            return Err(ElfError::BadFormat("section header entry too small"));
        }
        if phnum > 0 && phentsize < 32 {
            return Err(ElfError::BadFormat("program header entry too small"));
        }
        if shstrndx >= shnum.max(1) {
            return Err(ElfError::BadFormat("string table index out of range"));
        }

        // Section index 0 is the null section; pretend it does not exist.
        let mut sections = Vec::with_capacity(shnum.saturating_sub(1));
        let mut entry_buf = vec![0u8; shentsize];
        for i in 1..shnum {
            let off = shoff as u64 + (i * shentsize) as u64;
            file.read_exact_at(off, &mut entry_buf)
                .map_err(|_| ElfError::BadFormat("truncated section header table"))?;
            let section = ElfSection::parse(&entry_buf)
                .ok_or(ElfError::BadFormat("unknown section type"))?;
            sections.push(section);
        }

        let mut programs = Vec::with_capacity(phnum);
        let mut entry_buf = vec![0u8; phentsize];
        for i in 0..phnum {
            let off = phoff as u64 + (i * phentsize) as u64;
            file.read_exact_at(off, &mut entry_buf)
                .map_err(|_| ElfError::BadFormat("truncated program header table"))?;
            programs.push(ElfProgram::parse(&entry_buf));
        }

        let mut elf = Self {
            file,
            entry,
            machine,
            version,
            flags,
            sections,
            programs,
        };

        // Now that every header is in, sections can name themselves.
        if shstrndx != 0 {
            elf.resolve_names(shstrndx - 1)?;
        }

        log::trace!(
            "parsed ELF {:?}: entry={:#x} machine={} version={} flags={:#x}",
            elf.file.name(),
            elf.entry,
            elf.machine,
            elf.version,
            elf.flags,
        );

        Ok(elf)
    }

    fn resolve_names(&mut self, strtab: usize) -> Result<(), ElfError> {
        let table = self
            .sections
            .get(strtab)
            .ok_or(ElfError::BadFormat("string table index out of range"))?;
        if table.section_type != SectionType::Strtab {
            return Err(ElfError::BadFormat("string table has wrong type"));
        }
        let (table_off, table_size) = (table.offset as u64, table.size as usize);

        for i in 0..self.sections.len() {
            let name_off = self.sections[i].name_offset as usize;
            if name_off >= table_size {
                return Err(ElfError::BadFormat("section name outside string table"));
            }
            let window = (table_size - name_off).min(MAX_SECTION_NAME);
            let mut buf = vec![0u8; window];
            self.file
                .read_exact_at(table_off + name_off as u64, &mut buf)
                .map_err(|_| ElfError::BadFormat("truncated string table"))?;
            let nul = buf
                .iter()
                .position(|&b| b == 0)
                .ok_or(ElfError::BadFormat("unterminated section name"))?;
            self.sections[i].name = String::from_utf8_lossy(&buf[..nul]).into_owned();
        }
        Ok(())
    }

    /// Entry-point virtual address.
    pub fn entry_point(&self) -> u32 {
        self.entry
    }

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }

    pub fn section(&self, index: usize) -> &ElfSection {
        &self.sections[index]
    }

    pub fn sections(&self) -> &[ElfSection] {
        &self.sections
    }

    /// The first program header of the given type, used to sanity-check the
    /// allocated image against the LOAD segment's memory size.
    pub fn program_entry_for_type(&self, program_type: ProgramType) -> Option<&ElfProgram> {
        self.programs
            .iter()
            .find(|p| p.program_type == program_type)
    }

    /// Copies page `spn` of section `section` into physical frame `ppn`.
    ///
    /// NOBITS sections occupy no file space, so the whole frame zero-fills.
    /// Otherwise the bytes still remaining in the section are read (a full
    /// page on every page including the last when the section size is an
    /// exact multiple of the page size) and the rest of the frame zero-fills.
    pub fn load_page(
        &mut self,
        section: usize,
        spn: usize,
        ppn: usize,
        memory: &PhysMemory,
    ) -> Result<(), ElfError> {
        let s = &self.sections[section];
        assert!(spn < s.num_pages, "section page {spn} out of range");
        assert!(ppn < memory.num_pages(), "frame {ppn} out of range");

        let paddr = ppn * PAGE_SIZE;
        let init_len = if s.section_type == SectionType::Nobits {
            0
        } else {
            let remaining = s.size as usize - spn * PAGE_SIZE;
            remaining.min(PAGE_SIZE)
        };

        if init_len > 0 {
            let faddr = s.offset as u64 + (spn * PAGE_SIZE) as u64;
            let mut buf = vec![0u8; init_len];
            self.file.read_exact_at(faddr, &mut buf)?;
            memory.write(paddr, &buf);
        }
        memory.zero(paddr + init_len, PAGE_SIZE - init_len);
        Ok(())
    }
}
