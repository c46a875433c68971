//! Programmatic construction of minimal statically linked ELF32 images.
//!
//! The simulator has no cross-compiler toolchain of its own, so the test
//! suites synthesize their "binaries" with this builder: page-aligned
//! sections, one LOAD segment, little-endian throughout. Images round-trip
//! through the reader in this module's parent and through independent ELF
//! parsers.

use super::section::{SectionFlags, SectionType};
use crate::config::PAGE_SIZE;

/// ELF machine tag for MIPS.
const EM_MIPS: u16 = 8;
const HEADER_SIZE: u32 = 52;
const PHENTSIZE: u32 = 32;
const SHENTSIZE: u32 = 40;

struct BuildSection {
    name: String,
    section_type: SectionType,
    flags: SectionFlags,
    addr: u32,
    size: u32,
    data: Vec<u8>,
}

/// Builder for a little-endian ELF32 executable image.
#[derive(Default)]
pub struct ElfBuilder {
    entry: u32,
    sections: Vec<BuildSection>,
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, entry: u32) -> Self {
        self.entry = entry;
        self
    }

    /// Adds a PROGBITS section with explicit flags.
    pub fn progbits(mut self, name: &str, addr: u32, flags: SectionFlags, data: &[u8]) -> Self {
        self.sections.push(BuildSection {
            name: name.to_string(),
            section_type: SectionType::Progbits,
            flags,
            addr,
            size: data.len() as u32,
            data: data.to_vec(),
        });
        self
    }

    /// Adds a NOBITS section occupying `size` bytes of memory and none of
    /// the file.
    pub fn nobits(mut self, name: &str, addr: u32, size: u32, flags: SectionFlags) -> Self {
        self.sections.push(BuildSection {
            name: name.to_string(),
            section_type: SectionType::Nobits,
            flags,
            addr,
            size,
            data: Vec::new(),
        });
        self
    }

    /// Read-only executable code section.
    pub fn code(self, addr: u32, data: &[u8]) -> Self {
        self.progbits(
            ".text",
            addr,
            SectionFlags::ALLOC | SectionFlags::EXECINSTR,
            data,
        )
    }

    /// Read-only data section.
    pub fn rodata(self, addr: u32, data: &[u8]) -> Self {
        self.progbits(".rodata", addr, SectionFlags::ALLOC, data)
    }

    /// Writable initialized data section.
    pub fn data(self, addr: u32, data: &[u8]) -> Self {
        self.progbits(".data", addr, SectionFlags::ALLOC | SectionFlags::WRITE, data)
    }

    /// Writable zero-initialized section.
    pub fn bss(self, addr: u32, size: u32) -> Self {
        self.nobits(".bss", addr, size, SectionFlags::ALLOC | SectionFlags::WRITE)
    }

    /// Lays out the image and returns its bytes.
    pub fn build(self) -> Vec<u8> {
        let has_load = self.sections.iter().any(|s| s.flags.contains(SectionFlags::ALLOC));
        let phnum: u32 = if has_load { 1 } else { 0 };

        // File layout: header, program headers, section data, string table,
        // section header table.
        let mut cursor = HEADER_SIZE + phnum * PHENTSIZE;

        let mut offsets = Vec::with_capacity(self.sections.len());
        for s in &self.sections {
            if s.section_type == SectionType::Nobits || s.data.is_empty() {
                offsets.push(0);
            } else {
                offsets.push(cursor);
                cursor += s.data.len() as u32;
            }
        }

        // Section-name string table, entry 0 reserved for the empty name.
        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::with_capacity(self.sections.len());
        for s in &self.sections {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(s.name.as_bytes());
            strtab.push(0);
        }
        let shstrtab_name = strtab.len() as u32;
        strtab.extend_from_slice(b".shstrtab");
        strtab.push(0);

        let strtab_offset = cursor;
        cursor += strtab.len() as u32;
        // Keep the header table word aligned.
        cursor = (cursor + 3) & !3;
        let shoff = cursor;

        let shnum = self.sections.len() as u32 + 2; // null + sections + shstrtab
        let shstrndx = shnum - 1;

        let mut image = Vec::with_capacity(shoff as usize + (shnum * SHENTSIZE) as usize);

        // --- file header ---
        image.extend_from_slice(&[0x7F, b'E', b'L', b'F']);
        image.push(1); // 32-bit class
        image.push(1); // little-endian
        image.push(1); // ident version
        image.extend_from_slice(&[0u8; 9]); // ABI + padding
        push_half(&mut image, 2); // ET_EXEC
        push_half(&mut image, EM_MIPS);
        push_word(&mut image, 1); // e_version
        push_word(&mut image, self.entry);
        push_word(&mut image, if phnum > 0 { HEADER_SIZE } else { 0 }); // e_phoff
        push_word(&mut image, shoff);
        push_word(&mut image, 0); // e_flags
        push_half(&mut image, HEADER_SIZE as u16);
        push_half(&mut image, PHENTSIZE as u16);
        push_half(&mut image, phnum as u16);
        push_half(&mut image, SHENTSIZE as u16);
        push_half(&mut image, shnum as u16);
        push_half(&mut image, shstrndx as u16);
        debug_assert_eq!(image.len(), HEADER_SIZE as usize);

        // --- LOAD program header covering every ALLOC section ---
        if has_load {
            let alloc = || {
                self.sections
                    .iter()
                    .zip(&offsets)
                    .filter(|(s, _)| s.flags.contains(SectionFlags::ALLOC))
            };
            let vaddr = alloc().map(|(s, _)| s.addr).min().unwrap_or(0);
            let memsz = alloc()
                .map(|(s, _)| s.addr + s.size)
                .max()
                .unwrap_or(0)
                - vaddr;
            let file_backed =
                || alloc().filter(|(s, _)| s.section_type != SectionType::Nobits && s.size > 0);
            let p_offset = file_backed().map(|(_, &off)| off).min().unwrap_or(0);
            let filesz = file_backed()
                .map(|(s, &off)| off + s.size)
                .max()
                .map(|end| end - p_offset)
                .unwrap_or(0);

            push_word(&mut image, 1); // PT_LOAD
            push_word(&mut image, p_offset);
            push_word(&mut image, vaddr);
            push_word(&mut image, vaddr); // paddr
            push_word(&mut image, filesz);
            push_word(&mut image, memsz);
            push_word(&mut image, 0x7); // rwx; the section flags are authoritative
            push_word(&mut image, PAGE_SIZE as u32);
        }

        // --- section data ---
        for (s, &off) in self.sections.iter().zip(&offsets) {
            if off != 0 {
                debug_assert_eq!(image.len(), off as usize);
                image.extend_from_slice(&s.data);
            }
        }

        // --- string table ---
        debug_assert_eq!(image.len(), strtab_offset as usize);
        image.extend_from_slice(&strtab);
        while image.len() < shoff as usize {
            image.push(0);
        }

        // --- section header table: null entry first ---
        image.extend_from_slice(&[0u8; SHENTSIZE as usize]);
        for ((s, &off), &name_off) in self.sections.iter().zip(&offsets).zip(&name_offsets) {
            push_word(&mut image, name_off);
            push_word(&mut image, section_type_value(s.section_type));
            push_word(&mut image, s.flags.bits());
            push_word(&mut image, s.addr);
            push_word(&mut image, off);
            push_word(&mut image, s.size);
            push_word(&mut image, 0); // link
            push_word(&mut image, 0); // info
            push_word(&mut image, if s.flags.contains(SectionFlags::ALLOC) {
                PAGE_SIZE as u32
            } else {
                1
            });
            push_word(&mut image, 0); // entsize
        }
        // shstrtab's own header.
        push_word(&mut image, shstrtab_name);
        push_word(&mut image, 3); // SHT_STRTAB
        push_word(&mut image, 0);
        push_word(&mut image, 0);
        push_word(&mut image, strtab_offset);
        push_word(&mut image, strtab.len() as u32);
        push_word(&mut image, 0);
        push_word(&mut image, 0);
        push_word(&mut image, 1);
        push_word(&mut image, 0);

        image
    }
}

fn push_half(image: &mut Vec<u8>, value: u16) {
    image.extend_from_slice(&value.to_le_bytes());
}

fn push_word(image: &mut Vec<u8>, value: u32) {
    image.extend_from_slice(&value.to_le_bytes());
}

fn section_type_value(section_type: SectionType) -> u32 {
    match section_type {
        SectionType::Null => 0,
        SectionType::Progbits => 1,
        SectionType::Symtab => 2,
        SectionType::Strtab => 3,
        SectionType::Rela => 4,
        SectionType::Hash => 5,
        SectionType::Dynamic => 6,
        SectionType::Note => 7,
        SectionType::Nobits => 8,
        SectionType::Rel => 9,
        SectionType::Shlib => 10,
        SectionType::Dynsym => 11,
    }
}
