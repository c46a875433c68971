use bitflags::bitflags;

use crate::config::PAGE_SIZE;

/// Section content type. The loader only understands the closed set below;
/// binaries carrying anything else are rejected as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionType {
    /// Inactive section.
    Null,
    /// Program-defined contents.
    Progbits,
    /// Symbol table.
    Symtab,
    /// String table.
    Strtab,
    /// Relocations with explicit addends.
    Rela,
    /// Symbol hash table.
    Hash,
    /// Dynamic-linking information.
    Dynamic,
    /// File markers.
    Note,
    /// Occupies no file space; otherwise like `Progbits`.
    Nobits,
    /// Relocations without explicit addends.
    Rel,
    /// Reserved.
    Shlib,
    /// Dynamic symbol table.
    Dynsym,
}

impl SectionType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Null,
            1 => Self::Progbits,
            2 => Self::Symtab,
            3 => Self::Strtab,
            4 => Self::Rela,
            5 => Self::Hash,
            6 => Self::Dynamic,
            7 => Self::Note,
            8 => Self::Nobits,
            9 => Self::Rel,
            10 => Self::Shlib,
            11 => Self::Dynsym,
            _ => return None,
        })
    }
}

bitflags! {
    /// Section attribute flags. Stored as the raw mask; unknown bits are
    /// ignored rather than rejected, since processor-specific bits are
    /// reserved by the format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        /// Writable during process execution.
        const WRITE = 0x1;
        /// Memory resident.
        const ALLOC = 0x2;
        /// Contains executable machine instructions.
        const EXECINSTR = 0x4;
    }
}

/// One section header of an ELF32 binary, with the page-granular view the
/// loader works in.
#[derive(Debug, Clone)]
pub struct ElfSection {
    /// Name resolved from the section-header string table.
    pub name: String,
    pub section_type: SectionType,
    pub flags: SectionFlags,
    /// Virtual address of the first byte, when memory resident.
    pub addr: u32,
    /// Offset of the section contents from the start of the file.
    pub offset: u32,
    /// Size of the section data in bytes.
    pub size: u32,
    /// Interpretation depends on the section type.
    pub link: u32,
    /// Interpretation depends on the section type.
    pub info: u32,
    /// `addr` must be congruent to 0 mod this; 0 or a power of two.
    pub addralign: u32,
    /// Entry size for table-shaped sections, 0 otherwise.
    pub entsize: u32,
    /// First virtual page of the section; 0 unless ALLOC.
    pub first_vpn: usize,
    /// Pages the section spans; 0 unless ALLOC.
    pub num_pages: usize,
    pub(crate) name_offset: u32,
}

impl ElfSection {
    pub(crate) fn parse(data: &[u8]) -> Option<Self> {
        let word = |off: usize| {
            u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
        };
        let section_type = SectionType::from_u32(word(4))?;
        let flags = SectionFlags::from_bits_truncate(word(8));
        let addr = word(12);
        let size = word(20);

        let (first_vpn, num_pages) = if flags.contains(SectionFlags::ALLOC) {
            (
                addr as usize / PAGE_SIZE,
                (size as usize).div_ceil(PAGE_SIZE),
            )
        } else {
            (0, 0)
        };

        Some(Self {
            name: String::new(),
            section_type,
            flags,
            addr,
            offset: word(16),
            size,
            link: word(24),
            info: word(28),
            addralign: word(32),
            entsize: word(36),
            first_vpn,
            num_pages,
            name_offset: word(0),
        })
    }

    /// Memory-resident sections are the ones the loader maps.
    pub fn loadable(&self) -> bool {
        self.flags.contains(SectionFlags::ALLOC)
    }

    /// Loadable and not writable: user stores through these pages trap.
    pub fn read_only(&self) -> bool {
        self.loadable() && !self.flags.contains(SectionFlags::WRITE)
    }
}
