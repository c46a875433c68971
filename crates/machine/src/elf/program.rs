/// Program (segment) header type. Only `Load` matters to the kernel; the
/// rest are carried for completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramType {
    Null,
    Load,
    Dynamic,
    Interp,
    Note,
    Shlib,
    Phdr,
    Other(u32),
}

impl ProgramType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Null,
            1 => Self::Load,
            2 => Self::Dynamic,
            3 => Self::Interp,
            4 => Self::Note,
            5 => Self::Shlib,
            6 => Self::Phdr,
            other => Self::Other(other),
        }
    }
}

/// One program header of an ELF32 binary.
#[derive(Debug, Clone)]
pub struct ElfProgram {
    pub program_type: ProgramType,
    pub offset: u32,
    pub vaddr: u32,
    pub paddr: u32,
    /// Bytes occupied in the file image.
    pub filesz: u32,
    /// Bytes occupied in memory; at least `filesz`, the difference zero-fills.
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

impl ElfProgram {
    pub(crate) fn parse(data: &[u8]) -> Self {
        let word = |off: usize| {
            u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
        };
        Self {
            program_type: ProgramType::from_u32(word(0)),
            offset: word(4),
            vaddr: word(8),
            paddr: word(12),
            filesz: word(16),
            memsz: word(20),
            flags: word(24),
            align: word(28),
        }
    }
}
