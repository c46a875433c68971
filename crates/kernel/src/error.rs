use std::fmt;

/// Why an `exec` failed before the new process ever ran. These stay inside
/// the kernel; user programs only see -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// The executable does not exist.
    NoSuchFile,
    /// The file is not a loadable ELF32 executable.
    BadFormat,
    /// Loadable sections are not contiguous from virtual page 0.
    Fragmented,
    /// The argument block does not fit in one page.
    ArgsTooLong,
    /// Not enough free frames for the image, stack, and argument page.
    OutOfMemory,
    /// No unused process identifier is left.
    PidExhausted,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Self::NoSuchFile => "no such executable",
            Self::BadFormat => "malformed executable",
            Self::Fragmented => "fragmented executable",
            Self::ArgsTooLong => "arguments too long",
            Self::OutOfMemory => "insufficient physical memory",
            Self::PidExhausted => "process identifiers exhausted",
        };
        f.write_str(what)
    }
}

impl std::error::Error for LoadError {}

impl From<machine::elf::ElfError> for LoadError {
    fn from(err: machine::elf::ElfError) -> Self {
        log::debug!("ELF rejected: {err}");
        Self::BadFormat
    }
}

/// Conditions a syscall reports to the user program as -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// The descriptor names no open file.
    BadFd,
    /// A user pointer could not be read or written.
    BadAddr,
    /// The named file does not exist.
    NoSuchFile,
    /// The descriptor table is full.
    OutOfFds,
    /// The target process is not a child of the caller.
    NotAChild,
    /// The caller already has a join outstanding.
    AlreadyJoined,
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Self::BadFd => "bad file descriptor",
            Self::BadAddr => "bad user address",
            Self::NoSuchFile => "no such file",
            Self::OutOfFds => "file descriptor table full",
            Self::NotAChild => "not a child of the caller",
            Self::AlreadyJoined => "join already outstanding",
        };
        f.write_str(what)
    }
}

impl std::error::Error for SyscallError {}
