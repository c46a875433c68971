use std::fmt;
use std::sync::{Arc, Mutex};

use machine::OpenFile;

use crate::error::SyscallError;

/// Capacity of a process's descriptor table.
pub const MAX_FDS: usize = 16;

/// A shared handle on an open file. Syscalls clone the handle out of the
/// table and lock it for the duration of one I/O operation, so a close from
/// the exit path never races a transfer in flight.
pub type FileRef = Arc<Mutex<Box<dyn OpenFile>>>;

/// Per-process descriptor table: a fixed-capacity sparse map from small
/// integers to open files. Descriptors 0 and 1 are installed at process
/// creation; like any other descriptor they can be closed and reused.
pub struct FdTable {
    slots: Vec<Option<FileRef>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_FDS).map(|_| None).collect(),
        }
    }

    /// Puts a file at a specific descriptor, replacing whatever was there.
    pub fn install(&mut self, fd: usize, file: Box<dyn OpenFile>) {
        self.slots[fd] = Some(Arc::new(Mutex::new(file)));
    }

    /// Maps the file to the smallest unused descriptor.
    pub fn allocate(&mut self, file: Box<dyn OpenFile>) -> Result<usize, SyscallError> {
        let fd = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(SyscallError::OutOfFds)?;
        self.slots[fd] = Some(Arc::new(Mutex::new(file)));
        Ok(fd)
    }

    pub fn get(&self, fd: usize) -> Option<FileRef> {
        self.slots.get(fd)?.clone()
    }

    /// Frees the descriptor. The file closes once the last in-flight
    /// operation drops its handle.
    pub fn remove(&mut self, fd: usize) -> Option<FileRef> {
        self.slots.get_mut(fd)?.take()
    }

    /// Empties the table, returning every open file. Used by the exit path.
    pub fn drain(&mut self) -> Vec<FileRef> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FdTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdTable")
            .field("open", &self.open_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machine::MemFileSystem;
    use machine::fs::FileSystem;

    fn some_file(fs: &MemFileSystem, name: &str) -> Box<dyn OpenFile> {
        fs.open(name, true).unwrap()
    }

    #[test]
    fn allocates_smallest_free_descriptor() {
        let fs = MemFileSystem::new();
        let mut table = FdTable::new();
        table.install(0, some_file(&fs, "in"));
        table.install(1, some_file(&fs, "out"));

        assert_eq!(table.allocate(some_file(&fs, "a")).unwrap(), 2);
        assert_eq!(table.allocate(some_file(&fs, "b")).unwrap(), 3);

        // Closing 0 makes it the smallest free slot again.
        assert!(table.remove(0).is_some());
        assert!(table.remove(0).is_none());
        assert_eq!(table.allocate(some_file(&fs, "c")).unwrap(), 0);
    }

    #[test]
    fn capacity_is_bounded() {
        let fs = MemFileSystem::new();
        let mut table = FdTable::new();
        for _ in 0..MAX_FDS {
            table.allocate(some_file(&fs, "f")).unwrap();
        }
        assert_eq!(
            table.allocate(some_file(&fs, "f")).unwrap_err(),
            SyscallError::OutOfFds
        );
        assert_eq!(table.drain().len(), MAX_FDS);
        assert_eq!(table.open_count(), 0);
    }
}
