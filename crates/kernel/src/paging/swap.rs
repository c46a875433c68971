use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use machine::{FileSystem, OpenFile, PAGE_SIZE};

use crate::Pid;

/// Name of the backing store, pre-sized at kernel init and removed at
/// kernel termination.
pub const SWAP_FILE: &str = "nachos.swp";

/// Slot bookkeeping: which `(pid, vpn)` each slot backs, and which slots
/// are free. A binding outlives swap-in — while the page stays clean the
/// slot still holds a current copy, so a clean eviction needs no write.
#[derive(Debug)]
pub struct SwapSlots {
    bindings: HashMap<(Pid, usize), usize>,
    free: Vec<usize>,
}

impl SwapSlots {
    pub fn binding(&self, pid: Pid, vpn: usize) -> Option<usize> {
        self.bindings.get(&(pid, vpn)).copied()
    }

    /// Whether `bind` would succeed without taking a new slot it cannot get.
    pub fn can_bind(&self, pid: Pid, vpn: usize) -> bool {
        self.bindings.contains_key(&(pid, vpn)) || !self.free.is_empty()
    }

    /// The slot backing the page, allocating one on first eviction.
    pub fn bind(&mut self, pid: Pid, vpn: usize) -> Option<usize> {
        if let Some(slot) = self.binding(pid, vpn) {
            return Some(slot);
        }
        let slot = self.free.pop()?;
        self.bindings.insert((pid, vpn), slot);
        Some(slot)
    }

    pub fn release(&mut self, pid: Pid, vpn: usize) {
        if let Some(slot) = self.bindings.remove(&(pid, vpn)) {
            self.free.push(slot);
        }
    }

    pub fn release_all(&mut self, pid: Pid) {
        let gone: Vec<(Pid, usize)> = self
            .bindings
            .keys()
            .filter(|(owner, _)| *owner == pid)
            .copied()
            .collect();
        for key in gone {
            let slot = self.bindings.remove(&key).unwrap();
            self.free.push(slot);
        }
    }

    pub fn bound_count(&self) -> usize {
        self.bindings.len()
    }
}

/// The swap file plus its slot table. Slot `k` occupies file bytes
/// `[k * PAGE_SIZE, (k + 1) * PAGE_SIZE)`.
pub struct SwapStore {
    file: Mutex<Box<dyn OpenFile>>,
    slots: Mutex<SwapSlots>,
}

impl SwapStore {
    /// Creates and pre-sizes the swap file. Failure here means the host
    /// cannot provide a backing store at all, which is fatal to kernel
    /// bring-up.
    pub fn new(fs: &dyn FileSystem, num_slots: usize) -> Self {
        let mut file = fs
            .open(SWAP_FILE, true)
            .unwrap_or_else(|| panic!("cannot create swap file {SWAP_FILE:?}"));
        let zeros = vec![0u8; num_slots * PAGE_SIZE];
        file.write_at(0, &zeros)
            .expect("cannot pre-size swap file");
        Self {
            file: Mutex::new(file),
            // Pop order hands out slot 0 first.
            slots: Mutex::new(SwapSlots {
                bindings: HashMap::new(),
                free: (0..num_slots).rev().collect(),
            }),
        }
    }

    pub fn slots(&self) -> MutexGuard<'_, SwapSlots> {
        self.slots.lock().unwrap()
    }

    pub fn binding(&self, pid: Pid, vpn: usize) -> Option<usize> {
        self.slots().binding(pid, vpn)
    }

    pub fn release_all(&self, pid: Pid) {
        self.slots().release_all(pid);
    }

    /// Reads one slot's page. Swap I/O failure is a kernel invariant
    /// violation: the file was pre-sized at init.
    pub fn read_slot(&self, slot: usize) -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.file
            .lock()
            .unwrap()
            .read_exact_at((slot * PAGE_SIZE) as u64, &mut buf)
            .expect("swap read failed");
        buf
    }

    /// Writes one slot's page.
    pub fn write_slot(&self, slot: usize, buf: &[u8]) {
        assert_eq!(buf.len(), PAGE_SIZE, "swap writes are page sized");
        self.file
            .lock()
            .unwrap()
            .write_at((slot * PAGE_SIZE) as u64, buf)
            .expect("swap write failed");
    }

    /// Removes the backing file at kernel termination.
    pub fn shutdown(&self, fs: &dyn FileSystem) {
        if !fs.remove(SWAP_FILE) {
            log::warn!("swap file {SWAP_FILE:?} was already gone at shutdown");
        }
    }
}

impl std::fmt::Debug for SwapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapStore")
            .field("bound", &self.slots().bound_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machine::MemFileSystem;

    #[test]
    fn slots_bind_once_and_recycle() {
        let fs = MemFileSystem::new();
        let store = SwapStore::new(&fs, 2);
        assert_eq!(fs.contents(SWAP_FILE).unwrap().len(), 2 * PAGE_SIZE);

        let mut slots = store.slots();
        let a = slots.bind(1, 0).unwrap();
        assert_eq!(slots.bind(1, 0).unwrap(), a); // same page, same slot
        let b = slots.bind(1, 5).unwrap();
        assert_ne!(a, b);
        assert!(slots.bind(2, 0).is_none()); // exhausted
        assert!(!slots.can_bind(2, 0));
        assert!(slots.can_bind(1, 5));

        slots.release_all(1);
        assert_eq!(slots.bound_count(), 0);
        assert!(slots.bind(2, 0).is_some());
    }

    #[test]
    fn slot_io_roundtrip() {
        let fs = MemFileSystem::new();
        let store = SwapStore::new(&fs, 4);
        let page: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 250) as u8).collect();
        store.write_slot(2, &page);
        assert_eq!(store.read_slot(2), page);
        assert_eq!(store.read_slot(1), vec![0u8; PAGE_SIZE]);
    }
}
