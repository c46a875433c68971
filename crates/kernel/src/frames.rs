use std::sync::Mutex;

use crate::Pid;

/// Owner of every physical frame. A frame is either free or owned by exactly
/// one process; ownership is tracked per frame rather than by counting, so a
/// stray `free` cannot silently hand one process's memory to another.
#[derive(Debug)]
pub struct FrameAllocator {
    state: Mutex<FrameState>,
}

#[derive(Debug)]
struct FrameState {
    owner: Vec<Option<Pid>>,
    free: usize,
}

impl FrameAllocator {
    pub fn new(num_frames: usize) -> Self {
        Self {
            state: Mutex::new(FrameState {
                owner: vec![None; num_frames],
                free: num_frames,
            }),
        }
    }

    pub fn num_frames(&self) -> usize {
        self.state.lock().unwrap().owner.len()
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap().free
    }

    /// Atomically reserves `n` frames for `pid`, in ascending frame order.
    /// Fails without side effects when fewer than `n` frames are free.
    pub fn allocate(&self, pid: Pid, n: usize) -> Option<Vec<usize>> {
        let mut state = self.state.lock().unwrap();
        if n > state.free {
            log::debug!(
                "pid {pid}: requested {n} frames with only {} free",
                state.free
            );
            return None;
        }
        let mut taken = Vec::with_capacity(n);
        for ppn in 0..state.owner.len() {
            if taken.len() == n {
                break;
            }
            if state.owner[ppn].is_none() {
                state.owner[ppn] = Some(pid);
                taken.push(ppn);
            }
        }
        state.free -= n;
        log::trace!("pid {pid}: allocated frames {taken:?}, {} free", state.free);
        Some(taken)
    }

    /// Returns a frame to the free set, provided `pid` actually owns it.
    /// Mismatched and double frees are logged and ignored.
    pub fn free(&self, pid: Pid, ppn: usize) {
        let mut state = self.state.lock().unwrap();
        match state.owner.get(ppn).copied() {
            Some(Some(owner)) if owner == pid => {
                state.owner[ppn] = None;
                state.free += 1;
            }
            Some(Some(owner)) => {
                log::warn!("pid {pid}: tried to free frame {ppn} owned by pid {owner}");
            }
            Some(None) => {
                log::warn!("pid {pid}: tried to free frame {ppn}, which is already free");
            }
            None => {
                log::warn!("pid {pid}: tried to free frame {ppn}, which does not exist");
            }
        }
    }

    /// Sweeps ownership and releases every frame held by `pid`. Returns how
    /// many were released.
    pub fn free_all(&self, pid: Pid) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut released = 0;
        for slot in state.owner.iter_mut() {
            if *slot == Some(pid) {
                *slot = None;
                released += 1;
            }
        }
        state.free += released;
        if released > 0 {
            log::trace!("pid {pid}: released {released} frames");
        }
        released
    }

    /// Moves one frame from `from` to `to` without passing through the free
    /// set; used when a fault handler claims an evicted frame.
    pub fn transfer(&self, from: Pid, ppn: usize, to: Pid) {
        let mut state = self.state.lock().unwrap();
        match state.owner.get(ppn).copied() {
            Some(Some(owner)) if owner == from => state.owner[ppn] = Some(to),
            other => {
                log::warn!(
                    "pid {from}: tried to hand frame {ppn} to pid {to}, but it is owned by {other:?}"
                );
            }
        }
    }

    pub fn owned_frames(&self, pid: Pid) -> Vec<usize> {
        let state = self.state.lock().unwrap();
        state
            .owner
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == Some(pid))
            .map(|(ppn, _)| ppn)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_or_nothing_allocation() {
        let frames = FrameAllocator::new(4);
        assert_eq!(frames.allocate(1, 3), Some(vec![0, 1, 2]));
        assert_eq!(frames.allocate(2, 2), None);
        assert_eq!(frames.free_count(), 1);
        assert_eq!(frames.allocate(2, 1), Some(vec![3]));
    }

    #[test]
    fn mismatched_frees_are_ignored() {
        let frames = FrameAllocator::new(2);
        frames.allocate(1, 2).unwrap();
        frames.free(2, 0); // wrong owner
        assert_eq!(frames.free_count(), 0);
        frames.free(1, 0);
        frames.free(1, 0); // double free
        frames.free(1, 99); // no such frame
        assert_eq!(frames.free_count(), 1);
    }

    #[test]
    fn free_all_sweeps_ownership() {
        let frames = FrameAllocator::new(5);
        frames.allocate(1, 2).unwrap();
        frames.allocate(2, 2).unwrap();
        assert_eq!(frames.free_all(1), 2);
        assert_eq!(frames.free_count(), 3);
        assert_eq!(frames.owned_frames(2), vec![1, 3]);
    }

    #[test]
    fn transfer_moves_ownership_in_place() {
        let frames = FrameAllocator::new(2);
        frames.allocate(1, 1).unwrap();
        frames.transfer(1, 0, 2);
        assert_eq!(frames.owned_frames(2), vec![0]);
        assert_eq!(frames.free_count(), 1);
    }
}
