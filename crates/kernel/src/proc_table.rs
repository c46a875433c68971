use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::LoadError;
use crate::process::Process;
use crate::Pid;

/// The kernel's process registry: PID assignment, lookup, and the live
/// count that decides when the machine halts.
///
/// PIDs come from an unsigned cursor that only moves forward; it cannot wrap
/// negative, and assignment holds the table lock, so there is no window for
/// two processes to receive the same identifier. If the cursor ever runs
/// out, assignment falls back to scanning for the smallest unused PID.
#[derive(Debug)]
pub struct ProcessTable {
    state: Mutex<TableState>,
}

#[derive(Debug)]
struct TableState {
    procs: BTreeMap<Pid, Arc<Process>>,
    /// PIDs handed out by `assign` but not yet registered.
    reserved: HashSet<Pid>,
    next_pid: Pid,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                procs: BTreeMap::new(),
                reserved: HashSet::new(),
                next_pid: 1,
            }),
        }
    }

    /// Reserves and returns the next unused PID (> 0).
    pub fn assign(&self) -> Result<Pid, LoadError> {
        let mut state = self.state.lock().unwrap();
        if state.next_pid < Pid::MAX {
            let pid = state.next_pid;
            state.next_pid += 1;
            state.reserved.insert(pid);
            return Ok(pid);
        }
        // Cursor exhausted; reuse the smallest PID nothing holds.
        for pid in 1..Pid::MAX {
            if !state.procs.contains_key(&pid) && !state.reserved.contains(&pid) {
                state.reserved.insert(pid);
                return Ok(pid);
            }
        }
        Err(LoadError::PidExhausted)
    }

    pub fn register(&self, pid: Pid, process: Arc<Process>) {
        let mut state = self.state.lock().unwrap();
        state.reserved.remove(&pid);
        let previous = state.procs.insert(pid, process);
        assert!(previous.is_none(), "pid {pid} registered twice");
        log::trace!("pid {pid} registered, {} live", state.procs.len());
    }

    /// Removes a process and returns how many remain live.
    pub fn unregister(&self, pid: Pid) -> usize {
        let mut state = self.state.lock().unwrap();
        if state.procs.remove(&pid).is_none() {
            log::warn!("pid {pid} unregistered but was not in the table");
        }
        log::trace!("pid {pid} unregistered, {} live", state.procs.len());
        state.procs.len()
    }

    pub fn lookup(&self, pid: Pid) -> Option<Arc<Process>> {
        self.state.lock().unwrap().procs.get(&pid).cloned()
    }

    /// Number of registered (live) processes.
    pub fn live(&self) -> usize {
        self.state.lock().unwrap().procs.len()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
