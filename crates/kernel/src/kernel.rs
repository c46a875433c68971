use std::sync::Arc;
use std::thread;

use machine::{Cpu, FnGuest, GuestProgram, Machine, Trap, PAGE_SIZE};
use machine::reg;

use crate::error::{LoadError, SyscallError};
use crate::frames::FrameAllocator;
use crate::paging::{DemandPager, EagerPager, Pager};
use crate::proc_table::ProcessTable;
use crate::process::{ChildExit, Process};
use crate::syscall::{self, nr};
use crate::Pid;

/// What a user thread does after the kernel handles a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadAction {
    /// Resume the guest with the same context.
    Continue,
    /// The process is gone (or the machine is); wind the thread down.
    Finish,
}

/// A kernel that runs multiple user processes on the simulated machine.
///
/// Kernel-global state — the frame allocator, the process table, and the
/// paging policy — lives here and is handed to processes as capabilities.
/// The two flavors differ only in the pager they carry.
pub struct UserKernel {
    machine: Arc<Machine>,
    frames: Arc<FrameAllocator>,
    pager: Arc<dyn Pager>,
    procs: ProcessTable,
}

impl UserKernel {
    /// The basic kernel: every frame of an address space committed at exec.
    pub fn new(machine: Arc<Machine>) -> Arc<Self> {
        let frames = Arc::new(FrameAllocator::new(machine.config().num_phys_pages));
        let pager: Arc<dyn Pager> =
            Arc::new(EagerPager::new(Arc::clone(&machine), Arc::clone(&frames)));
        Self::with_pager(machine, frames, pager)
    }

    /// The demand-paging kernel: frames on fault, evictions under pressure,
    /// the swap file created now and removed at termination.
    pub fn with_demand_paging(machine: Arc<Machine>) -> Arc<Self> {
        let frames = Arc::new(FrameAllocator::new(machine.config().num_phys_pages));
        let pager: Arc<dyn Pager> =
            Arc::new(DemandPager::new(Arc::clone(&machine), Arc::clone(&frames)));
        Self::with_pager(machine, frames, pager)
    }

    fn with_pager(
        machine: Arc<Machine>,
        frames: Arc<FrameAllocator>,
        pager: Arc<dyn Pager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            machine,
            frames,
            pager,
            procs: ProcessTable::new(),
        })
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn frames(&self) -> &Arc<FrameAllocator> {
        &self.frames
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.procs
    }

    pub fn demand_paged(&self) -> bool {
        self.pager.demand_paged()
    }

    /// Boots the kernel by running the root program (PID 1).
    pub fn start(self: &Arc<Self>, name: &str, argv: &[String]) -> Result<Pid, LoadError> {
        self.exec(name, argv, None)
    }

    /// Creates a process, loads the named executable into it, and forks a
    /// user thread running its guest. On load failure everything is undone
    /// and the error reported to the caller.
    pub fn exec(
        self: &Arc<Self>,
        name: &str,
        argv: &[String],
        parent: Option<&Arc<Process>>,
    ) -> Result<Pid, LoadError> {
        let pid = self.procs.assign()?;
        let process = Arc::new(Process::new(
            pid,
            parent.map(|p| p.pid()),
            Arc::clone(&self.pager),
            Arc::clone(self.machine.memory()),
        ));
        {
            let console = self.machine.console();
            let mut state = process.state();
            state.fd_table.install(0, console.open_for_reading());
            state.fd_table.install(1, console.open_for_writing());
        }
        self.procs.register(pid, Arc::clone(&process));
        if let Some(parent) = parent {
            parent.state().children.insert(pid);
        }

        match process.load(&self.machine, name, argv) {
            Ok(()) => {
                let guest = self
                    .machine
                    .programs()
                    .instantiate(name)
                    .unwrap_or_else(unscripted_guest);
                self.fork_user_thread(Arc::clone(&process), guest);
                log::debug!("exec {name:?} -> pid {pid}");
                Ok(pid)
            }
            Err(err) => {
                log::debug!("exec {name:?} failed for pid {pid}: {err}");
                self.cleanup_failed_exec(&process, parent);
                Err(err)
            }
        }
    }

    /// Undoes a process whose load failed: it never ran, so there is no
    /// status to deliver, but its resources and registration must go.
    fn cleanup_failed_exec(&self, process: &Arc<Process>, parent: Option<&Arc<Process>>) {
        process.state().fd_table.drain();
        process.unload();
        if let Some(parent) = parent {
            parent.state().children.remove(&process.pid());
        }
        if self.procs.unregister(process.pid()) == 0 {
            self.terminate();
        }
    }

    fn fork_user_thread(self: &Arc<Self>, process: Arc<Process>, mut guest: Box<dyn GuestProgram>) {
        let kernel = Arc::clone(self);
        let pid = process.pid();
        thread::Builder::new()
            .name(format!("user-{pid}"))
            .spawn(move || {
                let mut cpu = Cpu::new(
                    Arc::clone(kernel.machine.memory()),
                    kernel.machine.config(),
                );
                cpu.set_demand_paged(kernel.pager.demand_paged());
                process.init_registers(&mut cpu);
                process.restore_state(&mut cpu);
                loop {
                    if kernel.machine.is_halted() {
                        break;
                    }
                    let trap = guest.run(&mut cpu);
                    match kernel.handle_exception(&process, &mut cpu, trap) {
                        ThreadAction::Continue => {}
                        ThreadAction::Finish => break,
                    }
                }
                log::trace!("pid {pid}: user thread finished");
            })
            .expect("failed to spawn user thread");
    }

    /// Routes one trap raised by a user thread. Syscalls dispatch; faults go
    /// to the pager; everything else ends the process abnormally.
    pub fn handle_exception(
        self: &Arc<Self>,
        process: &Arc<Process>,
        cpu: &mut Cpu,
        trap: Trap,
    ) -> ThreadAction {
        match trap {
            Trap::Syscall => syscall::dispatch(self, process, cpu),
            Trap::TlbMiss { vaddr } => {
                let vpn = vaddr as usize / PAGE_SIZE;
                let outcome = match process.space() {
                    Some(space) => self.pager.page_fault(process.pid(), &space, vpn),
                    None => Err(crate::paging::FaultError::OutOfRange),
                };
                match outcome {
                    Ok(()) => ThreadAction::Continue,
                    Err(err) => {
                        log::debug!(
                            "pid {}: unservable fault at {vaddr:#x}: {err}",
                            process.pid()
                        );
                        self.abnormal_exit(process)
                    }
                }
            }
            Trap::ReadOnly { vaddr } => {
                log::debug!("pid {}: write to read-only page at {vaddr:#x}", process.pid());
                self.abnormal_exit(process)
            }
            Trap::BusError { vaddr } => {
                log::debug!("pid {}: bus error at {vaddr:#x}", process.pid());
                self.abnormal_exit(process)
            }
            Trap::AddressError { vaddr } => {
                log::debug!("pid {}: misaligned access at {vaddr:#x}", process.pid());
                self.abnormal_exit(process)
            }
            Trap::IllegalInstruction => {
                log::debug!("pid {}: illegal instruction", process.pid());
                self.abnormal_exit(process)
            }
        }
    }

    fn abnormal_exit(&self, process: &Arc<Process>) -> ThreadAction {
        self.exit_process(process, 0, true);
        ThreadAction::Finish
    }

    /// The exit path, shared by the `exit` syscall and trap-driven
    /// termination. Resources go first, then the status is published and
    /// any joined parent woken, then the table entry goes; the machine
    /// halts when the last process leaves.
    pub fn exit_process(&self, process: &Arc<Process>, status: i32, abnormal: bool) {
        let pid = process.pid();
        log::debug!("pid {pid}: exiting, status={status} abnormal={abnormal}");

        let files = {
            let mut state = process.state();
            state.exit_code = status;
            state.abnormal |= abnormal;
            state.exited = true;
            state.fd_table.drain()
        };
        drop(files); // closes every descriptor
        process.unload();

        if let Some(ppid) = process.parent() {
            if let Some(parent) = self.procs.lookup(ppid) {
                let wake = {
                    let mut pstate = parent.state();
                    pstate.children.remove(&pid);
                    pstate.exited_children.insert(
                        pid,
                        ChildExit {
                            status,
                            clean: !abnormal,
                        },
                    );
                    pstate.joined_to == Some(pid)
                };
                if wake {
                    parent.join_sem().v();
                }
            }
        }

        if self.procs.unregister(pid) == 0 {
            log::debug!("pid {pid} was the last process; machine coming down");
            self.terminate();
        }
    }

    /// Waits for a specific child to exit and returns its recorded status.
    /// Rejected if the target is not an unreaped child of the caller or if
    /// the caller already has a join outstanding.
    pub fn join(&self, parent: &Arc<Process>, child: Pid) -> Result<ChildExit, SyscallError> {
        {
            let mut state = parent.state();
            if state.joined_to.is_some() {
                return Err(SyscallError::AlreadyJoined);
            }
            // A child that already exited left its status behind; reap it.
            if let Some(exit) = state.exited_children.remove(&child) {
                return Ok(exit);
            }
            if !state.children.contains(&child) {
                return Err(SyscallError::NotAChild);
            }
            state.joined_to = Some(child);
        }

        parent.join_sem().p();

        let mut state = parent.state();
        state.joined_to = None;
        let exit = state
            .exited_children
            .remove(&child)
            .expect("join woke without a recorded exit");
        Ok(exit)
    }

    /// Kernel shutdown: backing store torn down, machine halted.
    pub fn terminate(&self) {
        self.pager.shutdown();
        self.machine.halt();
    }
}

impl std::fmt::Debug for UserKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserKernel")
            .field("live", &self.procs.live())
            .field("demand_paged", &self.demand_paged())
            .finish()
    }
}

/// Body for an executable nobody registered an interpreter for: it exits
/// immediately with status 0.
fn unscripted_guest() -> Box<dyn GuestProgram> {
    FnGuest::boxed(|cpu: &mut Cpu| {
        cpu.write_register(reg::V0, nr::EXIT);
        cpu.write_register(reg::A0, 0);
        Trap::Syscall
    })
}
