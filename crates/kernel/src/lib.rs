//! User-process kernel for the simulated MIPS machine.
//!
//! The kernel loads statically linked ELF32 executables into private
//! address spaces, multiplexes them over the machine, and serves a small
//! POSIX-flavored syscall set. Two flavors share all of this code and
//! differ only in memory policy: [`kernel::UserKernel::new`] commits frames
//! eagerly at exec, [`kernel::UserKernel::with_demand_paging`] pages them
//! in on fault with an inverted page table and a swap file behind it.

pub mod error;
pub mod fd_table;
pub mod frames;
pub mod kernel;
pub mod paging;
pub mod proc_table;
pub mod process;
pub mod sync;
pub mod syscall;

/// Process identifier. Always positive for a real process.
pub type Pid = u32;

pub use error::{LoadError, SyscallError};
pub use fd_table::{FdTable, MAX_FDS};
pub use frames::FrameAllocator;
pub use kernel::{ThreadAction, UserKernel};
pub use paging::{DemandPager, EagerPager, FaultError, Pager, PinGuard, PinSet, SWAP_FILE};
pub use proc_table::ProcessTable;
pub use process::{ChildExit, Process, Space, MAX_ARG_STR, STACK_PAGES};
pub use sync::Semaphore;
pub use syscall::Syscall;
