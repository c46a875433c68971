//! The system-call surface: the closed set of calls, argument marshaling
//! from user memory, and the handlers themselves.

use std::sync::Arc;

use machine::{reg, Cpu, PAGE_SIZE};

use crate::error::SyscallError;
use crate::kernel::{ThreadAction, UserKernel};
use crate::process::{Process, MAX_ARG_STR};

/// Raw syscall numbers, as user programs place them in v0.
pub mod nr {
    pub const HALT: u32 = 0;
    pub const EXIT: u32 = 1;
    pub const EXEC: u32 = 2;
    pub const JOIN: u32 = 3;
    pub const CREAT: u32 = 4;
    pub const OPEN: u32 = 5;
    pub const READ: u32 = 6;
    pub const WRITE: u32 = 7;
    pub const CLOSE: u32 = 8;
    pub const UNLINK: u32 = 9;
}

/// The closed set of system calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Halt,
    Exit,
    Exec,
    Join,
    Creat,
    Open,
    Read,
    Write,
    Close,
    Unlink,
}

impl Syscall {
    pub fn from_number(number: u32) -> Option<Self> {
        Some(match number {
            nr::HALT => Self::Halt,
            nr::EXIT => Self::Exit,
            nr::EXEC => Self::Exec,
            nr::JOIN => Self::Join,
            nr::CREAT => Self::Creat,
            nr::OPEN => Self::Open,
            nr::READ => Self::Read,
            nr::WRITE => Self::Write,
            nr::CLOSE => Self::Close,
            nr::UNLINK => Self::Unlink,
            _ => return None,
        })
    }
}

/// Decodes v0/a0..a3, runs the handler, writes the result back to v0, and
/// moves the PC past the syscall instruction. Any [`SyscallError`] reaches
/// the user program as -1. `exit` and a permitted `halt` never return to
/// user mode, so neither touches the registers.
pub(crate) fn dispatch(
    kernel: &Arc<UserKernel>,
    process: &Arc<Process>,
    cpu: &mut Cpu,
) -> ThreadAction {
    let number = cpu.read_register(reg::V0);
    let a0 = cpu.read_register(reg::A0);
    let a1 = cpu.read_register(reg::A1);
    let a2 = cpu.read_register(reg::A2);
    let _a3 = cpu.read_register(reg::A3);

    // An unknown number means corrupted user state the interpreter should
    // have rejected; it is a bug, not a condition.
    let call =
        Syscall::from_number(number).unwrap_or_else(|| panic!("unknown system call {number}"));
    log::trace!(
        "pid {}: syscall {call:?}({a0:#x}, {a1:#x}, {a2:#x})",
        process.pid()
    );

    let result = match call {
        Syscall::Halt => {
            // Only the root process may stop the machine.
            if process.pid() == 1 {
                kernel.terminate();
                return ThreadAction::Finish;
            }
            log::debug!("pid {}: halt refused", process.pid());
            Ok(0)
        }
        Syscall::Exit => {
            kernel.exit_process(process, a0 as i32, false);
            return ThreadAction::Finish;
        }
        Syscall::Exec => handle_exec(kernel, process, a0, a1, a2),
        Syscall::Join => handle_join(kernel, process, a0, a1),
        Syscall::Creat => handle_open_common(kernel, process, a0, true),
        Syscall::Open => handle_open_common(kernel, process, a0, false),
        Syscall::Read => handle_read(process, a0, a1, a2),
        Syscall::Write => handle_write(process, a0, a1, a2),
        Syscall::Close => handle_close(process, a0),
        Syscall::Unlink => handle_unlink(kernel, process, a0),
    };

    let value = match result {
        Ok(value) => value,
        Err(err) => {
            log::debug!("pid {}: {call:?} failed: {err}", process.pid());
            -1
        }
    };
    cpu.write_register(reg::V0, value as u32);
    cpu.advance_pc();
    ThreadAction::Continue
}

/// A descriptor argument, rejected if negative.
fn fd_arg(raw: u32) -> Result<usize, SyscallError> {
    let fd = raw as i32;
    if fd < 0 {
        return Err(SyscallError::BadFd);
    }
    Ok(fd as usize)
}

fn handle_exec(
    kernel: &Arc<UserKernel>,
    process: &Arc<Process>,
    name_ptr: u32,
    argc: u32,
    argv_ptr: u32,
) -> Result<i32, SyscallError> {
    let name = process
        .read_vm_string(name_ptr, MAX_ARG_STR)
        .ok_or(SyscallError::BadAddr)?;
    let argc = argc as usize;
    if argc * 4 > PAGE_SIZE {
        return Err(SyscallError::BadAddr);
    }

    let mut pointers = vec![0u8; argc * 4];
    if process.read_vm(argv_ptr, &mut pointers) != pointers.len() {
        return Err(SyscallError::BadAddr);
    }
    let mut argv = Vec::with_capacity(argc);
    for chunk in pointers.chunks_exact(4) {
        let addr = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let arg = process
            .read_vm_string(addr, MAX_ARG_STR)
            .ok_or(SyscallError::BadAddr)?;
        argv.push(arg);
    }

    match kernel.exec(&name, &argv, Some(process)) {
        Ok(pid) => Ok(pid as i32),
        Err(err) => {
            log::debug!("pid {}: exec {name:?} failed: {err}", process.pid());
            Ok(-1)
        }
    }
}

fn handle_join(
    kernel: &Arc<UserKernel>,
    process: &Arc<Process>,
    pid: u32,
    status_ptr: u32,
) -> Result<i32, SyscallError> {
    let exit = kernel.join(process, pid)?;
    if !exit.clean {
        return Ok(0);
    }
    if process.write_vm(status_ptr, &exit.status.to_le_bytes()) != 4 {
        return Err(SyscallError::BadAddr);
    }
    Ok(1)
}

fn handle_open_common(
    kernel: &Arc<UserKernel>,
    process: &Arc<Process>,
    name_ptr: u32,
    create: bool,
) -> Result<i32, SyscallError> {
    let name = process
        .read_vm_string(name_ptr, MAX_ARG_STR)
        .ok_or(SyscallError::BadAddr)?;
    let file = kernel
        .machine()
        .file_system()
        .open(&name, create)
        .ok_or(SyscallError::NoSuchFile)?;
    let fd = process.state().fd_table.allocate(file)?;
    Ok(fd as i32)
}

fn handle_read(process: &Arc<Process>, fd: u32, buf_ptr: u32, count: u32) -> Result<i32, SyscallError> {
    let fd = fd_arg(fd)?;
    if (count as i32) < 0 {
        return Err(SyscallError::BadAddr);
    }
    let file = process.state().fd_table.get(fd).ok_or(SyscallError::BadFd)?;

    let mut buffer = vec![0u8; count as usize];
    let got = match file.lock().unwrap().read(&mut buffer) {
        Ok(got) => got,
        Err(err) => {
            log::debug!("pid {}: read on fd {fd} failed: {err}", process.pid());
            return Ok(-1);
        }
    };
    if got == 0 {
        return Ok(0);
    }
    // Report what actually landed in the process's memory.
    let delivered = process.write_vm(buf_ptr, &buffer[..got]);
    if delivered == 0 {
        return Err(SyscallError::BadAddr);
    }
    Ok(delivered as i32)
}

fn handle_write(process: &Arc<Process>, fd: u32, buf_ptr: u32, count: u32) -> Result<i32, SyscallError> {
    let fd = fd_arg(fd)?;
    if (count as i32) < 0 {
        return Err(SyscallError::BadAddr);
    }
    let file = process.state().fd_table.get(fd).ok_or(SyscallError::BadFd)?;

    let mut buffer = vec![0u8; count as usize];
    let got = process.read_vm(buf_ptr, &mut buffer);
    if count > 0 && got == 0 {
        return Err(SyscallError::BadAddr);
    }
    let result = file.lock().unwrap().write(&buffer[..got]);
    match result {
        Ok(written) => Ok(written as i32),
        Err(err) => {
            log::debug!("pid {}: write on fd {fd} failed: {err}", process.pid());
            Ok(-1)
        }
    }
}

fn handle_close(process: &Arc<Process>, fd: u32) -> Result<i32, SyscallError> {
    let fd = fd_arg(fd)?;
    process
        .state()
        .fd_table
        .remove(fd)
        .map(|_| 0)
        .ok_or(SyscallError::BadFd)
}

fn handle_unlink(
    kernel: &Arc<UserKernel>,
    process: &Arc<Process>,
    name_ptr: u32,
) -> Result<i32, SyscallError> {
    let name = process
        .read_vm_string(name_ptr, MAX_ARG_STR)
        .ok_or(SyscallError::BadAddr)?;
    if kernel.machine().file_system().remove(&name) {
        Ok(0)
    } else {
        Err(SyscallError::NoSuchFile)
    }
}
