//! Syscall register access for the supported architectures

use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::error::TracerError;

/// Syscall number and arguments captured at syscall-entry
///
/// Arguments are read at entry because some architectures (aarch64)
/// reuse the first argument register for the return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallEntry {
    pub number: i64,
    pub args: [u64; 6],
}

#[cfg(target_arch = "x86_64")]
pub fn syscall_entry(pid: Pid) -> Result<SyscallEntry, TracerError> {
    let regs = ptrace::getregs(pid)?;
    Ok(SyscallEntry {
        number: regs.orig_rax as i64,
        args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
    })
}

#[cfg(target_arch = "x86_64")]
pub fn syscall_result(pid: Pid) -> Result<i64, TracerError> {
    Ok(ptrace::getregs(pid)?.rax as i64)
}

#[cfg(target_arch = "aarch64")]
pub fn syscall_entry(pid: Pid) -> Result<SyscallEntry, TracerError> {
    let regs = ptrace::getregs(pid)?;
    Ok(SyscallEntry {
        number: regs.regs[8] as i64,
        args: [
            regs.regs[0],
            regs.regs[1],
            regs.regs[2],
            regs.regs[3],
            regs.regs[4],
            regs.regs[5],
        ],
    })
}

#[cfg(target_arch = "aarch64")]
pub fn syscall_result(pid: Pid) -> Result<i64, TracerError> {
    Ok(ptrace::getregs(pid)?.regs[0] as i64)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn syscall_entry(_pid: Pid) -> Result<SyscallEntry, TracerError> {
    Err(TracerError::Unsupported)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn syscall_result(_pid: Pid) -> Result<i64, TracerError> {
    Err(TracerError::Unsupported)
}
