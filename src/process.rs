//! Process control for traced children
//!
//! Launching with PATH lookup, termination that tolerates vanished
//! processes, and reads from a tracee's address space.

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::env;
use std::ffi::{CString, OsStr};
use std::io::IoSliceMut;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::error::TracerError;
use crate::timeline::TraceeMemory;

/// Exit code of a child whose exec failed
const EXEC_FAILURE: i32 = 127;

/// Options applied to every directly launched tracee
pub fn trace_options() -> ptrace::Options {
    ptrace::Options::PTRACE_O_TRACESYSGOOD
        | ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEEXEC
        | ptrace::Options::PTRACE_O_EXITKILL
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Locate a program the way `execvp` does
///
/// Names containing a slash are used as given; bare names are searched
/// in each `PATH` entry in order.
pub fn find_executable(program: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }

    let path_var = path_var?;
    env::split_paths(path_var)
        .map(|dir| {
            // Empty PATH entries mean the current directory
            if dir.as_os_str().is_empty() {
                PathBuf::from(".").join(program)
            } else {
                dir.join(program)
            }
        })
        .find(|candidate| is_executable(candidate))
}

/// Spawn `command` as a traced child
///
/// Returns once the child is stopped after `execve` and has been resumed
/// to its next syscall boundary.
pub fn spawn_traced(command: &[String]) -> Result<Pid, TracerError> {
    let launch_error = |reason: String| TracerError::Launch {
        command: command.join(" "),
        reason,
    };

    let program = command
        .first()
        .ok_or_else(|| launch_error("empty command".to_string()))?;
    let path = find_executable(program, env::var_os("PATH").as_deref())
        .ok_or_else(|| launch_error(format!("{} not found", program)))?;

    let path = CString::new(path.into_os_string().into_vec())
        .map_err(|e| launch_error(e.to_string()))?;
    let argv = command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| launch_error(e.to_string()))?;
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    // SAFETY: the child only calls async-signal-safe functions before exec
    match unsafe { fork() }? {
        ForkResult::Child => {
            if ptrace::traceme().is_ok() {
                // SAFETY: path and argv are NUL-terminated and outlive the call
                unsafe { libc::execv(path.as_ptr(), argv_ptrs.as_ptr()) };
            }
            // SAFETY: exit without running the parent's atexit handlers
            unsafe { libc::_exit(EXEC_FAILURE) }
        }
        ForkResult::Parent { child } => {
            match waitpid(child, None)? {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
                WaitStatus::Exited(_, code) => {
                    return Err(launch_error(format!("exited with code {} before exec", code)));
                }
                status => {
                    ignore_gone(terminate(child), child, "terminate")?;
                    return Err(launch_error(format!("unexpected status {:?}", status)));
                }
            }

            ptrace::setoptions(child, trace_options())?;
            ptrace::syscall(child, None)?;
            debug!("Launched traced child {}: {:?}", child, command);
            Ok(child)
        }
    }
}

/// Kill a tracee and reap it
pub fn terminate(pid: Pid) -> nix::Result<()> {
    kill(pid, Signal::SIGKILL)?;
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return Ok(()),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Swallow the "no such process" error of a ptrace primitive
///
/// A tracee may exit between being listed and being acted upon; that is
/// logged and ignored. Every other error propagates.
pub fn ignore_gone(result: nix::Result<()>, pid: Pid, action: &str) -> Result<(), TracerError> {
    match result {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            error!("Ptrace error during {} of process {}: {}", action, pid, Errno::ESRCH);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Address space of a stopped tracee
pub struct ProcessMemory(pub Pid);

impl ProcessMemory {
    fn read_vm(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut local_iov = [IoSliceMut::new(&mut buf)];
        let remote_iov = [RemoteIoVec {
            base: addr as usize,
            len,
        }];
        let read = process_vm_readv(self.0, &mut local_iov, &remote_iov).ok()?;
        if read < len {
            return None;
        }
        Some(buf)
    }

    /// Word-wise fallback for kernels without `process_vm_readv`
    fn peek(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mut bytes = Vec::with_capacity(len);
        let mut offset = 0u64;
        while bytes.len() < len {
            let word = ptrace::read(self.0, (addr + offset) as usize as ptrace::AddressType).ok()?;
            let word = word.to_ne_bytes();
            bytes.extend_from_slice(&word);
            offset += word.len() as u64;
        }
        bytes.truncate(len);
        Some(bytes)
    }
}

impl TraceeMemory for ProcessMemory {
    fn read_bytes(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        if addr == 0 {
            return None;
        }
        self.read_vm(addr, len).or_else(|| self.peek(addr, len))
    }
}
