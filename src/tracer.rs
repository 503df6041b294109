//! Multi-process syscall tracer using ptrace
//!
//! The tracer owns every traced process explicitly. `wait` polls them
//! round-robin without blocking, sleeping with a bounded exponential
//! backoff between empty rounds, so independent process trees are
//! serviced fairly and a deadline holds no matter which process stalls.

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::TracerConfig;
use crate::error::TracerError;
use crate::event::{Event, EventId, EventKind, Origin};
use crate::process::{self, ignore_gone, ProcessMemory};
use crate::regs::{self, SyscallEntry};
use crate::syscalls;
use crate::timeline::{RawSyscall, Timeline, TraceeMemory};

/// Handle to a directly launched traced process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: Pid,
    pub origin: Origin,
}

/// Exponential backoff between empty polling rounds
#[derive(Debug, Clone)]
pub struct Backoff {
    pause: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            pause: initial.min(max),
            max,
        }
    }

    /// Next sleep, clipped so it never overshoots the deadline
    ///
    /// Fails with `Timeout` once the deadline has been reached.
    pub fn next_pause(&mut self, now: Instant, deadline: Option<Instant>) -> Result<Duration, TracerError> {
        let pause = self.pause;
        self.pause = (self.pause * 2).min(self.max);

        match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(now);
                if remaining.is_zero() {
                    Err(TracerError::Timeout)
                } else {
                    Ok(pause.min(remaining))
                }
            }
            None => Ok(pause),
        }
    }
}

/// Call `poll` until it yields a value, sleeping between empty rounds
pub fn poll_until<T>(
    deadline: Option<Instant>,
    backoff: &mut Backoff,
    mut poll: impl FnMut() -> Result<Option<T>, TracerError>,
) -> Result<T, TracerError> {
    loop {
        if let Some(value) = poll()? {
            return Ok(value);
        }
        let pause = backoff.next_pause(Instant::now(), deadline)?;
        thread::sleep(pause);
    }
}

#[derive(Debug)]
struct TracedProcess {
    origin: Origin,
    /// Syscall entered but not yet exited
    pending: Option<SyscallEntry>,
    in_syscall: bool,
    /// Auto-attached child that has not reported its initial SIGSTOP
    fresh: bool,
}

impl TracedProcess {
    fn new(origin: Origin, fresh: bool) -> Self {
        Self {
            origin,
            pending: None,
            in_syscall: false,
            fresh,
        }
    }
}

enum Poll {
    Status(Pid, WaitStatus),
    Drained,
}

pub struct Tracer {
    started: Instant,
    deadline: Option<Instant>,
    processes: BTreeMap<Pid, TracedProcess>,
    last_serviced: Option<Pid>,
    timeline: Timeline,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Tracer {
    pub fn new(config: &TracerConfig) -> Self {
        Self {
            started: Instant::now(),
            deadline: None,
            processes: BTreeMap::new(),
            last_serviced: None,
            timeline: Timeline::new(config.log_untracked_close),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }

    /// Seconds since the tracer started
    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Replace the deadline for subsequent waits
    pub fn set_deadline(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(deadline);
        debug!(
            "New deadline: {:.3}",
            deadline.duration_since(self.started).as_secs_f64()
        );
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn events(&self) -> &[Event] {
        self.timeline.events()
    }

    /// Pids currently under trace
    pub fn traced_pids(&self) -> Vec<Pid> {
        self.processes.keys().copied().collect()
    }

    /// Launch `command` under trace, tagged with `origin`
    pub fn new_child(&mut self, origin: Origin, command: &[String]) -> Result<ProcessHandle, TracerError> {
        debug!("Starting {}: {:?}", origin, command);
        let pid = process::spawn_traced(command)?;
        self.processes.insert(pid, TracedProcess::new(origin, false));
        Ok(ProcessHandle { pid, origin })
    }

    /// Advance the traced processes until a matching event is logged
    ///
    /// - `target` and `syscall`: an exit from `syscall` by any process with
    ///   the target's origin
    /// - `target` only: the exit of the target process
    /// - neither: the next logged event
    ///
    /// Returns `Ok(None)` once no traced process remains and
    /// `Err(TracerError::Timeout)` when the deadline passes first.
    pub fn wait(
        &mut self,
        target: Option<&ProcessHandle>,
        syscall: Option<&str>,
    ) -> Result<Option<Event>, TracerError> {
        if let (Some(target), None) = (target, syscall) {
            if let Some(exit) = self.events().iter().find(|event| {
                event.pid == target.pid && matches!(event.kind, EventKind::Exit { .. })
            }) {
                return Ok(Some(exit.clone()));
            }
        }

        loop {
            let (pid, status) = match self.next_status()? {
                Poll::Status(pid, status) => (pid, status),
                Poll::Drained => return Ok(None),
            };

            if let Some(id) = self.dispatch(pid, status)? {
                let event = &self.timeline.events()[id];
                if Self::is_match(event, target, syscall) {
                    return Ok(Some(event.clone()));
                }
            }

            // Busy tracees must not keep us past the deadline
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    return Err(TracerError::Timeout);
                }
            }
        }
    }

    fn is_match(event: &Event, target: Option<&ProcessHandle>, syscall: Option<&str>) -> bool {
        match (target, syscall) {
            (None, _) => true,
            (Some(target), Some(name)) => event.origin == target.origin && event.name() == Some(name),
            (Some(target), None) => {
                event.pid == target.pid && matches!(event.kind, EventKind::Exit { .. })
            }
        }
    }

    fn next_status(&mut self) -> Result<Poll, TracerError> {
        let deadline = self.deadline;
        let mut backoff = Backoff::new(self.initial_backoff, self.max_backoff);
        poll_until(deadline, &mut backoff, || self.poll_once())
    }

    /// One non-blocking round over every traced process
    fn poll_once(&mut self) -> Result<Option<Poll>, TracerError> {
        let mut pids: Vec<Pid> = self.processes.keys().copied().collect();
        if pids.is_empty() {
            return Ok(Some(Poll::Drained));
        }
        // Start after the last serviced process so none is starved
        if let Some(last) = self.last_serviced {
            let split = pids.partition_point(|&pid| pid <= last);
            pids.rotate_left(split);
        }

        for pid in pids {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => continue,
                Ok(status) => {
                    self.last_serviced = Some(pid);
                    return Ok(Some(Poll::Status(pid, status)));
                }
                Err(Errno::ECHILD) => {
                    warn!("Traced process {} vanished", pid);
                    self.processes.remove(&pid);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if self.processes.is_empty() {
            return Ok(Some(Poll::Drained));
        }
        Ok(None)
    }

    fn origin_of(&self, pid: Pid) -> Origin {
        self.processes
            .get(&pid)
            .map(|process| process.origin)
            .unwrap_or(Origin::Server)
    }

    fn resume(&self, pid: Pid, signal: Option<Signal>) -> Result<(), TracerError> {
        ignore_gone(ptrace::syscall(pid, signal), pid, "resume")
    }

    fn dispatch(&mut self, pid: Pid, status: WaitStatus) -> Result<Option<EventId>, TracerError> {
        match status {
            WaitStatus::Exited(_, code) => Ok(Some(self.on_exit(pid, code))),
            WaitStatus::Signaled(_, signal, _) => Ok(Some(self.on_exit(pid, 128 + signal as i32))),
            WaitStatus::PtraceEvent(_, _, event) => self.on_ptrace_event(pid, event),
            WaitStatus::PtraceSyscall(_) => self.on_syscall_stop(pid),
            WaitStatus::Stopped(_, signal) => {
                self.on_signal(pid, signal)?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn on_exit(&mut self, pid: Pid, code: i32) -> EventId {
        let origin = self.origin_of(pid);
        self.processes.remove(&pid);
        debug!("[{}] Process exited: {} {}", origin, pid, code);
        let time = self.now();
        self.timeline.record_exit(pid, origin, code, time)
    }

    fn on_ptrace_event(&mut self, pid: Pid, event: i32) -> Result<Option<EventId>, TracerError> {
        let spawned = event == libc::PTRACE_EVENT_FORK
            || event == libc::PTRACE_EVENT_VFORK
            || event == libc::PTRACE_EVENT_CLONE;
        if !spawned {
            self.resume(pid, None)?;
            return Ok(None);
        }

        let child = match ptrace::getevent(pid) {
            Ok(raw) => Pid::from_raw(raw as i32),
            Err(Errno::ESRCH) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let origin = self.origin_of(pid);
        info!("[{}] New process: {}", origin, child);

        let shares_fd_table = self.shares_fd_table(pid);
        self.processes
            .entry(child)
            .or_insert_with(|| TracedProcess::new(origin, true));
        let time = self.now();
        let id = self
            .timeline
            .record_new_process(child, origin, pid, shares_fd_table, time);

        self.resume(pid, None)?;
        Ok(Some(id))
    }

    /// Whether the clone in progress in `parent` passed `CLONE_FILES`
    fn shares_fd_table(&self, parent: Pid) -> bool {
        let Some(entry) = self.processes.get(&parent).and_then(|process| process.pending) else {
            return false;
        };
        let flags = match syscalls::syscall_name(entry.number) {
            "clone" => entry.args[0],
            "clone3" => ProcessMemory(parent)
                .read_bytes(entry.args[0], 8)
                .and_then(|bytes| bytes.try_into().ok())
                .map(u64::from_ne_bytes)
                .unwrap_or(0),
            _ => 0,
        };
        flags & libc::CLONE_FILES as u64 != 0
    }

    fn on_signal(&mut self, pid: Pid, signal: Signal) -> Result<(), TracerError> {
        let origin = self.origin_of(pid);
        if let Some(process) = self.processes.get_mut(&pid) {
            if process.fresh && signal == Signal::SIGSTOP {
                process.fresh = false;
                return self.resume(pid, None);
            }
        }

        debug!("[{}] Signal received: {} {:?}", origin, pid, signal);
        self.resume(pid, Some(signal))
    }

    fn on_syscall_stop(&mut self, pid: Pid) -> Result<Option<EventId>, TracerError> {
        let Some(process) = self.processes.get(&pid) else {
            self.resume(pid, None)?;
            return Ok(None);
        };
        let origin = process.origin;

        if !process.in_syscall {
            let entry = match regs::syscall_entry(pid) {
                Ok(entry) => Some(entry),
                Err(TracerError::Ptrace(Errno::ESRCH)) => return Ok(None),
                Err(e) => return Err(e),
            };
            if let Some(process) = self.processes.get_mut(&pid) {
                process.pending = entry;
                process.in_syscall = true;
            }
            self.resume(pid, None)?;
            return Ok(None);
        }

        let entry = self.processes.get_mut(&pid).and_then(|process| {
            process.in_syscall = false;
            process.pending.take()
        });
        let Some(entry) = entry else {
            self.resume(pid, None)?;
            return Ok(None);
        };

        let result = match regs::syscall_result(pid) {
            Ok(result) => result,
            Err(TracerError::Ptrace(Errno::ESRCH)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let raw = RawSyscall {
            pid,
            origin,
            name: syscalls::syscall_name(entry.number),
            args: entry.args,
            result,
            time: self.now(),
        };
        let id = self.timeline.record_syscall(raw, &ProcessMemory(pid));

        self.resume(pid, None)?;
        Ok(id)
    }

    /// Terminate every process still under trace
    ///
    /// Processes that are already gone are tolerated; any other ptrace
    /// failure is returned after the remaining processes were handled.
    pub fn quit(&mut self) -> Result<(), TracerError> {
        debug!("[{:.3}] Quitting tracer.", self.now());
        let pids = self.traced_pids();
        self.processes.clear();

        let mut first_error = None;
        for pid in pids {
            if let Err(e) = ignore_gone(process::terminate(pid), pid, "terminate") {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Take the collected timeline, terminating anything still traced
    pub fn into_timeline(mut self) -> Timeline {
        std::mem::take(&mut self.timeline)
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if !self.processes.is_empty() {
            if let Err(e) = self.quit() {
                warn!("Failed to terminate traced processes: {}", e);
            }
        }
    }
}
