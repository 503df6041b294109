//! Socket lifecycle correlation
//!
//! The timeline owns the global event log and the socket arena. Raw
//! syscall exits are decoded, attached to the socket they affect and
//! appended in observation order. Sockets are addressed by `(pid, fd)`
//! through the active-socket table while the descriptor is open; closed
//! sockets stay in the arena so earlier events keep resolving to them.

use nix::unistd::Pid;
use std::collections::HashMap;
use tracing::debug;

use crate::decode::{self, SockAddr, MAX_SOCKADDR_LEN};
use crate::event::{Argument, Decoded, Event, EventId, EventKind, Origin, Syscall};
use crate::socket::{Socket, SocketId};
use crate::syscalls;

/// Read access to a traced process's address space
pub trait TraceeMemory {
    fn read_bytes(&self, addr: u64, len: usize) -> Option<Vec<u8>>;

    fn read_int(&self, addr: u64) -> Option<i32> {
        let bytes = self.read_bytes(addr, 4)?;
        Some(i32::from_ne_bytes(bytes.get(..4)?.try_into().ok()?))
    }
}

/// Memory that cannot be read, for processes that are already gone
pub struct NoMemory;

impl TraceeMemory for NoMemory {
    fn read_bytes(&self, _addr: u64, _len: usize) -> Option<Vec<u8>> {
        None
    }
}

/// A syscall exit as seen in the registers, before correlation
#[derive(Debug, Clone)]
pub struct RawSyscall {
    pub pid: Pid,
    pub origin: Origin,
    pub name: &'static str,
    pub args: [u64; 6],
    pub result: i64,
    pub time: f64,
}

#[derive(Debug, Default)]
pub struct Timeline {
    events: Vec<Event>,
    sockets: Vec<Socket>,
    active: HashMap<(Pid, i32), SocketId>,
    /// Threads mapped to the process whose descriptor table they share
    fd_owner: HashMap<Pid, Pid>,
    log_untracked_close: bool,
}

impl Timeline {
    /// Create an empty timeline
    ///
    /// With `log_untracked_close`, `close` calls on descriptors that are not
    /// tracked sockets still enter the event log (without a socket).
    pub fn new(log_untracked_close: bool) -> Self {
        Self {
            log_untracked_close,
            ..Self::default()
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn event(&self, id: EventId) -> Option<&Event> {
        self.events.get(id)
    }

    pub fn sockets(&self) -> &[Socket] {
        &self.sockets
    }

    pub fn socket(&self, id: SocketId) -> Option<&Socket> {
        self.sockets.get(id)
    }

    /// Socket currently registered for a descriptor of a process
    pub fn active_socket(&self, pid: Pid, fd: i32) -> Option<SocketId> {
        self.active.get(&(self.table_of(pid), fd)).copied()
    }

    /// Number of live `(pid, fd)` registrations
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn table_of(&self, pid: Pid) -> Pid {
        self.fd_owner.get(&pid).copied().unwrap_or(pid)
    }

    fn push(&mut self, event: Event) -> EventId {
        let id = self.events.len();
        if let Some(socket) = event.socket() {
            if let Some(socket) = self.sockets.get_mut(socket) {
                socket.events.push(id);
            }
        }
        debug!("{}", event);
        self.events.push(event);
        id
    }

    fn register(&mut self, mut socket: Socket) -> SocketId {
        let id = self.sockets.len();
        socket.table = self.table_of(socket.pid);
        let key = (socket.table, socket.fd);
        debug!("{}", socket);
        if socket.fd >= 0 {
            self.active.insert(key, id);
        }
        self.sockets.push(socket);
        id
    }

    /// Record a new traced process
    ///
    /// A forked child gets its own copy of the parent's descriptor table;
    /// a thread (`shares_fd_table`) resolves descriptors through its parent.
    pub fn record_new_process(
        &mut self,
        pid: Pid,
        origin: Origin,
        parent: Pid,
        shares_fd_table: bool,
        time: f64,
    ) -> EventId {
        let parent_table = self.table_of(parent);
        if shares_fd_table {
            self.fd_owner.insert(pid, parent_table);
        } else {
            let inherited: Vec<(i32, SocketId)> = self
                .active
                .iter()
                .filter(|((owner, _), _)| *owner == parent_table)
                .map(|((_, fd), id)| (*fd, *id))
                .collect();
            for (fd, id) in inherited {
                self.active.insert((pid, fd), id);
            }
        }

        self.push(Event {
            origin,
            pid,
            time,
            kind: EventKind::NewProcess { parent },
        })
    }

    /// Record a process exit; its descriptors stop resolving
    pub fn record_exit(&mut self, pid: Pid, origin: Origin, code: i32, time: f64) -> EventId {
        if self.fd_owner.remove(&pid).is_none() {
            self.active.retain(|(owner, _), _| *owner != pid);
        }

        self.push(Event {
            origin,
            pid,
            time,
            kind: EventKind::Exit { code },
        })
    }

    /// Correlate a syscall exit and append it to the log
    ///
    /// Returns the event id, or `None` when the syscall is not part of the
    /// traced set (or is a `close` of an untracked descriptor).
    pub fn record_syscall(&mut self, raw: RawSyscall, memory: &dyn TraceeMemory) -> Option<EventId> {
        if !syscalls::is_traced(raw.name) {
            return None;
        }

        let mut arguments = decode_arguments(&raw, memory);
        let table = self.table_of(raw.pid);
        let fd = raw.args[0] as i32;
        let mut socket = None;

        match raw.name {
            "socket" => {
                let created = Socket::new(
                    raw.pid,
                    raw.result as i32,
                    raw.args[0] as i32,
                    raw.args[1] as i32,
                    raw.args[2] as i32,
                    raw.time,
                );
                socket = Some(self.register(created));
            }
            "accept" | "accept4" => {
                let (domain, socktype, protocol) = self
                    .active
                    .get(&(table, fd))
                    .and_then(|&id| self.sockets.get(id))
                    .map(|listener| (listener.domain, listener.socktype, listener.protocol))
                    .unwrap_or((libc::AF_UNSPEC, 0, 0));
                let accepted = Socket::new(
                    raw.pid,
                    raw.result as i32,
                    domain,
                    socktype,
                    protocol,
                    raw.time,
                );
                socket = Some(self.register(accepted));
            }
            "close" => {
                socket = if raw.result == 0 {
                    self.active.remove(&(table, fd))
                } else {
                    self.active.get(&(table, fd)).copied()
                };
                if socket.is_none() && !self.log_untracked_close {
                    return None;
                }
            }
            name if syscalls::is_socket_operation(name) => {
                socket = self.active.get(&(table, fd)).copied();
            }
            _ => {}
        }

        if raw.name == "getsockopt"
            && raw.result == 0
            && raw.args[1] as i32 == libc::SOL_SOCKET
            && raw.args[2] as i32 == libc::SO_ERROR
        {
            if let Some(value) = memory.read_int(raw.args[3]) {
                arguments[3].decoded = Some(Decoded::Int(value));
                if let Some(socket) = socket.and_then(|id| self.sockets.get_mut(id)) {
                    socket.status = Some(i64::from(value));
                }
            }
        }

        let inherited = socket
            .and_then(|id| self.sockets.get(id))
            .is_some_and(|owner| owner.table != table);

        Some(self.push(Event {
            origin: raw.origin,
            pid: raw.pid,
            time: raw.time,
            kind: EventKind::Syscall(Syscall {
                name: raw.name,
                arguments,
                result: raw.result,
                socket,
                inherited,
            }),
        }))
    }

    /// Consume the timeline, keeping only the log and the sockets
    pub fn into_parts(self) -> (Vec<Event>, Vec<Socket>) {
        (self.events, self.sockets)
    }
}

fn read_sockaddr(memory: &dyn TraceeMemory, addr: u64, len: u64) -> Option<Decoded> {
    if addr == 0 || len == 0 {
        return None;
    }
    let len = (len as usize).min(MAX_SOCKADDR_LEN);
    let bytes = memory.read_bytes(addr, len)?;
    SockAddr::decode(&bytes).map(Decoded::SockAddr)
}

/// Decode the arguments of a traced syscall
fn decode_arguments(raw: &RawSyscall, memory: &dyn TraceeMemory) -> Vec<Argument> {
    let args = &raw.args;
    let mut out: Vec<Argument> = args
        .iter()
        .take(syscalls::arity(raw.name))
        .map(|&value| Argument::raw(value))
        .collect();

    match raw.name {
        "socket" | "socketpair" => {
            out[0] = Argument::text(args[0], decode::family_text(args[0] as i32));
            out[1] = Argument::text(args[1], decode::socket_type_text(args[1] as i32));
            out[2] = Argument::text(args[2], decode::protocol_text(args[2] as i32));
        }
        "connect" | "bind" => {
            out[1].decoded = read_sockaddr(memory, args[1], args[2]);
        }
        "sendto" => {
            out[4].decoded = read_sockaddr(memory, args[4], args[5]);
        }
        "getsockopt" | "setsockopt" => {
            let level = args[1] as i32;
            out[1] = Argument::text(args[1], decode::level_text(level));
            out[2] = Argument::text(args[2], decode::option_text(level, args[2] as i32));
        }
        "shutdown" => {
            out[1] = Argument::text(args[1], decode::shutdown_text(args[1] as i32));
        }
        _ => {}
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sparse tracee memory keyed by address
    #[derive(Default)]
    struct FakeMemory {
        regions: HashMap<u64, Vec<u8>>,
    }

    impl FakeMemory {
        fn with(mut self, addr: u64, bytes: Vec<u8>) -> Self {
            self.regions.insert(addr, bytes);
            self
        }
    }

    impl TraceeMemory for FakeMemory {
        fn read_bytes(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
            let region = self.regions.get(&addr)?;
            Some(region[..len.min(region.len())].to_vec())
        }
    }

    fn raw(pid: i32, name: &'static str, args: &[u64], result: i64, time: f64) -> RawSyscall {
        let mut full = [0u64; 6];
        full[..args.len()].copy_from_slice(args);
        RawSyscall {
            pid: Pid::from_raw(pid),
            origin: Origin::Client,
            name,
            args: full,
            result,
            time,
        }
    }

    fn inet_socket(timeline: &mut Timeline, pid: i32, fd: i64, time: f64) -> SocketId {
        let id = timeline
            .record_syscall(
                raw(pid, "socket", &[libc::AF_INET as u64, libc::SOCK_STREAM as u64, 0], fd, time),
                &NoMemory,
            )
            .unwrap();
        timeline.events()[id].socket().unwrap()
    }

    #[test]
    fn test_socket_registers_descriptor() {
        let mut timeline = Timeline::new(false);
        let id = inet_socket(&mut timeline, 100, 3, 0.0);

        assert_eq!(timeline.active_socket(Pid::from_raw(100), 3), Some(id));
        assert_eq!(timeline.active_socket(Pid::from_raw(101), 3), None);
        assert_eq!(timeline.socket(id).unwrap().domain, libc::AF_INET);
        assert_eq!(timeline.socket(id).unwrap().events, vec![0]);
    }

    #[test]
    fn test_failed_socket_is_not_registered() {
        let mut timeline = Timeline::new(false);
        let event = timeline
            .record_syscall(
                raw(100, "socket", &[libc::AF_INET6 as u64, 1, 0], -(libc::EAFNOSUPPORT as i64), 0.0),
                &NoMemory,
            )
            .unwrap();
        assert!(timeline.events()[event].socket().is_some());
        assert_eq!(timeline.active_count(), 0);
    }

    #[test]
    fn test_close_does_not_alias_reused_descriptor() {
        let mut timeline = Timeline::new(false);
        let first = inet_socket(&mut timeline, 100, 3, 0.0);

        timeline.record_syscall(raw(100, "close", &[3], 0, 0.1), &NoMemory).unwrap();
        assert_eq!(timeline.active_socket(Pid::from_raw(100), 3), None);

        let second = inet_socket(&mut timeline, 100, 3, 0.2);
        assert_ne!(first, second);
        assert_eq!(timeline.active_socket(Pid::from_raw(100), 3), Some(second));

        // The closed socket keeps its own history
        assert_eq!(timeline.socket(first).unwrap().events, vec![0, 1]);
        assert_eq!(timeline.socket(second).unwrap().events, vec![2]);
    }

    #[test]
    fn test_untracked_close_is_skipped_by_default() {
        let mut timeline = Timeline::new(false);
        assert_eq!(timeline.record_syscall(raw(100, "close", &[7], 0, 0.0), &NoMemory), None);
        assert!(timeline.events().is_empty());
    }

    #[test]
    fn test_untracked_close_logged_when_enabled() {
        let mut timeline = Timeline::new(true);
        let id = timeline.record_syscall(raw(100, "close", &[7], 0, 0.0), &NoMemory).unwrap();
        assert_eq!(timeline.events()[id].name(), Some("close"));
        assert_eq!(timeline.events()[id].socket(), None);
    }

    #[test]
    fn test_untraced_syscall_is_ignored() {
        let mut timeline = Timeline::new(true);
        assert_eq!(timeline.record_syscall(raw(100, "unknown", &[1, 2, 3], 0, 0.0), &NoMemory), None);
    }

    #[test]
    fn test_accept_inherits_listener_attributes() {
        let mut timeline = Timeline::new(false);
        let listener = timeline
            .record_syscall(
                raw(
                    200,
                    "socket",
                    &[libc::AF_INET6 as u64, libc::SOCK_STREAM as u64, libc::IPPROTO_TCP as u64],
                    3,
                    0.0,
                ),
                &NoMemory,
            )
            .and_then(|id| timeline.events()[id].socket())
            .unwrap();
        timeline.record_syscall(raw(200, "listen", &[3, 128], 0, 0.1), &NoMemory);
        let accepted = timeline
            .record_syscall(raw(200, "accept", &[3, 0, 0], 4, 0.2), &NoMemory)
            .and_then(|id| timeline.events()[id].socket())
            .unwrap();

        assert_ne!(listener, accepted);
        let socket = timeline.socket(accepted).unwrap();
        assert_eq!(socket.fd, 4);
        assert_eq!(socket.domain, libc::AF_INET6);
        assert_eq!(socket.protocol, libc::IPPROTO_TCP);
        assert_eq!(timeline.socket(listener).unwrap().events, vec![0, 1]);
    }

    #[test]
    fn test_getsockopt_so_error_reads_tracee_memory() {
        let mut timeline = Timeline::new(false);
        let id = inet_socket(&mut timeline, 100, 3, 0.0);
        let memory = FakeMemory::default().with(0x1000, (libc::ECONNREFUSED).to_ne_bytes().to_vec());

        let event = timeline
            .record_syscall(
                raw(
                    100,
                    "getsockopt",
                    &[3, libc::SOL_SOCKET as u64, libc::SO_ERROR as u64, 0x1000, 0x2000],
                    0,
                    0.3,
                ),
                &memory,
            )
            .unwrap();

        let call = timeline.events()[event].syscall().unwrap();
        assert_eq!(call.arguments[3].pointee(), Some(libc::ECONNREFUSED));
        assert_eq!(call.arguments[1].to_string(), "SOL_SOCKET");
        assert_eq!(call.arguments[2].to_string(), "SO_ERROR");
        assert_eq!(timeline.socket(id).unwrap().status, Some(i64::from(libc::ECONNREFUSED)));
    }

    #[test]
    fn test_connect_decodes_sockaddr() {
        let mut timeline = Timeline::new(false);
        inet_socket(&mut timeline, 100, 3, 0.0);
        let mut addr = (libc::AF_INET as u16).to_ne_bytes().to_vec();
        addr.extend_from_slice(&80u16.to_be_bytes());
        addr.extend_from_slice(&[192, 0, 2, 1]);
        addr.extend_from_slice(&[0; 8]);
        let memory = FakeMemory::default().with(0x5000, addr);

        let event = timeline
            .record_syscall(raw(100, "connect", &[3, 0x5000, 16], 0, 0.1), &memory)
            .unwrap();
        let call = timeline.events()[event].syscall().unwrap();
        assert_eq!(
            call.arguments[1].to_string(),
            "<sockaddr_in sin_family=AF_INET, sin_port=80, sin_addr=192.0.2.1>"
        );
        assert!(call.socket.is_some());
    }

    #[test]
    fn test_forked_child_inherits_sockets() {
        let mut timeline = Timeline::new(false);
        let id = inet_socket(&mut timeline, 100, 3, 0.0);
        timeline.record_new_process(Pid::from_raw(101), Origin::Client, Pid::from_raw(100), false, 0.1);

        assert_eq!(timeline.active_socket(Pid::from_raw(101), 3), Some(id));

        // Closing in the child leaves the parent's descriptor open
        let close = timeline.record_syscall(raw(101, "close", &[3], 0, 0.2), &NoMemory).unwrap();
        assert!(timeline.events()[close].syscall().unwrap().inherited);
        assert_eq!(timeline.active_socket(Pid::from_raw(101), 3), None);
        assert_eq!(timeline.active_socket(Pid::from_raw(100), 3), Some(id));

        let close = timeline.record_syscall(raw(100, "close", &[3], 0, 0.3), &NoMemory).unwrap();
        assert!(!timeline.events()[close].syscall().unwrap().inherited);
        assert_eq!(timeline.socket(id).unwrap().events, vec![0, 2, 3]);
    }

    #[test]
    fn test_thread_shares_descriptor_table() {
        let mut timeline = Timeline::new(false);
        let id = inet_socket(&mut timeline, 100, 3, 0.0);
        timeline.record_new_process(Pid::from_raw(102), Origin::Client, Pid::from_raw(100), true, 0.1);

        assert_eq!(timeline.active_socket(Pid::from_raw(102), 3), Some(id));
        let close = timeline.record_syscall(raw(102, "close", &[3], 0, 0.2), &NoMemory).unwrap();
        assert!(!timeline.events()[close].syscall().unwrap().inherited);
        assert_eq!(timeline.active_socket(Pid::from_raw(100), 3), None);
    }

    #[test]
    fn test_exit_drops_registrations() {
        let mut timeline = Timeline::new(false);
        inet_socket(&mut timeline, 100, 3, 0.0);
        timeline.record_exit(Pid::from_raw(100), Origin::Client, 0, 0.5);
        assert_eq!(timeline.active_count(), 0);
        assert_eq!(timeline.sockets().len(), 1);
    }
}
