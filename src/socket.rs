//! Per-descriptor socket state

use nix::unistd::Pid;
use std::fmt;

use crate::decode;
use crate::event::EventId;

/// Index of a socket in the timeline's socket arena
pub type SocketId = usize;

/// A socket observed in one traced process
///
/// The descriptor is only meaningful within `pid`. Connection bookkeeping
/// is filled in while a scenario walks the event log.
#[derive(Debug, Clone, PartialEq)]
pub struct Socket {
    pub pid: Pid,
    /// Process whose descriptor table holds `fd`
    pub table: Pid,
    pub fd: i32,
    pub domain: i32,
    pub socktype: i32,
    pub protocol: i32,
    /// Seconds since the tracer started
    pub created: f64,
    /// Events that affected this socket, in observation order
    pub events: Vec<EventId>,
    /// Time of the connect attempt
    pub attempted: Option<f64>,
    /// Last observed connect result or `SO_ERROR` value
    pub status: Option<i64>,
    pub nonblocking: bool,
    pub shutdown: bool,
    /// Time of the successful close
    pub closed: Option<f64>,
}

impl Socket {
    pub fn new(pid: Pid, fd: i32, domain: i32, socktype: i32, protocol: i32, created: f64) -> Self {
        Self {
            pid,
            table: pid,
            fd,
            domain,
            socktype,
            protocol,
            created,
            events: Vec::new(),
            attempted: None,
            status: None,
            nonblocking: false,
            shutdown: false,
            closed: None,
        }
    }

    pub fn is_inet(&self) -> bool {
        self.domain == libc::AF_INET || self.domain == libc::AF_INET6
    }

    /// Reset connection bookkeeping for a fresh connect attempt
    pub fn begin_connect(&mut self, time: f64, result: i64) {
        self.attempted = Some(time);
        self.status = Some(result);
        self.nonblocking = result == -i64::from(libc::EINPROGRESS);
        self.shutdown = false;
        self.closed = None;
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Socket({}/{}/{}/{})",
            self.fd,
            decode::family_text(self.domain),
            decode::socket_type_text(self.socktype),
            decode::protocol_text(self.protocol)
        )
    }
}
