//! Timestamped records of observed syscalls and process lifecycle changes

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::decode::{self, SockAddr};
use crate::socket::SocketId;

/// Role of a traced process tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Server,
    Client,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index of an event in the timeline
pub type EventId = usize;

/// Decoded form of a syscall argument
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Symbolic constant or flag set
    Text(String),
    /// Socket address read from tracee memory
    SockAddr(SockAddr),
    /// Integer read through a pointer argument
    Int(i32),
}

/// One syscall argument: the raw register value plus an optional decoded form
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub value: u64,
    pub decoded: Option<Decoded>,
}

impl Argument {
    pub fn raw(value: u64) -> Self {
        Self { value, decoded: None }
    }

    pub fn text(value: u64, text: impl Into<String>) -> Self {
        Self {
            value,
            decoded: Some(Decoded::Text(text.into())),
        }
    }

    /// Register value interpreted as a C `int`
    pub fn as_int(&self) -> i32 {
        self.value as i32
    }

    pub fn sockaddr(&self) -> Option<&SockAddr> {
        match &self.decoded {
            Some(Decoded::SockAddr(addr)) => Some(addr),
            _ => None,
        }
    }

    /// Integer read through this pointer argument, if it was decoded
    pub fn pointee(&self) -> Option<i32> {
        match self.decoded {
            Some(Decoded::Int(value)) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.decoded {
            Some(Decoded::Text(text)) => f.write_str(text),
            Some(Decoded::SockAddr(addr)) => write!(f, "{}", addr),
            Some(Decoded::Int(value)) => write!(f, "[{}]", value),
            None if self.value < 0x1000 => write!(f, "{}", self.value as i64),
            None => write!(f, "{:#x}", self.value),
        }
    }
}

/// A completed syscall
#[derive(Debug, Clone, PartialEq)]
pub struct Syscall {
    pub name: &'static str,
    pub arguments: Vec<Argument>,
    /// Return value; negative values are `-errno`
    pub result: i64,
    /// Socket this syscall affected, if it is tracked
    pub socket: Option<SocketId>,
    /// The descriptor was inherited across a fork rather than owned
    pub inherited: bool,
}

impl Syscall {
    pub fn argument(&self, index: usize) -> Option<&Argument> {
        self.arguments.get(index)
    }

    /// First argument interpreted as a file descriptor
    pub fn fd(&self) -> Option<i32> {
        self.argument(0).map(Argument::as_int)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Syscall(Syscall),
    NewProcess { parent: Pid },
    Exit { code: i32 },
}

/// Immutable record of one observation
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub origin: Origin,
    pub pid: Pid,
    /// Seconds since the tracer started
    pub time: f64,
    pub kind: EventKind,
}

impl Event {
    pub fn syscall(&self) -> Option<&Syscall> {
        match &self.kind {
            EventKind::Syscall(call) => Some(call),
            _ => None,
        }
    }

    /// Syscall name, if this is a syscall event
    pub fn name(&self) -> Option<&'static str> {
        self.syscall().map(|call| call.name)
    }

    pub fn socket(&self) -> Option<SocketId> {
        self.syscall().and_then(|call| call.socket)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:.3} {} {}] ", self.time, self.origin, self.pid)?;
        match &self.kind {
            EventKind::Syscall(call) => {
                let args: Vec<String> = call.arguments.iter().map(ToString::to_string).collect();
                write!(
                    f,
                    "{}({}) = {}",
                    call.name,
                    args.join(", "),
                    decode::result_text(call.result)
                )
            }
            EventKind::NewProcess { parent } => write!(f, "new process (parent {})", parent),
            EventKind::Exit { code } => write!(f, "exited with code {}", code),
        }
    }
}
