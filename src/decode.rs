//! Decoding of socket syscall arguments
//!
//! Turns raw register values and tracee memory into readable text:
//! address families, socket types, protocols, socket options and
//! `sockaddr_*` structures.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

/// Size of the largest sockaddr we decode (`sockaddr_un`)
pub const MAX_SOCKADDR_LEN: usize = 110;

/// Name of an address family constant
pub fn family_name(family: i32) -> Option<&'static str> {
    match family {
        libc::AF_UNSPEC => Some("AF_UNSPEC"),
        libc::AF_UNIX => Some("AF_UNIX"),
        libc::AF_INET => Some("AF_INET"),
        libc::AF_INET6 => Some("AF_INET6"),
        libc::AF_NETLINK => Some("AF_NETLINK"),
        libc::AF_PACKET => Some("AF_PACKET"),
        _ => None,
    }
}

/// Address family text, falling back to the number
pub fn family_text(family: i32) -> String {
    family_name(family)
        .map(str::to_string)
        .unwrap_or_else(|| family.to_string())
}

/// Socket type including the `SOCK_NONBLOCK`/`SOCK_CLOEXEC` creation flags
pub fn socket_type_text(value: i32) -> String {
    let flags = libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    let base = match value & !flags {
        libc::SOCK_STREAM => "SOCK_STREAM".to_string(),
        libc::SOCK_DGRAM => "SOCK_DGRAM".to_string(),
        libc::SOCK_RAW => "SOCK_RAW".to_string(),
        libc::SOCK_SEQPACKET => "SOCK_SEQPACKET".to_string(),
        other => other.to_string(),
    };

    let mut parts = vec![base];
    if value & libc::SOCK_NONBLOCK != 0 {
        parts.push("SOCK_NONBLOCK".to_string());
    }
    if value & libc::SOCK_CLOEXEC != 0 {
        parts.push("SOCK_CLOEXEC".to_string());
    }
    parts.join("|")
}

/// Protocol text for an IP socket
pub fn protocol_text(protocol: i32) -> String {
    match protocol {
        libc::IPPROTO_IP => "IPPROTO_IP".to_string(),
        libc::IPPROTO_ICMP => "IPPROTO_ICMP".to_string(),
        libc::IPPROTO_TCP => "IPPROTO_TCP".to_string(),
        libc::IPPROTO_UDP => "IPPROTO_UDP".to_string(),
        libc::IPPROTO_IPV6 => "IPPROTO_IPV6".to_string(),
        libc::IPPROTO_ICMPV6 => "IPPROTO_ICMPV6".to_string(),
        libc::IPPROTO_SCTP => "IPPROTO_SCTP".to_string(),
        other => other.to_string(),
    }
}

/// Socket option level text
pub fn level_text(level: i32) -> String {
    match level {
        libc::SOL_SOCKET => "SOL_SOCKET".to_string(),
        other => protocol_text(other),
    }
}

/// Socket option name text, interpreted relative to its level
pub fn option_text(level: i32, name: i32) -> String {
    let known = match (level, name) {
        (libc::SOL_SOCKET, libc::SO_ERROR) => Some("SO_ERROR"),
        (libc::SOL_SOCKET, libc::SO_TYPE) => Some("SO_TYPE"),
        (libc::SOL_SOCKET, libc::SO_REUSEADDR) => Some("SO_REUSEADDR"),
        (libc::SOL_SOCKET, libc::SO_REUSEPORT) => Some("SO_REUSEPORT"),
        (libc::SOL_SOCKET, libc::SO_KEEPALIVE) => Some("SO_KEEPALIVE"),
        (libc::SOL_SOCKET, libc::SO_SNDBUF) => Some("SO_SNDBUF"),
        (libc::SOL_SOCKET, libc::SO_RCVBUF) => Some("SO_RCVBUF"),
        (libc::IPPROTO_IPV6, libc::IPV6_V6ONLY) => Some("IPV6_V6ONLY"),
        (libc::IPPROTO_TCP, libc::TCP_NODELAY) => Some("TCP_NODELAY"),
        _ => None,
    };
    known.map(str::to_string).unwrap_or_else(|| name.to_string())
}

/// `shutdown` direction text
pub fn shutdown_text(how: i32) -> String {
    match how {
        libc::SHUT_RD => "SHUT_RD".to_string(),
        libc::SHUT_WR => "SHUT_WR".to_string(),
        libc::SHUT_RDWR => "SHUT_RDWR".to_string(),
        other => other.to_string(),
    }
}

/// Syscall result text, with the errno name for error returns
pub fn result_text(result: i64) -> String {
    if (-4095..0).contains(&result) {
        let errno = nix::errno::Errno::from_raw(-result as i32);
        format!("{} ({:?})", result, errno)
    } else {
        result.to_string()
    }
}

/// A socket address decoded from tracee memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockAddr {
    Inet(SocketAddrV4),
    Inet6(SocketAddrV6),
    Unix(String),
    Other(i32),
}

impl SockAddr {
    /// Decode a `struct sockaddr` from its raw bytes
    ///
    /// Returns `None` when the buffer is too short for the family it names.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let family = i32::from(u16::from_ne_bytes([*bytes.first()?, *bytes.get(1)?]));

        match family {
            libc::AF_INET => {
                let raw = bytes.get(..8)?;
                let port = u16::from_be_bytes([raw[2], raw[3]]);
                let addr = Ipv4Addr::new(raw[4], raw[5], raw[6], raw[7]);
                Some(Self::Inet(SocketAddrV4::new(addr, port)))
            }
            libc::AF_INET6 => {
                let raw = bytes.get(..24)?;
                let port = u16::from_be_bytes([raw[2], raw[3]]);
                let flowinfo = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw[8..24]);
                let scope_id = bytes
                    .get(24..28)
                    .map(|s| u32::from_ne_bytes([s[0], s[1], s[2], s[3]]))
                    .unwrap_or(0);
                Some(Self::Inet6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flowinfo,
                    scope_id,
                )))
            }
            libc::AF_UNIX => {
                let path = &bytes[2..];
                let text = match path.first() {
                    // Abstract namespace: leading NUL, name runs to the end
                    Some(0) => format!("@{}", String::from_utf8_lossy(&path[1..])),
                    _ => {
                        let end = path.iter().position(|&b| b == 0).unwrap_or(path.len());
                        String::from_utf8_lossy(&path[..end]).to_string()
                    }
                };
                Some(Self::Unix(text))
            }
            other => Some(Self::Other(other)),
        }
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(
                f,
                "<sockaddr_in sin_family=AF_INET, sin_port={}, sin_addr={}>",
                addr.port(),
                addr.ip()
            ),
            Self::Inet6(addr) => write!(
                f,
                "<sockaddr_in6 sin6_family=AF_INET6, sin6_port={}, sin6_flowinfo={}, sin6_addr={}, sin6_scope_id={}>",
                addr.port(),
                addr.flowinfo(),
                addr.ip(),
                addr.scope_id()
            ),
            Self::Unix(path) => write!(f, "<sockaddr_un sun_family=AF_UNIX, sun_path=\"{}\">", path),
            Self::Other(family) => write!(f, "<sockaddr sa_family={}>", family_text(*family)),
        }
    }
}
