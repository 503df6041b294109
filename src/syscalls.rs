//! Syscall number to name mapping and the traced syscall sets
//!
//! Only the syscalls that matter for socket lifecycle and process lifecycle
//! are named; everything else resolves to "unknown" and is stepped over.

/// Socket operations that act on an already existing socket descriptor
pub const SOCKET_OPERATIONS: &[&str] = &[
    "bind",
    "listen",
    "accept",
    "accept4",
    "connect",
    "getsockopt",
    "shutdown",
    "close",
];

/// Every syscall of the socket family
pub const SOCKET_SYSCALLS: &[&str] = &[
    "socket",
    "socketpair",
    "bind",
    "listen",
    "accept",
    "accept4",
    "connect",
    "getsockname",
    "getpeername",
    "sendto",
    "recvfrom",
    "sendmsg",
    "recvmsg",
    "setsockopt",
    "getsockopt",
    "shutdown",
];

/// Process lifecycle syscalls recorded in the timeline
pub const PROCESS_SYSCALLS: &[&str] = &["close", "execve", "fork", "vfork", "clone", "clone3"];

/// Resolve syscall number to name for the host architecture
///
/// Returns the syscall name, or "unknown" for syscalls outside the traced sets
pub fn syscall_name(num: i64) -> &'static str {
    match num {
        libc::SYS_socket => "socket",
        libc::SYS_socketpair => "socketpair",
        libc::SYS_bind => "bind",
        libc::SYS_listen => "listen",
        libc::SYS_accept => "accept",
        libc::SYS_accept4 => "accept4",
        libc::SYS_connect => "connect",
        libc::SYS_getsockname => "getsockname",
        libc::SYS_getpeername => "getpeername",
        libc::SYS_sendto => "sendto",
        libc::SYS_recvfrom => "recvfrom",
        libc::SYS_sendmsg => "sendmsg",
        libc::SYS_recvmsg => "recvmsg",
        libc::SYS_setsockopt => "setsockopt",
        libc::SYS_getsockopt => "getsockopt",
        libc::SYS_shutdown => "shutdown",
        libc::SYS_close => "close",
        libc::SYS_execve => "execve",
        libc::SYS_clone => "clone",
        libc::SYS_clone3 => "clone3",
        #[cfg(target_arch = "x86_64")]
        libc::SYS_fork => "fork",
        #[cfg(target_arch = "x86_64")]
        libc::SYS_vfork => "vfork",
        _ => "unknown",
    }
}

/// Whether a syscall is appended to the global event timeline
pub fn is_traced(name: &str) -> bool {
    SOCKET_SYSCALLS.contains(&name) || PROCESS_SYSCALLS.contains(&name)
}

/// Whether a syscall operates on an existing socket descriptor (first argument)
pub fn is_socket_operation(name: &str) -> bool {
    SOCKET_OPERATIONS.contains(&name)
}

/// Number of meaningful arguments for display and decoding
pub fn arity(name: &str) -> usize {
    match name {
        "fork" | "vfork" => 0,
        "close" => 1,
        "listen" | "shutdown" | "clone3" => 2,
        "socket" | "bind" | "connect" | "accept" | "getsockname" | "getpeername" | "sendmsg"
        | "recvmsg" | "execve" => 3,
        "accept4" | "socketpair" => 4,
        "getsockopt" | "setsockopt" | "clone" => 5,
        "sendto" | "recvfrom" => 6,
        _ => 3,
    }
}
