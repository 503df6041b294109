//! sockprobe - client/server networking behaviour tester
//!
//! Runs the server and client of a test case under ptrace inside network
//! namespaces, reconstructs their socket timeline from the observed
//! syscalls and derives dual-stack behaviour properties from it.

pub mod cli;
pub mod config;
pub mod decode;
pub mod error;
pub mod event;
pub mod netns;
pub mod process;
pub mod property;
pub mod regs;
pub mod report;
pub mod scenario;
pub mod socket;
pub mod syscalls;
pub mod testcase;
pub mod timeline;
pub mod tracer;
