//! Error taxonomy for tracing, network setup and scenario runs

use std::fmt;
use thiserror::Error;

use crate::event::Origin;

/// Errors raised by the syscall tracer
#[derive(Error, Debug)]
pub enum TracerError {
    #[error("failed to launch {command}: {reason}")]
    Launch { command: String, reason: String },

    #[error("deadline exceeded while waiting for traced processes")]
    Timeout,

    #[error("ptrace operation failed: {0}")]
    Ptrace(#[from] nix::Error),

    #[error("syscall tracing is not supported on this architecture")]
    Unsupported,
}

/// Errors raised while provisioning network namespaces
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed with {status}")]
    CommandFailed { command: String, status: String },
}

/// Fatal errors that abort a scenario run after cleanup
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("network setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Tracer(#[from] TracerError),
}

/// A recoverable problem recorded in a scenario's error list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioIssue {
    LaunchFailed { script: String },
    ServerTimeout,
    ClientTimeout,
    UnexpectedExitCode { origin: Origin, code: i32 },
    Unexpected(String),
}

impl fmt::Display for ScenarioIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LaunchFailed { script } => write!(f, "Script '{}' not found.", script),
            Self::ServerTimeout => write!(f, "Server timeout occurred."),
            Self::ClientTimeout => write!(f, "Client timeout occurred."),
            Self::UnexpectedExitCode { origin, code } => {
                write!(f, "Unexpected {} exit code {}.", origin, code)
            }
            Self::Unexpected(message) => write!(f, "Unexpected error occurred: {}", message),
        }
    }
}
