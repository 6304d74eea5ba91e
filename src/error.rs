//! Error types for PTY allocation, spawning and termination tracking

use std::io;

use nix::unistd::Pid;
use thiserror::Error;

use crate::child::ChildState;

/// Error type for everything in this crate
///
/// Exec failures never show up here: once the child has replaced its image
/// there is no channel back to the parent, so they are reported through the
/// child's exit status instead (see [`crate::child::EXIT_EXEC_NOT_FOUND`]).
#[derive(Error, Debug)]
pub enum Error {
    /// No PTY could be opened, or the unlock step of the handshake failed
    #[error("Failed to allocate PTY ({step}): {source}")]
    Allocation {
        step: &'static str,
        #[source]
        source: nix::Error,
    },

    /// grantpt() refused to hand the slave device to the current user
    #[error("Failed to grant PTY slave: {0}")]
    Permission(#[source] nix::Error),

    /// The descriptor is not a PTY master, or its slave name is unavailable
    #[error("Failed to resolve PTY slave path: {0}")]
    Lookup(#[source] nix::Error),

    /// The slave exists but was never unlocked
    #[error("PTY slave {path} is locked (unlockpt was not called)")]
    SlaveLocked { path: String },

    /// The slave could not be opened for another reason
    #[error("Failed to open PTY slave {path}: {source}")]
    OpenSlave {
        path: String,
        #[source]
        source: io::Error,
    },

    /// fork() failed; no child process exists
    #[error("Failed to fork: {0}")]
    Fork(#[source] nix::Error),

    /// A completion handler is already registered (or already fired)
    #[error("A completion handler is already registered for child {0}")]
    DuplicateRegistration(Pid),

    /// The notifier does not track this process
    #[error("Child {0} is not tracked by this notifier")]
    UnknownChild(Pid),

    /// A string handed to the spawner cannot cross the exec boundary
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// waitpid() failed for a tracked child
    #[error("Failed to wait for child {pid}: {source}")]
    Wait {
        pid: Pid,
        #[source]
        source: nix::Error,
    },

    /// kill() failed
    #[error("Failed to signal child: {0}")]
    Signal(#[source] nix::Error),

    /// The child ended in a state the caller did not expect
    #[error("Child terminated unexpectedly: {0}")]
    UnexpectedTermination(ChildState),

    /// A control message was missing or malformed
    #[error("Ancillary data error: {0}")]
    Ancillary(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}

/// Result type for PTY operations
pub type Result<T> = std::result::Result<T, Error>;
