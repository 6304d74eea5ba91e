//! Child process model
//!
//! A spawned child is either running or in exactly one terminal state. The
//! only transition is Running -> Exited/Signaled, and it is made by whoever
//! reaps the child (see [`crate::notifier`]).

use std::fmt;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use serde::Serialize;

use crate::error::{Error, Result};

/// Exit status of a child that failed before exec (session, controlling
/// terminal, stdio or working directory setup)
pub const EXIT_SETUP_FAILED: i32 = 125;

/// Exit status of a child whose program was found but could not be executed
pub const EXIT_EXEC_FAILED: i32 = 126;

/// Exit status of a child whose program could not be found
pub const EXIT_EXEC_NOT_FOUND: i32 = 127;

/// Lifecycle state of a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildState {
    Running,
    /// Normal exit with an 8-bit status code
    Exited(i32),
    /// Killed by a signal
    Signaled(Signal),
}

impl ChildState {
    /// Terminal state carried by a wait status, if any
    ///
    /// Stops, continues and "still alive" are not transitions.
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ChildState::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ChildState::Signaled(signal)),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChildState::Running)
    }

    /// Apply an observed state; terminal states never change again
    pub fn advance(self, next: ChildState) -> ChildState {
        match self {
            ChildState::Running => next,
            terminal => terminal,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ChildState::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn signal(&self) -> Option<Signal> {
        match self {
            ChildState::Signaled(signal) => Some(*signal),
            _ => None,
        }
    }

    /// Status the way a shell reports it: the exit code, or 128 + signal
    pub fn shell_status(&self) -> Option<i32> {
        match self {
            ChildState::Running => None,
            ChildState::Exited(code) => Some(*code),
            ChildState::Signaled(signal) => Some(128 + *signal as i32),
        }
    }
}

impl fmt::Display for ChildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildState::Running => f.write_str("running"),
            ChildState::Exited(code) => write!(f, "exited({})", code),
            ChildState::Signaled(signal) => write!(f, "signaled({})", signal.as_str()),
        }
    }
}

/// Snapshot of a spawned child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildProcess {
    pid: Pid,
    state: ChildState,
}

impl ChildProcess {
    pub(crate) fn running(pid: Pid) -> Self {
        Self {
            pid,
            state: ChildState::Running,
        }
    }

    pub(crate) fn with_state(pid: Pid, state: ChildState) -> Self {
        Self { pid, state }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ChildState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.exit_code()
    }

    /// True if the child died because its program could not be found or run
    pub fn is_exec_failure(&self) -> bool {
        matches!(
            self.state,
            ChildState::Exited(EXIT_EXEC_FAILED) | ChildState::Exited(EXIT_EXEC_NOT_FOUND)
        )
    }

    /// Send a signal to the child
    ///
    /// Refused once the snapshot is terminal: the pid may already belong to
    /// another process.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::Signal(Errno::ESRCH));
        }
        kill(self.pid, signal).map_err(Error::Signal)
    }

    /// Fail unless the final state is one of `expected`
    pub fn check_termination(&self, expected: &[ChildState]) -> Result<()> {
        if self.state.is_terminal() && expected.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::UnexpectedTermination(self.state))
        }
    }

    /// Fail unless the child exited with status 0
    pub fn check_success(&self) -> Result<()> {
        self.check_termination(&[ChildState::Exited(0)])
    }
}

/// Serializable summary of how a child ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminationReport {
    pub pid: i32,
    pub state: String,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub exec_failure: bool,
}

impl From<&ChildProcess> for TerminationReport {
    fn from(child: &ChildProcess) -> Self {
        Self {
            pid: child.pid().as_raw(),
            state: child.state().to_string(),
            exit_code: child.exit_code(),
            signal: child.state().signal().map(|s| s.as_str().to_string()),
            exec_failure: child.is_exec_failure(),
        }
    }
}
