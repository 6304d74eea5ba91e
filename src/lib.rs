//! ptyspawn - child processes on pseudo-terminals
//!
//! This crate allocates PTYs, spawns programs with a PTY slave as their
//! controlling terminal and reports how they terminate.
//!
//! Key features:
//! - PTY allocation with an explicit open/grant/unlock handshake
//! - Spawning with an exact argv/envp and `PATH` resolution, safe to call
//!   from multi-threaded programs
//! - `SIGCHLD` driven termination notification with exactly-once handlers
//! - Passing a PTY master to another process over a Unix domain socket
//!
//! ```no_run
//! use ptyspawn::{open_pty, Notifier, NotifierMode, SpawnRequest};
//!
//! # fn main() -> ptyspawn::Result<()> {
//! let pty = open_pty()?;
//! let notifier = Notifier::new(NotifierMode::Listener)?;
//! let request = SpawnRequest::new("ls", pty.slave_path().clone())?
//!     .arg("-l")?
//!     .env("TERM", "xterm-256color")?;
//! let child = notifier.spawn(&request)?;
//! notifier.register_callback(child.pid(), |child| {
//!     println!("{} ended: {}", child.pid(), child.state());
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! Reference: https://www.man7.org/linux/man-pages/man3/posix_openpt.3.html

pub mod ancillary;
pub mod child;
pub mod config;
mod error;
pub mod notifier;
pub mod pty;
mod size;
pub mod spawn;

pub use ancillary::{recv_fd, send_fd};
pub use child::{ChildProcess, ChildState, TerminationReport};
pub use error::{Error, Result};
pub use notifier::{Notifier, NotifierMode};
pub use pty::{open_pty, PtyMaster, PtyPair, SlavePath};
pub use size::WindowSize;
pub use spawn::{spawn, PathSearch, SpawnRequest};
