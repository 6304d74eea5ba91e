//! Termination notification for spawned children
//!
//! A [`Notifier`] tracks children by pid and records the single transition
//! from `Running` to a terminal state. Status is collected with
//! `waitpid(pid, WNOHANG)` for tracked pids only, so children the host
//! spawned by other means are never reaped here.
//!
//! In [`NotifierMode::Listener`] a dedicated thread wakes on `SIGCHLD` and
//! reaps; in [`NotifierMode::Manual`] the caller drives reaping with
//! [`Notifier::poll`] from their own event loop.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use signal_hook::consts::signal::SIGCHLD;
use signal_hook::iterator::{Handle, Signals};
use tracing::{debug, trace, warn};

use crate::child::{ChildProcess, ChildState};
use crate::error::{Error, Result};
use crate::spawn::{spawn, SpawnRequest};

/// Completion handler; runs once with the final snapshot of the child
pub type CompletionHandler = Box<dyn FnOnce(ChildProcess) + Send + 'static>;

/// How reaping is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierMode {
    /// A background thread reaps on every `SIGCHLD`
    Listener,
    /// The caller reaps through [`Notifier::poll`] or [`Notifier::wait`]
    Manual,
}

struct Entry {
    state: ChildState,
    handler: Option<CompletionHandler>,
    registered: bool,
    /// The status was collected by someone else and is lost
    lost: bool,
}

impl Entry {
    fn new(state: ChildState) -> Self {
        Self {
            state,
            handler: None,
            registered: false,
            lost: false,
        }
    }
}

type Fired = Vec<(CompletionHandler, ChildProcess)>;

#[derive(Default)]
struct Registry {
    children: Mutex<HashMap<Pid, Entry>>,
    changed: Condvar,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<Pid, Entry>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a terminal state; returns the handler to run, if any
    fn settle(pid: Pid, entry: &mut Entry, state: ChildState) -> Option<(CompletionHandler, ChildProcess)> {
        if entry.state.is_terminal() {
            return None;
        }
        entry.state = entry.state.advance(state);
        debug!(pid = pid.as_raw(), state = %entry.state, "child terminated");
        let child = ChildProcess::with_state(pid, entry.state);
        entry.handler.take().map(|handler| (handler, child))
    }

    /// Non-blocking reap of one entry; returns true on a transition
    fn try_reap(pid: Pid, entry: &mut Entry, fired: &mut Fired) -> bool {
        if entry.state.is_terminal() || entry.lost {
            return false;
        }

        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => {
                    trace!(pid = pid.as_raw(), ?status, "wait status");
                    return match ChildState::from_wait_status(status) {
                        Some(state) => {
                            fired.extend(Self::settle(pid, entry, state));
                            true
                        }
                        None => false,
                    };
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    warn!(pid = pid.as_raw(), "child was reaped outside the notifier");
                    entry.lost = true;
                    return false;
                }
                Err(err) => {
                    warn!(pid = pid.as_raw(), error = %err, "waitpid failed");
                    return false;
                }
            }
        }
    }

    /// Run handlers outside the lock and wake waiters
    fn finish(&self, fired: Fired, transitions: usize) {
        if transitions > 0 {
            self.changed.notify_all();
        }
        for (handler, child) in fired {
            // A panicking handler must not take the listener thread with it
            if panic::catch_unwind(AssertUnwindSafe(|| handler(child))).is_err() {
                warn!(pid = child.pid().as_raw(), "completion handler panicked");
            }
        }
    }

    fn reap(&self, pid: Pid) {
        let mut fired = Vec::new();
        let transitions = {
            let mut children = self.lock();
            match children.get_mut(&pid) {
                Some(entry) => Self::try_reap(pid, entry, &mut fired) as usize,
                None => 0,
            }
        };
        self.finish(fired, transitions);
    }

    fn reap_all(&self) -> usize {
        let mut fired = Vec::new();
        let transitions = {
            let mut children = self.lock();
            let mut transitions = 0;
            for (pid, entry) in children.iter_mut() {
                if Self::try_reap(*pid, entry, &mut fired) {
                    transitions += 1;
                }
            }
            transitions
        };
        self.finish(fired, transitions);
        transitions
    }

    /// Apply a status obtained by a blocking wait
    fn complete(&self, pid: Pid, state: ChildState) -> Result<ChildProcess> {
        let (fired, child) = {
            let mut children = self.lock();
            let entry = children.get_mut(&pid).ok_or(Error::UnknownChild(pid))?;
            let fired = Self::settle(pid, entry, state);
            (fired, ChildProcess::with_state(pid, entry.state))
        };
        self.finish(fired.into_iter().collect(), 1);
        Ok(child)
    }
}

struct Listener {
    handle: Handle,
    thread: thread::JoinHandle<()>,
}

impl Listener {
    fn start(registry: Arc<Registry>) -> Result<Self> {
        let mut signals = Signals::new([SIGCHLD])?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("ptyspawn-sigchld".to_string())
            .spawn(move || {
                for _ in signals.forever() {
                    let transitions = registry.reap_all();
                    trace!(transitions, "SIGCHLD handled");
                }
            })?;
        Ok(Self { handle, thread })
    }

    fn stop(self) {
        self.handle.close();
        let _ = self.thread.join();
    }
}

/// Tracks children and delivers their termination exactly once
pub struct Notifier {
    registry: Arc<Registry>,
    mode: NotifierMode,
    listener: Option<Listener>,
}

impl Notifier {
    /// Create a notifier; in listener mode this installs the `SIGCHLD`
    /// handler and starts the reaping thread
    pub fn new(mode: NotifierMode) -> Result<Self> {
        let registry = Arc::new(Registry::default());
        let listener = match mode {
            NotifierMode::Listener => Some(Listener::start(Arc::clone(&registry))?),
            NotifierMode::Manual => None,
        };
        debug!(?mode, "notifier started");
        Ok(Self {
            registry,
            mode,
            listener,
        })
    }

    pub fn mode(&self) -> NotifierMode {
        self.mode
    }

    /// Spawn a child and start tracking it
    pub fn spawn(&self, request: &SpawnRequest) -> Result<ChildProcess> {
        let child = spawn(request)?;
        self.track(child)?;
        Ok(child)
    }

    /// Track a child started with [`crate::spawn::spawn`]
    ///
    /// Tries a non-blocking reap right away, so a child that exited before
    /// it was tracked is still observed. A terminal entry for the same pid
    /// belongs to an earlier, already reaped process and is replaced.
    pub fn track(&self, child: ChildProcess) -> Result<()> {
        let pid = child.pid();
        {
            let mut children = self.registry.lock();
            if let Some(entry) = children.get(&pid) {
                if !entry.state.is_terminal() && !entry.lost {
                    return Err(Error::InvalidArgument(format!(
                        "child {} is already tracked",
                        pid
                    )));
                }
                debug!(pid = pid.as_raw(), "pid reused, replacing stale entry");
            }
            children.insert(pid, Entry::new(child.state()));
        }
        trace!(pid = pid.as_raw(), "tracking child");
        self.registry.reap(pid);
        Ok(())
    }

    /// Register the completion handler for `pid`
    ///
    /// Only one handler may ever be registered per child. If the child has
    /// already terminated the handler runs immediately on this thread.
    pub fn register_callback<F>(&self, pid: Pid, handler: F) -> Result<()>
    where
        F: FnOnce(ChildProcess) + Send + 'static,
    {
        let mut children = self.registry.lock();
        let entry = children.get_mut(&pid).ok_or(Error::UnknownChild(pid))?;
        if entry.registered {
            return Err(Error::DuplicateRegistration(pid));
        }
        entry.registered = true;

        if entry.state.is_terminal() {
            let child = ChildProcess::with_state(pid, entry.state);
            drop(children);
            handler(child);
        } else {
            entry.handler = Some(Box::new(handler));
        }
        Ok(())
    }

    /// Drop a pending handler; returns whether one was pending
    ///
    /// The child keeps being reaped. A new handler may be registered
    /// afterwards.
    pub fn unregister_callback(&self, pid: Pid) -> Result<bool> {
        let mut children = self.registry.lock();
        let entry = children.get_mut(&pid).ok_or(Error::UnknownChild(pid))?;
        let pending = entry.handler.take().is_some();
        if pending {
            entry.registered = false;
        }
        Ok(pending)
    }

    /// Current snapshot, without blocking
    pub fn state(&self, pid: Pid) -> Result<ChildProcess> {
        let children = self.registry.lock();
        let entry = children.get(&pid).ok_or(Error::UnknownChild(pid))?;
        Ok(ChildProcess::with_state(pid, entry.state))
    }

    /// Snapshots of every tracked child
    pub fn children(&self) -> Vec<ChildProcess> {
        self.registry
            .lock()
            .iter()
            .map(|(pid, entry)| ChildProcess::with_state(*pid, entry.state))
            .collect()
    }

    /// Block until `pid` has terminated
    pub fn wait(&self, pid: Pid) -> Result<ChildProcess> {
        match self.mode {
            NotifierMode::Listener => self.wait_listener(pid),
            NotifierMode::Manual => self.wait_manual(pid),
        }
    }

    fn wait_listener(&self, pid: Pid) -> Result<ChildProcess> {
        let mut children = self.registry.lock();
        loop {
            let entry = children.get(&pid).ok_or(Error::UnknownChild(pid))?;
            if entry.state.is_terminal() {
                return Ok(ChildProcess::with_state(pid, entry.state));
            }
            if entry.lost {
                return Err(Error::Wait {
                    pid,
                    source: Errno::ECHILD,
                });
            }
            children = self
                .registry
                .changed
                .wait(children)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wait_manual(&self, pid: Pid) -> Result<ChildProcess> {
        let current = self.state(pid)?;
        if !current.is_running() {
            return Ok(current);
        }

        loop {
            match waitpid(pid, None) {
                Ok(status) => {
                    if let Some(state) = ChildState::from_wait_status(status) {
                        return self.registry.complete(pid, state);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    // A concurrent poll() may have collected it first
                    let current = self.state(pid)?;
                    if !current.is_running() {
                        return Ok(current);
                    }
                    return Err(Error::Wait { pid, source });
                }
            }
        }
    }

    /// Non-blocking reap of every tracked child; returns how many terminated
    pub fn poll(&self) -> usize {
        self.registry.reap_all()
    }

    /// Stop tracking a terminated child and return its final snapshot
    pub fn forget(&self, pid: Pid) -> Result<ChildProcess> {
        let mut children = self.registry.lock();
        let entry = children.get(&pid).ok_or(Error::UnknownChild(pid))?;
        if !entry.state.is_terminal() {
            return Err(Error::InvalidArgument(format!(
                "child {} is still running",
                pid
            )));
        }
        let state = entry.state;
        children.remove(&pid);
        Ok(ChildProcess::with_state(pid, state))
    }

    /// Stop tracking every terminated child; returns their final snapshots
    pub fn prune(&self) -> Vec<ChildProcess> {
        let mut children = self.registry.lock();
        let done: Vec<Pid> = children
            .iter()
            .filter(|(_, entry)| entry.state.is_terminal() || entry.lost)
            .map(|(pid, _)| *pid)
            .collect();
        done.into_iter()
            .filter_map(|pid| {
                children
                    .remove(&pid)
                    .map(|entry| ChildProcess::with_state(pid, entry.state))
            })
            .collect()
    }
}

impl Drop for Notifier {
    /// Stops the listener; children still running are reaped by a detached
    /// thread so none of them is left a zombie
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop();
        }

        let running: Vec<Pid> = self
            .registry
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.state.is_terminal() && !entry.lost)
            .map(|(pid, _)| *pid)
            .collect();
        if running.is_empty() {
            return;
        }

        debug!(count = running.len(), "handing running children to a reaper");
        let reaper = thread::Builder::new()
            .name("ptyspawn-reaper".to_string())
            .spawn(move || {
                for pid in running {
                    loop {
                        match waitpid(pid, None) {
                            Ok(status) if ChildState::from_wait_status(status).is_some() => break,
                            Ok(_) | Err(Errno::EINTR) => continue,
                            Err(_) => break,
                        }
                    }
                    trace!(pid = pid.as_raw(), "reaped after notifier drop");
                }
            });
        if let Err(e) = reaper {
            warn!(error = %e, "failed to start reaper thread");
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("mode", &self.mode)
            .field("tracked", &self.registry.lock().len())
            .finish()
    }
}
