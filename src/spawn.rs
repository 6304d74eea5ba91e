//! Spawning a child on a PTY slave
//!
//! The child gets a new session with the slave as controlling terminal and
//! as stdin/stdout/stderr, then replaces its image using exactly the argument
//! and environment vectors of the request. Everything that allocates is done
//! before fork(); between fork() and exec the child only makes raw,
//! async-signal-safe system calls, so spawning is safe from multi-threaded
//! hosts.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString, OsStr};
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::ptr;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::{fork, ForkResult};
use tracing::debug;

use crate::child::{ChildProcess, EXIT_EXEC_FAILED, EXIT_EXEC_NOT_FOUND, EXIT_SETUP_FAILED};
use crate::error::{Error, Result};
use crate::pty::{set_window_size, SlavePath};
use crate::size::WindowSize;

/// Search path used when the default `PATH` variable is unset
#[cfg(not(target_os = "linux"))]
const DEFAULT_PATH: &str = "/usr/bin:/bin";

/// How a program name without a `/` is resolved
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PathSearch {
    /// Search the spawning process's `PATH`, like `execvpe(3)`
    #[default]
    Inherit,
    /// Search these directories in order; an empty entry means the child's
    /// working directory
    Custom(Vec<PathBuf>),
    /// Execute the program path literally
    Disabled,
}

/// Everything needed to start a program on a PTY
///
/// The environment is exactly what is set here: nothing is inherited from
/// the spawning process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    program: CString,
    args: Vec<CString>,
    env: BTreeMap<Vec<u8>, CString>,
    controlling_tty: SlavePath,
    cwd: Option<CString>,
    window_size: Option<WindowSize>,
    path_search: PathSearch,
    /// Child descriptor to the parent descriptor it is a copy of
    inherited_fds: BTreeMap<RawFd, RawFd>,
}

fn to_cstring(value: &[u8], what: &str) -> Result<CString> {
    CString::new(value).map_err(|_| Error::InvalidArgument(format!("{} contains a NUL byte", what)))
}

impl SpawnRequest {
    /// Start a request for `program`, with `argv = [program]` and an empty
    /// environment
    pub fn new<S: AsRef<OsStr>>(program: S, controlling_tty: SlavePath) -> Result<Self> {
        let program = to_cstring(program.as_ref().as_bytes(), "program")?;
        Ok(Self {
            args: vec![program.clone()],
            program,
            env: BTreeMap::new(),
            controlling_tty,
            cwd: None,
            window_size: None,
            path_search: PathSearch::default(),
            inherited_fds: BTreeMap::new(),
        })
    }

    /// Replace argv[0]
    pub fn arg0<S: AsRef<OsStr>>(mut self, arg0: S) -> Result<Self> {
        self.args[0] = to_cstring(arg0.as_ref().as_bytes(), "argv[0]")?;
        Ok(self)
    }

    /// Add an argument
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Result<Self> {
        self.args.push(to_cstring(arg.as_ref().as_bytes(), "argument")?);
        Ok(self)
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg)?;
        }
        Ok(self)
    }

    /// Set an environment variable, replacing an earlier value for the same name
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Result<Self> {
        let key = key.as_ref().as_bytes();
        if key.is_empty() || key.contains(&b'=') {
            return Err(Error::InvalidArgument(format!(
                "invalid environment variable name {:?}",
                String::from_utf8_lossy(key)
            )));
        }

        let mut var = key.to_vec();
        var.push(b'=');
        var.extend_from_slice(value.as_ref().as_bytes());
        let var = to_cstring(&var, "environment variable")?;
        self.env.insert(key.to_vec(), var);
        Ok(self)
    }

    /// Set multiple environment variables
    pub fn envs<I, K, V>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, value) in vars {
            self = self.env(key, value)?;
        }
        Ok(self)
    }

    /// Set the working directory of the child
    pub fn current_dir<S: AsRef<OsStr>>(mut self, dir: S) -> Result<Self> {
        self.cwd = Some(to_cstring(dir.as_ref().as_bytes(), "working directory")?);
        Ok(self)
    }

    /// Apply a window size to the terminal before the child starts
    pub fn window_size(mut self, size: WindowSize) -> Self {
        self.window_size = Some(size);
        self
    }

    pub fn path_search(mut self, search: PathSearch) -> Self {
        self.path_search = search;
        self
    }

    /// Give the child a copy of `parent_fd` as descriptor `child_fd`
    ///
    /// The standard streams always come from the terminal, so `child_fd`
    /// must be above 2. `parent_fd` must stay open until [`spawn`] returns;
    /// the parent keeps its own handle.
    pub fn inherit_fd(mut self, child_fd: RawFd, parent_fd: impl AsRawFd) -> Result<Self> {
        if child_fd <= libc::STDERR_FILENO {
            return Err(Error::InvalidArgument(format!(
                "descriptor {} is reserved for the terminal",
                child_fd
            )));
        }
        let parent_fd = parent_fd.as_raw_fd();
        fcntl(parent_fd, FcntlArg::F_GETFD).map_err(|_| {
            Error::InvalidArgument(format!("descriptor {} is not open", parent_fd))
        })?;
        self.inherited_fds.insert(child_fd, parent_fd);
        Ok(self)
    }

    /// Descriptors the child inherits, as `(child, parent)` pairs
    pub fn inherited_fds(&self) -> impl Iterator<Item = (RawFd, RawFd)> + '_ {
        self.inherited_fds.iter().map(|(child, parent)| (*child, *parent))
    }

    pub fn program(&self) -> &CStr {
        &self.program
    }

    pub fn argv(&self) -> &[CString] {
        &self.args
    }

    /// The environment as `NAME=value` entries, ordered by name
    pub fn envp(&self) -> impl Iterator<Item = &CStr> {
        self.env.values().map(CString::as_c_str)
    }

    pub fn controlling_tty(&self) -> &SlavePath {
        &self.controlling_tty
    }
}

/// Programs to try, in order, when the search is done by hand
fn search_candidates(program: &CStr, dirs: &[PathBuf]) -> Result<Vec<CString>> {
    let name = program.to_bytes();
    if name.contains(&b'/') {
        return Ok(vec![program.to_owned()]);
    }

    dirs.iter()
        .map(|dir| {
            let dir = dir.as_os_str().as_bytes();
            if dir.is_empty() {
                return Ok(program.to_owned());
            }
            let mut path = dir.to_vec();
            if !dir.ends_with(b"/") {
                path.push(b'/');
            }
            path.extend_from_slice(name);
            to_cstring(&path, "search path")
        })
        .collect()
}

enum ExecTarget {
    /// Let libc walk `PATH`
    #[cfg(target_os = "linux")]
    Search(CString),
    /// Try each path with execve()
    Candidates(Vec<CString>),
}

/// Pointer arrays for exec, built before fork so the child never allocates
///
/// `argv` and `envp` point into the request the plan was built from.
struct ExecPlan<'a> {
    target: ExecTarget,
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
    inherited: Vec<(RawFd, RawFd)>,
    /// First scratch descriptor; above every inherited source and target
    fd_floor: RawFd,
    _request: PhantomData<&'a SpawnRequest>,
}

impl<'a> ExecPlan<'a> {
    fn new(request: &'a SpawnRequest) -> Result<Self> {
        let target = match &request.path_search {
            #[cfg(target_os = "linux")]
            PathSearch::Inherit => ExecTarget::Search(request.program.clone()),
            #[cfg(not(target_os = "linux"))]
            PathSearch::Inherit => {
                let path = std::env::var_os("PATH").unwrap_or_else(|| DEFAULT_PATH.into());
                let dirs: Vec<PathBuf> = std::env::split_paths(&path).collect();
                ExecTarget::Candidates(search_candidates(&request.program, &dirs)?)
            }
            PathSearch::Custom(dirs) => {
                ExecTarget::Candidates(search_candidates(&request.program, dirs)?)
            }
            PathSearch::Disabled => ExecTarget::Candidates(vec![request.program.clone()]),
        };

        let argv = request
            .args
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        let envp = request
            .env
            .values()
            .map(|var| var.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();

        let inherited: Vec<(RawFd, RawFd)> = request.inherited_fds().collect();
        let fd_floor = inherited
            .iter()
            .map(|(child, parent)| child.max(parent) + 1)
            .max()
            .unwrap_or(0);

        Ok(Self {
            target,
            argv,
            envp,
            inherited,
            fd_floor,
            _request: PhantomData,
        })
    }

    /// Copy every inherited source to a scratch descriptor from `floor` up
    ///
    /// Runs before the standard streams are replaced, so a source of 0, 1
    /// or 2 still means the parent's stream, and no mapping can clobber the
    /// source of another.
    ///
    /// # Safety
    /// Must only be called in a freshly forked child.
    unsafe fn stage_fds(&self, floor: RawFd) -> bool {
        self.inherited
            .iter()
            .enumerate()
            .all(|(index, (_, parent))| libc::dup2(*parent, floor + index as RawFd) >= 0)
    }

    /// Move the staged descriptors onto their targets
    ///
    /// # Safety
    /// Must only be called in a freshly forked child, after [`Self::stage_fds`].
    unsafe fn install_fds(&self, floor: RawFd) -> bool {
        for (index, (child, _)) in self.inherited.iter().enumerate() {
            if libc::dup2(floor + index as RawFd, *child) < 0 {
                return false;
            }
        }
        for index in 0..self.inherited.len() {
            libc::close(floor + index as RawFd);
        }
        true
    }

    /// Replace the process image; only returns by exiting
    ///
    /// # Safety
    /// Must only be called in a freshly forked child.
    unsafe fn exec(&self) -> ! {
        match &self.target {
            #[cfg(target_os = "linux")]
            ExecTarget::Search(program) => {
                libc::execvpe(program.as_ptr(), self.argv.as_ptr(), self.envp.as_ptr());
                let status = match Errno::last() {
                    Errno::ENOENT | Errno::ENOTDIR => EXIT_EXEC_NOT_FOUND,
                    _ => EXIT_EXEC_FAILED,
                };
                libc::_exit(status)
            }
            ExecTarget::Candidates(candidates) => {
                let mut denied = false;
                for candidate in candidates {
                    libc::execve(candidate.as_ptr(), self.argv.as_ptr(), self.envp.as_ptr());
                    match Errno::last() {
                        Errno::ENOENT | Errno::ENOTDIR => {}
                        Errno::EACCES => denied = true,
                        _ => libc::_exit(EXIT_EXEC_FAILED),
                    }
                }
                libc::_exit(if denied {
                    EXIT_EXEC_FAILED
                } else {
                    EXIT_EXEC_NOT_FOUND
                })
            }
        }
    }
}

/// Signals whose disposition is reset before exec
const RESET_SIGNALS: [libc::c_int; 9] = [
    libc::SIGCHLD,
    libc::SIGPIPE,
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGTSTP,
    libc::SIGTTIN,
    libc::SIGTTOU,
];

/// Body of the forked child
///
/// # Safety
/// Must only be called in a freshly forked child. Only async-signal-safe
/// functions are used.
unsafe fn exec_child(slave: RawFd, cwd: Option<&CStr>, plan: &ExecPlan<'_>) -> ! {
    if libc::setsid() < 0 {
        libc::_exit(EXIT_SETUP_FAILED);
    }

    // On macOS TIOCSCTTY is u32 while ioctl expects c_ulong
    if libc::ioctl(slave, libc::TIOCSCTTY as _, 0) < 0 {
        libc::_exit(EXIT_SETUP_FAILED);
    }

    let floor = plan.fd_floor.max(slave + 1);
    if !plan.stage_fds(floor) {
        libc::_exit(EXIT_SETUP_FAILED);
    }

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if libc::dup2(slave, target) < 0 {
            libc::_exit(EXIT_SETUP_FAILED);
        }
    }

    if slave > libc::STDERR_FILENO {
        libc::close(slave);
    } else if libc::fcntl(slave, libc::F_SETFD, 0) < 0 {
        // dup2 onto itself keeps close-on-exec
        libc::_exit(EXIT_SETUP_FAILED);
    }

    if !plan.install_fds(floor) {
        libc::_exit(EXIT_SETUP_FAILED);
    }

    let mut mask: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut mask);
    libc::sigprocmask(libc::SIG_SETMASK, &mask, ptr::null_mut());
    for signal in RESET_SIGNALS {
        libc::signal(signal, libc::SIG_DFL);
    }

    if let Some(dir) = cwd {
        if libc::chdir(dir.as_ptr()) < 0 {
            libc::_exit(EXIT_SETUP_FAILED);
        }
    }

    plan.exec()
}

/// Start a child on the request's controlling terminal
///
/// Returns as soon as the child exists; its state is `Running` even if the
/// exec later fails (that failure is the child's exit status, see
/// [`EXIT_EXEC_NOT_FOUND`]). A slave that was never unlocked is rejected
/// before forking.
pub fn spawn(request: &SpawnRequest) -> Result<ChildProcess> {
    let plan = ExecPlan::new(request)?;

    let slave = request.controlling_tty.open()?;
    if let Some(size) = request.window_size {
        set_window_size(slave.as_fd(), size)?;
    }
    let cwd = request.cwd.as_deref();

    // SAFETY: the child branch only calls async-signal-safe functions before
    // exec or _exit
    match unsafe { fork() }.map_err(Error::Fork)? {
        ForkResult::Parent { child } => {
            // The caller's master is now the only parent-side handle
            drop(slave);
            debug!(
                pid = child.as_raw(),
                program = %request.program.to_string_lossy(),
                inherited = request.inherited_fds.len(),
                tty = %request.controlling_tty,
                "spawned child"
            );
            Ok(ChildProcess::running(child))
        }
        ForkResult::Child => unsafe { exec_child(slave.as_raw_fd(), cwd, &plan) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::ChildState;
    use crate::pty::open_pty;
    use nix::sys::wait::waitpid;

    fn wait_state(child: &ChildProcess) -> ChildState {
        loop {
            let status = waitpid(child.pid(), None).unwrap();
            if let Some(state) = ChildState::from_wait_status(status) {
                return state;
            }
        }
    }

    #[test]
    fn test_argv_defaults_to_program() {
        let request = SpawnRequest::new("true", SlavePath::new("/dev/null")).unwrap();
        assert_eq!(request.argv().len(), 1);
        assert_eq!(request.argv()[0].as_bytes(), b"true");
        assert_eq!(request.envp().count(), 0);
    }

    #[test]
    fn test_arg0_override() {
        let request = SpawnRequest::new("/bin/sh", SlavePath::new("/dev/null"))
            .unwrap()
            .arg0("-sh")
            .unwrap()
            .args(["-c", "exit 0"])
            .unwrap();
        let argv: Vec<&[u8]> = request.argv().iter().map(|a| a.as_bytes()).collect();
        assert_eq!(argv, vec![&b"-sh"[..], b"-c", b"exit 0"]);
        assert_eq!(request.program().to_bytes(), b"/bin/sh");
    }

    #[test]
    fn test_env_is_a_mapping() {
        let request = SpawnRequest::new("env", SlavePath::new("/dev/null"))
            .unwrap()
            .env("B", "1")
            .unwrap()
            .env("A", "2")
            .unwrap()
            .env("B", "3")
            .unwrap();
        let envp: Vec<&[u8]> = request.envp().map(CStr::to_bytes).collect();
        assert_eq!(envp, vec![&b"A=2"[..], b"B=3"]);
    }

    #[test]
    fn test_invalid_strings_rejected() {
        let tty = SlavePath::new("/dev/null");
        assert!(matches!(
            SpawnRequest::new("a\0b", tty.clone()),
            Err(Error::InvalidArgument(_))
        ));

        let request = SpawnRequest::new("env", tty).unwrap();
        assert!(matches!(
            request.clone().arg("x\0y"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            request.clone().env("A=B", "c"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            request.clone().env("", "c"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            request.env("A", "c\0"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_search_candidates() {
        let program = CString::new("prog").unwrap();
        let dirs = vec![
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/opt/tools/"),
            PathBuf::new(),
        ];
        let candidates = search_candidates(&program, &dirs).unwrap();
        let candidates: Vec<&[u8]> = candidates.iter().map(|c| c.as_bytes()).collect();
        assert_eq!(
            candidates,
            vec![&b"/usr/local/bin/prog"[..], b"/opt/tools/prog", b"prog"]
        );
    }

    #[test]
    fn test_search_skipped_for_paths() {
        let program = CString::new("./bin/prog").unwrap();
        let candidates = search_candidates(&program, &[PathBuf::from("/usr/bin")]).unwrap();
        assert_eq!(candidates, vec![program]);
    }

    #[test]
    fn test_spawn_exit_code() {
        let pair = open_pty().unwrap();
        let request = SpawnRequest::new("/bin/sh", pair.slave_path().clone())
            .unwrap()
            .args(["-c", "exit 3"])
            .unwrap();
        let child = spawn(&request).unwrap();
        assert!(child.is_running());
        assert_eq!(wait_state(&child), ChildState::Exited(3));
    }

    #[test]
    fn test_spawn_bare_name_uses_path() {
        let pair = open_pty().unwrap();
        let request = SpawnRequest::new("sh", pair.slave_path().clone())
            .unwrap()
            .args(["-c", "exit 0"])
            .unwrap();
        let child = spawn(&request).unwrap();
        assert_eq!(wait_state(&child), ChildState::Exited(0));
    }

    #[test]
    fn test_spawn_missing_program() {
        let pair = open_pty().unwrap();
        let request = SpawnRequest::new("ptyspawn-no-such-program", pair.slave_path().clone())
            .unwrap();
        let child = spawn(&request).unwrap();
        assert_eq!(wait_state(&child), ChildState::Exited(EXIT_EXEC_NOT_FOUND));
    }

    #[test]
    fn test_spawn_path_search_disabled() {
        let pair = open_pty().unwrap();
        let request = SpawnRequest::new("sh", pair.slave_path().clone())
            .unwrap()
            .args(["-c", "exit 0"])
            .unwrap()
            .path_search(PathSearch::Disabled);
        let child = spawn(&request).unwrap();
        // No "./sh" in the test's working directory
        assert_eq!(wait_state(&child), ChildState::Exited(EXIT_EXEC_NOT_FOUND));
    }

    #[test]
    fn test_spawn_custom_path() {
        let pair = open_pty().unwrap();
        let request = SpawnRequest::new("sh", pair.slave_path().clone())
            .unwrap()
            .args(["-c", "exit 4"])
            .unwrap()
            .path_search(PathSearch::Custom(vec![
                PathBuf::from("/nonexistent-dir"),
                PathBuf::from("/bin"),
            ]));
        let child = spawn(&request).unwrap();
        assert_eq!(wait_state(&child), ChildState::Exited(4));
    }

    #[test]
    fn test_spawn_bad_working_directory() {
        let pair = open_pty().unwrap();
        let request = SpawnRequest::new("/bin/sh", pair.slave_path().clone())
            .unwrap()
            .args(["-c", "exit 0"])
            .unwrap()
            .current_dir("/nonexistent-ptyspawn-dir")
            .unwrap();
        let child = spawn(&request).unwrap();
        assert_eq!(wait_state(&child), ChildState::Exited(EXIT_SETUP_FAILED));
    }

    #[test]
    fn test_spawn_environment_is_exact() {
        let pair = open_pty().unwrap();
        // HOME is set in the test environment but must not leak through
        let request = SpawnRequest::new("/bin/sh", pair.slave_path().clone())
            .unwrap()
            .args(["-c", r#"[ "$ONLY" = "yes" ] && [ -z "${HOME+set}" ]"#])
            .unwrap()
            .env("ONLY", "yes")
            .unwrap();
        let child = spawn(&request).unwrap();
        assert_eq!(wait_state(&child), ChildState::Exited(0));
    }

    #[test]
    fn test_spawn_has_controlling_terminal() {
        let pair = open_pty().unwrap();
        let request = SpawnRequest::new("/bin/sh", pair.slave_path().clone())
            .unwrap()
            .args(["-c", "[ -t 0 ] && [ -t 1 ] && [ -t 2 ] && : < /dev/tty"])
            .unwrap();
        let child = spawn(&request).unwrap();
        assert_eq!(wait_state(&child), ChildState::Exited(0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_spawn_rejects_locked_slave() {
        let mut master = crate::pty::PtyMaster::open().unwrap();
        master.grant().unwrap();
        let path = master.resolve_slave_path().unwrap();
        let request = SpawnRequest::new("/bin/true", path).unwrap();
        assert!(matches!(spawn(&request), Err(Error::SlaveLocked { .. })));
    }

    #[test]
    fn test_inherit_fd_rejects_stdio() {
        let request = SpawnRequest::new("/bin/sh", SlavePath::new("/dev/null")).unwrap();
        let (_, b) = std::os::unix::net::UnixStream::pair().unwrap();
        assert!(matches!(
            request.clone().inherit_fd(1, b.as_raw_fd()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            request.inherit_fd(3, 100_000),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_spawn_inherits_fd() {
        use std::io::Read;
        use std::os::unix::net::UnixStream;

        let pair = open_pty().unwrap();
        let (mut reader, writer) = UnixStream::pair().unwrap();
        let request = SpawnRequest::new("/bin/sh", pair.slave_path().clone())
            .unwrap()
            .args(["-c", "echo hi >&3"])
            .unwrap()
            .inherit_fd(3, writer.as_raw_fd())
            .unwrap();
        let child = spawn(&request).unwrap();
        drop(writer);
        assert_eq!(wait_state(&child), ChildState::Exited(0));

        let mut received = String::new();
        reader.read_to_string(&mut received).unwrap();
        assert_eq!(received, "hi\n");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_spawn_inherits_crossed_fds() {
        use nix::fcntl::OFlag;
        use nix::unistd::pipe2;
        use std::fs::File;
        use std::io::Read;

        let pair = open_pty().unwrap();
        let (first_read, first) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let (second_read, second) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let script = format!(
            "echo one > /dev/fd/{}; echo two > /dev/fd/{}",
            second.as_raw_fd(),
            first.as_raw_fd()
        );
        // Each target is the other mapping's source
        let request = SpawnRequest::new("/bin/sh", pair.slave_path().clone())
            .unwrap()
            .args(["-c", script.as_str()])
            .unwrap()
            .inherit_fd(second.as_raw_fd(), first.as_raw_fd())
            .unwrap()
            .inherit_fd(first.as_raw_fd(), second.as_raw_fd())
            .unwrap();
        let child = spawn(&request).unwrap();
        drop(first);
        drop(second);
        assert_eq!(wait_state(&child), ChildState::Exited(0));

        let mut received = String::new();
        File::from(first_read).read_to_string(&mut received).unwrap();
        assert_eq!(received, "one\n");
        received.clear();
        File::from(second_read).read_to_string(&mut received).unwrap();
        assert_eq!(received, "two\n");
    }
}
