//! PTY (pseudoterminal) allocation
//!
//! Opens a master, runs the grant/unlock handshake and resolves the slave
//! device path:
//! - posix_openpt() to open the master
//! - grantpt() to set permissions on the slave
//! - unlockpt() to unlock the slave
//! - ptsname() to get the slave device path
//!
//! The kernel's table of free PTYs is the only state involved; nothing here
//! is global to the process.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{grantpt, posix_openpt, unlockpt};
use nix::unistd::{read, write};
use tracing::debug;

use crate::error::{Error, Result};
use crate::size::WindowSize;

/// Device path of a PTY slave, exactly as the OS reported it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlavePath(String);

impl SlavePath {
    /// Wrap a path obtained elsewhere (e.g. from another process)
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Open the slave read/write without making it the controlling terminal
    ///
    /// The descriptor is close-on-exec. A slave whose master was never
    /// unlocked fails with [`Error::SlaveLocked`].
    pub fn open(&self) -> Result<OwnedFd> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(self.as_path())
            .map_err(|source| {
                if source.raw_os_error() == Some(libc::EIO) {
                    Error::SlaveLocked {
                        path: self.0.clone(),
                    }
                } else {
                    Error::OpenSlave {
                        path: self.0.clone(),
                        source,
                    }
                }
            })?;
        Ok(OwnedFd::from(file))
    }
}

impl fmt::Display for SlavePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<Path> for SlavePath {
    fn as_ref(&self) -> &Path {
        self.as_path()
    }
}

/// A pseudoterminal master
///
/// Owned by the caller; closing it (dropping) while a child still holds the
/// slave hangs up that child.
pub struct PtyMaster {
    inner: nix::pty::PtyMaster,
    granted: bool,
    unlocked: bool,
}

impl PtyMaster {
    /// Open a new master with read/write access and no controlling-terminal
    /// side effect
    ///
    /// The slave is still locked; see [`open_pty`] for the full handshake.
    pub fn open() -> Result<Self> {
        let inner = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(|source| {
            Error::Allocation {
                step: "posix_openpt",
                source,
            }
        })?;

        // Children must not inherit the master, or it never sees the hangup
        fcntl(inner.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|source| {
            Error::Allocation {
                step: "cloexec",
                source,
            }
        })?;

        debug!(fd = inner.as_raw_fd(), "opened PTY master");
        Ok(Self {
            inner,
            granted: false,
            unlocked: false,
        })
    }

    /// Hand the slave device to the invoking user
    pub fn grant(&mut self) -> Result<()> {
        grantpt(&self.inner).map_err(Error::Permission)?;
        self.granted = true;
        Ok(())
    }

    /// Clear the lock that keeps the slave from being opened
    pub fn unlock(&mut self) -> Result<()> {
        unlockpt(&self.inner).map_err(|source| Error::Allocation {
            step: "unlockpt",
            source,
        })?;
        self.unlocked = true;
        Ok(())
    }

    /// Path of the slave end
    pub fn resolve_slave_path(&self) -> Result<SlavePath> {
        #[cfg(target_os = "linux")]
        let name = nix::pty::ptsname_r(&self.inner).map_err(Error::Lookup)?;

        // SAFETY: ptsname uses a static buffer; the result is copied into an
        // owned String before this call returns
        #[cfg(not(target_os = "linux"))]
        let name = unsafe { nix::pty::ptsname(&self.inner) }.map_err(Error::Lookup)?;

        Ok(SlavePath(name))
    }

    pub fn is_granted(&self) -> bool {
        self.granted
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    pub fn master_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Set non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let fd = self.inner.as_raw_fd();
        let flags = fcntl(fd, FcntlArg::F_GETFL)?;
        let flags = OFlag::from_bits_truncate(flags);
        let new_flags = if nonblocking {
            flags | OFlag::O_NONBLOCK
        } else {
            flags & !OFlag::O_NONBLOCK
        };
        fcntl(fd, FcntlArg::F_SETFL(new_flags))?;
        Ok(())
    }

    /// Set the window size seen by programs on the slave
    pub fn set_window_size(&self, size: WindowSize) -> Result<()> {
        set_window_size(self.as_fd(), size)
    }

    pub fn window_size(&self) -> Result<WindowSize> {
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        // SAFETY: TIOCGWINSZ writes one winsize into `ws`
        let result = unsafe { libc::ioctl(self.inner.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
        if result == -1 {
            Err(Error::Io(io::Error::last_os_error()))
        } else {
            Ok(WindowSize::from(ws))
        }
    }

    /// Wait until the master is readable
    ///
    /// Returns false if the timeout expired first. A hangup counts as
    /// readable: the next read reports EOF.
    pub fn poll_read(&self, timeout: Duration) -> Result<bool> {
        let timeout = i32::try_from(timeout.as_millis())
            .ok()
            .and_then(|ms| PollTimeout::try_from(ms).ok())
            .unwrap_or(PollTimeout::MAX);
        loop {
            let mut fds = [PollFd::new(self.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    return Ok(fds[0]
                        .revents()
                        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)))
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Io(e.into())),
            }
        }
    }

    /// Read output produced on the slave
    ///
    /// Once every slave reference is closed Linux fails master reads with
    /// EIO; that is reported as end of file.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match read(self.inner.as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(Errno::EIO) => return Ok(0),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write input for the program on the slave
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match write(self.as_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write all bytes to the master
    pub fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match self.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PtyMaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyMaster")
            .field("fd", &self.inner.as_raw_fd())
            .field("granted", &self.granted)
            .field("unlocked", &self.unlocked)
            .finish()
    }
}

impl AsRawFd for PtyMaster {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl AsFd for PtyMaster {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the fd is owned by `inner` and outlives the borrow
        unsafe { BorrowedFd::borrow_raw(self.inner.as_raw_fd()) }
    }
}

impl Read for PtyMaster {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        PtyMaster::read(self, buf)
    }
}

impl Read for &PtyMaster {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        PtyMaster::read(self, buf)
    }
}

impl Write for PtyMaster {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        PtyMaster::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &PtyMaster {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        PtyMaster::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A master together with the path of its (granted, unlocked) slave
#[derive(Debug)]
pub struct PtyPair {
    master: PtyMaster,
    slave_path: SlavePath,
}

impl PtyPair {
    /// Same as [`open_pty`]
    pub fn open() -> Result<Self> {
        open_pty()
    }

    pub fn master(&self) -> &PtyMaster {
        &self.master
    }

    pub fn master_mut(&mut self) -> &mut PtyMaster {
        &mut self.master
    }

    pub fn slave_path(&self) -> &SlavePath {
        &self.slave_path
    }

    pub fn into_parts(self) -> (PtyMaster, SlavePath) {
        (self.master, self.slave_path)
    }
}

/// Open a master and run the whole handshake
///
/// Either every step (open, grant, unlock, resolve) succeeds or the master is
/// closed and the failing step's error is returned. Nothing is retried.
pub fn open_pty() -> Result<PtyPair> {
    let mut master = PtyMaster::open()?;
    master.grant()?;
    master.unlock()?;
    let slave_path = master.resolve_slave_path()?;

    debug!(fd = master.master_fd(), slave = %slave_path, "PTY handshake complete");
    Ok(PtyPair { master, slave_path })
}

/// Set the window size on any end of a PTY
pub(crate) fn set_window_size(fd: BorrowedFd<'_>, size: WindowSize) -> Result<()> {
    let ws = size.to_winsize();
    // SAFETY: TIOCSWINSZ reads one winsize from `ws`
    let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
    if result == -1 {
        Err(Error::Io(io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_until(master: &PtyMaster, needle: &str) -> String {
        let mut output = String::new();
        let mut buf = [0u8; 1024];
        for _ in 0..20 {
            if !master.poll_read(Duration::from_millis(100)).unwrap() {
                continue;
            }
            let n = master.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            output.push_str(&String::from_utf8_lossy(&buf[..n]));
            if output.contains(needle) {
                break;
            }
        }
        output
    }

    #[test]
    fn test_open_pty() {
        let pair = open_pty().unwrap();
        assert!(pair.master().is_granted());
        assert!(pair.master().is_unlocked());
        assert!(!pair.slave_path().as_str().is_empty());
        #[cfg(target_os = "linux")]
        assert!(pair.slave_path().as_str().starts_with("/dev/pts/"));
        #[cfg(target_os = "macos")]
        assert!(pair.slave_path().as_str().starts_with("/dev/ttys"));
    }

    #[test]
    fn test_distinct_slaves() {
        let a = open_pty().unwrap();
        let b = open_pty().unwrap();
        assert_ne!(a.slave_path(), b.slave_path());
    }

    #[test]
    fn test_master_is_cloexec() {
        let master = PtyMaster::open().unwrap();
        let flags = fcntl(master.master_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_slave_locked_until_unlock() {
        let mut master = PtyMaster::open().unwrap();
        master.grant().unwrap();
        let path = master.resolve_slave_path().unwrap();

        match path.open() {
            Err(Error::SlaveLocked { path: p }) => assert_eq!(p, path.as_str()),
            other => panic!("expected SlaveLocked, got {:?}", other),
        }

        master.unlock().unwrap();
        assert!(path.open().is_ok());
    }

    #[test]
    fn test_window_size_roundtrip() {
        let pair = open_pty().unwrap();
        pair.master()
            .set_window_size(WindowSize::new(132, 43))
            .unwrap();
        let size = pair.master().window_size().unwrap();
        assert_eq!(size.cols, 132);
        assert_eq!(size.rows, 43);
    }

    #[test]
    fn test_slave_output_reaches_master() {
        let pair = open_pty().unwrap();
        let slave = std::fs::File::from(pair.slave_path().open().unwrap());
        (&slave).write_all(b"from-slave\n").unwrap();

        let output = read_until(pair.master(), "from-slave");
        assert!(output.contains("from-slave"), "got: {:?}", output);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_read_after_slave_close_is_eof() {
        let pair = open_pty().unwrap();
        let slave = pair.slave_path().open().unwrap();
        drop(slave);

        pair.master().set_nonblocking(true).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(pair.master().read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_poll_read_times_out_then_sees_data() {
        let pair = open_pty().unwrap();
        let slave = std::fs::File::from(pair.slave_path().open().unwrap());
        assert!(!pair.master().poll_read(Duration::from_millis(50)).unwrap());

        (&slave).write_all(b"x").unwrap();
        assert!(pair.master().poll_read(Duration::from_secs(5)).unwrap());
        let mut buf = [0u8; 8];
        assert_eq!(pair.master().read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'x');
    }

    #[test]
    fn test_nonblocking_toggle() {
        let pair = open_pty().unwrap();
        assert!(pair.master().set_nonblocking(true).is_ok());
        assert!(pair.master().set_nonblocking(false).is_ok());
    }
}
