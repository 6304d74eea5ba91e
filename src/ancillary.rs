//! Control message framing for Unix domain sockets
//!
//! The raw helpers mirror the `CMSG_*` macros. On top of them
//! [`ControlBuffer`], [`AncillaryMessage`] and [`ControlHeader`] give a
//! bounds-checked view, and [`send_fd`]/[`recv_fd`] move one descriptor
//! (typically a PTY master) to another process together with an `i32` slot
//! number telling the receiver what the descriptor is for.

use std::io::{self, IoSlice, IoSliceMut};
use std::marker::PhantomData;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::{self, NonNull};

use libc::c_uint;
use tracing::debug;

use crate::error::{Error, Result};

/// Largest payload the length helpers account for; bigger inputs saturate
const MAX_PAYLOAD: c_uint = c_uint::MAX / 2;

const FD_SIZE: usize = mem::size_of::<RawFd>();

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

fn payload_len(payload: usize) -> c_uint {
    c_uint::try_from(payload).map_or(MAX_PAYLOAD, |len| len.min(MAX_PAYLOAD))
}

/// Value of `cmsg_len` for a control message carrying `payload` bytes
/// (`CMSG_LEN`)
pub fn control_message_length(payload: usize) -> usize {
    // Not `unsafe` in every libc release
    #[allow(unused_unsafe)]
    let len = unsafe { libc::CMSG_LEN(payload_len(payload)) };
    len as usize
}

/// Buffer bytes needed for a control message carrying `payload` bytes,
/// including trailing alignment (`CMSG_SPACE`)
pub fn control_message_space(payload: usize) -> usize {
    #[allow(unused_unsafe)]
    let space = unsafe { libc::CMSG_SPACE(payload_len(payload)) };
    space as usize
}

/// Location of the payload of a control message (`CMSG_DATA`)
///
/// # Safety
/// `header` must point to a control message header inside a buffer of at
/// least [`control_message_space`] bytes for the payload being accessed.
pub unsafe fn data_pointer(header: *const libc::cmsghdr) -> *mut u8 {
    libc::CMSG_DATA(header)
}

/// First control message header of a message (`CMSG_FIRSTHDR`), if the
/// control buffer can hold one
///
/// # Safety
/// `message` must point to a valid `msghdr` whose `msg_control` and
/// `msg_controllen` describe a live buffer.
pub unsafe fn first_header(message: *const libc::msghdr) -> Option<NonNull<libc::cmsghdr>> {
    NonNull::new(libc::CMSG_FIRSTHDR(message))
}

/// Zeroed control message storage with the alignment of `cmsghdr`
pub struct ControlBuffer {
    storage: Vec<libc::cmsghdr>,
    len: usize,
}

impl ControlBuffer {
    /// Buffer with room for one control message carrying `payload` bytes
    pub fn for_payload(payload: usize) -> Self {
        Self::with_space(control_message_space(payload))
    }

    /// Buffer of exactly `len` usable bytes
    pub fn with_space(len: usize) -> Self {
        let header = mem::size_of::<libc::cmsghdr>();
        // SAFETY: cmsghdr is plain old data
        let zeroed: libc::cmsghdr = unsafe { mem::zeroed() };
        Self {
            storage: vec![zeroed; len.div_ceil(header)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: storage holds at least `len` initialized bytes
        unsafe { std::slice::from_raw_parts(self.storage.as_ptr().cast::<u8>(), self.len) }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        if self.len == 0 {
            ptr::null_mut()
        } else {
            self.storage.as_mut_ptr().cast()
        }
    }
}

impl std::fmt::Debug for ControlBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBuffer").field("len", &self.len).finish()
    }
}

/// A `msghdr` borrowing the caller's data and control buffers
pub struct AncillaryMessage<'a> {
    header: libc::msghdr,
    space: usize,
    _buffers: PhantomData<&'a mut [u8]>,
}

impl<'a> AncillaryMessage<'a> {
    fn new(iov: *mut libc::iovec, iov_len: usize, control: &'a mut ControlBuffer) -> Self {
        // SAFETY: msghdr is plain old data; platform-specific padding fields
        // must be zero
        let mut header: libc::msghdr = unsafe { mem::zeroed() };
        header.msg_iov = iov;
        header.msg_iovlen = iov_len as _;
        header.msg_control = control.as_mut_ptr();
        header.msg_controllen = control.len() as _;
        Self {
            header,
            space: control.len(),
            _buffers: PhantomData,
        }
    }

    /// Message for `sendmsg`
    pub fn for_send(iov: &'a [IoSlice<'_>], control: &'a mut ControlBuffer) -> Self {
        // IoSlice is ABI compatible with iovec; sendmsg does not write
        // through msg_iov
        Self::new(iov.as_ptr() as *mut libc::iovec, iov.len(), control)
    }

    /// Message for `recvmsg`
    pub fn for_recv(iov: &'a mut [IoSliceMut<'_>], control: &'a mut ControlBuffer) -> Self {
        Self::new(iov.as_mut_ptr().cast(), iov.len(), control)
    }

    /// Bytes of control data in use; after `recvmsg` this is what the
    /// kernel filled in
    pub fn control_len(&self) -> usize {
        self.header.msg_controllen as usize
    }

    /// Capacity of the control buffer
    pub fn space_len(&self) -> usize {
        self.space
    }

    /// `msg_flags` as set by `recvmsg`
    pub fn flags(&self) -> libc::c_int {
        self.header.msg_flags
    }

    pub fn is_truncated(&self) -> bool {
        self.header.msg_flags & libc::MSG_CTRUNC != 0
    }

    /// First control message, if the control data can hold one
    pub fn first_header(&mut self) -> Option<ControlHeader<'_>> {
        // SAFETY: msg_control/msg_controllen describe the borrowed buffer
        let header = unsafe { first_header(&self.header) }?;
        let end = (self.header.msg_control as *const u8).wrapping_add(self.control_len());
        Some(ControlHeader {
            header,
            end,
            _message: PhantomData,
        })
    }

    pub fn as_raw(&self) -> *const libc::msghdr {
        &self.header
    }

    pub fn as_raw_mut(&mut self) -> *mut libc::msghdr {
        &mut self.header
    }
}

/// One control message inside an [`AncillaryMessage`]
pub struct ControlHeader<'m> {
    header: NonNull<libc::cmsghdr>,
    end: *const u8,
    _message: PhantomData<&'m mut ()>,
}

impl ControlHeader<'_> {
    pub fn level(&self) -> libc::c_int {
        // SAFETY: first_header only returns headers inside the buffer
        unsafe { self.header.as_ref().cmsg_level }
    }

    pub fn kind(&self) -> libc::c_int {
        unsafe { self.header.as_ref().cmsg_type }
    }

    /// `cmsg_len`: header plus payload
    pub fn len(&self) -> usize {
        unsafe { self.header.as_ref().cmsg_len as usize }
    }

    fn data_start(&self) -> *mut u8 {
        unsafe { data_pointer(self.header.as_ptr()) }
    }

    /// Bytes from the payload start to the end of the control data
    fn capacity(&self) -> usize {
        (self.end as usize).saturating_sub(self.data_start() as usize)
    }

    /// Payload length declared by `cmsg_len`, checked against the buffer
    fn payload_len(&self) -> Result<usize> {
        let offset = self.data_start() as usize - self.header.as_ptr() as usize;
        let payload = self
            .len()
            .checked_sub(offset)
            .ok_or_else(|| Error::Ancillary(format!("cmsg_len {} is too short", self.len())))?;
        if payload > self.capacity() {
            return Err(Error::Ancillary(format!(
                "cmsg_len {} overruns the control buffer",
                self.len()
            )));
        }
        Ok(payload)
    }

    /// Fill in the header and copy `payload` after it
    pub fn set(&mut self, level: libc::c_int, kind: libc::c_int, payload: &[u8]) -> Result<()> {
        if payload.len() > self.capacity() {
            return Err(Error::Ancillary(format!(
                "{} payload bytes do not fit in a {} byte control buffer",
                payload.len(),
                self.capacity()
            )));
        }
        let data = self.data_start();
        // SAFETY: the header lies inside the buffer and the payload fits
        unsafe {
            let header = self.header.as_mut();
            header.cmsg_level = level;
            header.cmsg_type = kind;
            header.cmsg_len = control_message_length(payload.len()) as _;
            ptr::copy_nonoverlapping(payload.as_ptr(), data, payload.len());
        }
        Ok(())
    }

    pub fn data(&self) -> Result<&[u8]> {
        let len = self.payload_len()?;
        // SAFETY: bounds checked against the control buffer
        Ok(unsafe { std::slice::from_raw_parts(self.data_start(), len) })
    }

    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        let len = self.payload_len()?;
        Ok(unsafe { std::slice::from_raw_parts_mut(self.data_start(), len) })
    }
}

fn last_error() -> Option<io::Error> {
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::Interrupted {
        None
    } else {
        Some(err)
    }
}

/// Send `fd` over a Unix domain socket, tagged with `slot`
///
/// The slot travels as the regular payload, the descriptor as a single
/// `SCM_RIGHTS` control message.
pub fn send_fd(socket: impl AsFd, fd: impl AsFd, slot: i32) -> Result<()> {
    let slot_bytes = slot.to_ne_bytes();
    let iov = [IoSlice::new(&slot_bytes)];
    let mut control = ControlBuffer::for_payload(FD_SIZE);
    let mut message = AncillaryMessage::for_send(&iov, &mut control);

    {
        let mut header = message
            .first_header()
            .ok_or_else(|| Error::Ancillary("control buffer cannot hold a header".to_string()))?;
        let raw = fd.as_fd().as_raw_fd();
        header.set(libc::SOL_SOCKET, libc::SCM_RIGHTS, &raw.to_ne_bytes())?;
    }

    let socket = socket.as_fd().as_raw_fd();
    let sent = loop {
        // SAFETY: message points at live buffers for the whole call
        let sent = unsafe { libc::sendmsg(socket, message.as_raw(), SEND_FLAGS) };
        if sent >= 0 {
            break sent as usize;
        }
        if let Some(err) = last_error() {
            return Err(err.into());
        }
    };

    if sent != slot_bytes.len() {
        return Err(Error::Ancillary(format!(
            "sent {} of {} payload bytes",
            sent,
            slot_bytes.len()
        )));
    }
    debug!(socket, fd = fd.as_fd().as_raw_fd(), slot, "sent descriptor");
    Ok(())
}

/// Receive a descriptor sent with [`send_fd`]
///
/// Returns `Ok(None)` when the peer has shut the connection down. The
/// received descriptor is close-on-exec.
pub fn recv_fd(socket: impl AsFd) -> Result<Option<(OwnedFd, i32)>> {
    let socket = socket.as_fd().as_raw_fd();
    let mut slot_bytes = [0u8; mem::size_of::<i32>()];
    let mut iov = [IoSliceMut::new(&mut slot_bytes)];
    let mut control = ControlBuffer::for_payload(FD_SIZE);
    let mut message = AncillaryMessage::for_recv(&mut iov, &mut control);

    let received = loop {
        // SAFETY: message points at live buffers for the whole call
        let received = unsafe { libc::recvmsg(socket, message.as_raw_mut(), RECV_FLAGS) };
        if received >= 0 {
            break received as usize;
        }
        if let Some(err) = last_error() {
            return Err(err.into());
        }
    };
    let truncated = message.is_truncated();

    let fds = match message.first_header() {
        None if received == 0 => return Ok(None),
        None => {
            return Err(Error::Ancillary(
                "message carries no control data".to_string(),
            ))
        }
        Some(header) => {
            if header.level() != libc::SOL_SOCKET || header.kind() != libc::SCM_RIGHTS {
                return Err(Error::Ancillary(format!(
                    "unexpected control message (level {}, type {})",
                    header.level(),
                    header.kind()
                )));
            }
            header
                .data()?
                .chunks_exact(FD_SIZE)
                .map(|chunk| {
                    let mut raw = [0u8; FD_SIZE];
                    raw.copy_from_slice(chunk);
                    // SAFETY: SCM_RIGHTS descriptors are freshly installed
                    // in this process and owned by nobody else
                    unsafe { OwnedFd::from_raw_fd(RawFd::from_ne_bytes(raw)) }
                })
                .collect::<Vec<_>>()
        }
    };
    drop(message);

    if truncated {
        return Err(Error::Ancillary("control data was truncated".to_string()));
    }
    let mut fds = fds.into_iter();
    let fd = match (fds.next(), fds.next()) {
        (Some(fd), None) => fd,
        (None, _) => return Err(Error::Ancillary("no descriptor received".to_string())),
        (Some(_), Some(_)) => {
            return Err(Error::Ancillary(
                "more than one descriptor received".to_string(),
            ))
        }
    };
    if received != slot_bytes.len() {
        return Err(Error::Ancillary(format!(
            "received {} of {} payload bytes",
            received,
            slot_bytes.len()
        )));
    }

    #[cfg(not(target_os = "linux"))]
    nix::fcntl::fcntl(
        fd.as_raw_fd(),
        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
    )?;

    let slot = i32::from_ne_bytes(slot_bytes);
    debug!(socket, fd = fd.as_raw_fd(), slot, "received descriptor");
    Ok(Some((fd, slot)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    proptest! {
        #[test]
        fn length_never_exceeds_space(n in 0usize..1 << 20) {
            prop_assert!(control_message_length(n) <= control_message_space(n));
        }

        #[test]
        fn sizes_are_monotonic(a in 0usize..1 << 20, b in 0usize..1 << 20) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(control_message_length(lo) <= control_message_length(hi));
            prop_assert!(control_message_space(lo) <= control_message_space(hi));
        }

        #[test]
        fn length_covers_payload(n in 0usize..1 << 20) {
            prop_assert!(control_message_length(n) >= n + mem::size_of::<libc::cmsghdr>());
            prop_assert_eq!(control_message_space(n) % mem::align_of::<libc::cmsghdr>(), 0);
        }
    }

    #[test]
    fn test_huge_payloads_saturate() {
        assert!(control_message_length(usize::MAX) <= control_message_space(usize::MAX));
        assert_eq!(
            control_message_space(usize::MAX),
            control_message_space(MAX_PAYLOAD as usize)
        );
    }

    #[test]
    fn test_buffer_is_aligned_and_zeroed() {
        let buffer = ControlBuffer::for_payload(FD_SIZE);
        assert_eq!(buffer.len(), control_message_space(FD_SIZE));
        assert_eq!(
            buffer.as_bytes().as_ptr() as usize % mem::align_of::<libc::cmsghdr>(),
            0
        );
        assert!(buffer.as_bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_empty_buffer_has_no_header() {
        let mut control = ControlBuffer::with_space(0);
        let iov: [IoSlice<'_>; 0] = [];
        let mut message = AncillaryMessage::for_send(&iov, &mut control);
        assert!(message.first_header().is_none());
        assert_eq!(message.space_len(), 0);
    }

    #[test]
    fn test_set_and_read_back() {
        let mut control = ControlBuffer::for_payload(8);
        let iov: [IoSlice<'_>; 0] = [];
        let mut message = AncillaryMessage::for_send(&iov, &mut control);
        assert_eq!(message.control_len(), control_message_space(8));

        let mut header = message.first_header().unwrap();
        header
            .set(libc::SOL_SOCKET, libc::SCM_RIGHTS, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
        assert_eq!(header.level(), libc::SOL_SOCKET);
        assert_eq!(header.kind(), libc::SCM_RIGHTS);
        assert_eq!(header.len(), control_message_length(8));
        assert_eq!(header.data().unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8]);

        header.data_mut().unwrap()[0] = 9;
        assert_eq!(header.data().unwrap()[0], 9);
    }

    #[test]
    fn test_set_rejects_oversized_payload() {
        let mut control = ControlBuffer::for_payload(0);
        let iov: [IoSlice<'_>; 0] = [];
        let mut message = AncillaryMessage::for_send(&iov, &mut control);
        let mut header = message.first_header().unwrap();
        let payload = vec![0u8; 64];
        assert!(matches!(
            header.set(libc::SOL_SOCKET, libc::SCM_RIGHTS, &payload),
            Err(Error::Ancillary(_))
        ));
    }

    #[test]
    fn test_corrupt_length_is_rejected() {
        let mut control = ControlBuffer::for_payload(FD_SIZE);
        let iov: [IoSlice<'_>; 0] = [];
        let mut message = AncillaryMessage::for_send(&iov, &mut control);
        let header = message.first_header().unwrap();
        unsafe {
            (*header.header.as_ptr()).cmsg_len = 4096 as _;
        }
        assert!(matches!(header.data(), Err(Error::Ancillary(_))));
    }

    #[test]
    fn test_send_and_receive_descriptor() {
        let (left, right) = UnixStream::pair().unwrap();
        let (carried, mut other_end) = UnixStream::pair().unwrap();

        send_fd(&left, &carried, 7).unwrap();
        drop(carried);

        let (fd, slot) = recv_fd(&right).unwrap().unwrap();
        assert_eq!(slot, 7);

        let flags = nix::fcntl::fcntl(fd.as_raw_fd(), nix::fcntl::FcntlArg::F_GETFD).unwrap();
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        let mut received = UnixStream::from(fd);
        received.write_all(b"through").unwrap();
        let mut buf = [0u8; 7];
        other_end.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"through");
    }

    #[test]
    fn test_receive_eof() {
        let (left, right) = UnixStream::pair().unwrap();
        drop(left);
        assert!(recv_fd(&right).unwrap().is_none());
    }

    #[test]
    fn test_receive_without_descriptor() {
        let (mut left, right) = UnixStream::pair().unwrap();
        left.write_all(&3i32.to_ne_bytes()).unwrap();
        assert!(matches!(recv_fd(&right), Err(Error::Ancillary(_))));
    }
}
