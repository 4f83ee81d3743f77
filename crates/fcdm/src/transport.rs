//! Frame transport over a unix stream socket with descriptor passing.
//!
//! Frames use the codec in [`fcdm_protocol::frame`]. Descriptors attached to a
//! frame are sent with its first byte via SCM_RIGHTS; the reader queues every
//! descriptor it receives and hands them out in order to the frames that
//! declare them.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;

use fcdm_protocol::frame::{self, FrameError};
use fcdm_protocol::{Frame, MAX_FRAME_LEN};
use thiserror::Error;
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Most descriptors a single frame may carry.
pub const MAX_FDS_PER_FRAME: usize = 4;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("peer closed the connection mid-frame")]
    UnexpectedEof,

    #[error("frame declares {declared} descriptors but {available} arrived")]
    MissingDescriptors { declared: usize, available: usize },

    #[error("frame carries {0} descriptors, limit is {MAX_FDS_PER_FRAME}")]
    TooManyDescriptors(usize),

    #[error("ancillary data was truncated")]
    ControlTruncated,
}

/// A decoded frame together with the descriptors it declared.
#[derive(Debug)]
pub struct Received {
    pub frame: Frame,
    pub fds: Vec<OwnedFd>,
}

/// Splits a connected stream into its reading and writing halves.
pub fn split(stream: UnixStream) -> (FrameReader, FrameWriter) {
    let stream = Arc::new(stream);
    (
        FrameReader {
            stream: Arc::clone(&stream),
            buf: Vec::new(),
            chunk: vec![0; READ_CHUNK],
            fds: VecDeque::new(),
        },
        FrameWriter { stream },
    )
}

pub struct FrameReader {
    stream: Arc<UnixStream>,
    buf: Vec<u8>,
    chunk: Vec<u8>,
    fds: VecDeque<OwnedFd>,
}

impl FrameReader {
    /// Reads the next frame. `Ok(None)` is a clean close between frames.
    pub async fn next(&mut self) -> Result<Option<Received>, TransportError> {
        loop {
            if let Some(frame) = frame::decode(&mut self.buf)? {
                let declared = frame.attached_fds();
                if declared > self.fds.len() {
                    return Err(TransportError::MissingDescriptors {
                        declared,
                        available: self.fds.len(),
                    });
                }
                let fds = self.fds.drain(..declared).collect();
                return Ok(Some(Received { frame, fds }));
            }

            if self.recv().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::UnexpectedEof);
            }
        }
    }

    async fn recv(&mut self) -> Result<usize, TransportError> {
        loop {
            self.stream.readable().await?;
            let stream = &self.stream;
            let chunk = &mut self.chunk;
            let fds = &mut self.fds;
            match stream.try_io(Interest::READABLE, || {
                recv_with_fds(stream.as_raw_fd(), chunk, fds)
            }) {
                Ok(n) => {
                    self.buf.extend_from_slice(&self.chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    return Err(TransportError::ControlTruncated);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[derive(Clone)]
pub struct FrameWriter {
    stream: Arc<UnixStream>,
}

impl FrameWriter {
    /// Writes one frame, attaching `fds` to its first byte.
    pub async fn send(&self, frame: &Frame, fds: &[OwnedFd]) -> Result<(), TransportError> {
        if fds.len() > MAX_FDS_PER_FRAME {
            return Err(TransportError::TooManyDescriptors(fds.len()));
        }
        let bytes = frame::encode(frame)?;
        debug_assert!(bytes.len() <= MAX_FRAME_LEN + frame::HEADER_LEN);

        let raw_fds: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        let mut written = 0;
        while written < bytes.len() {
            self.stream.writable().await?;
            // Descriptors ride along only with the first chunk.
            let attach: &[RawFd] = if written == 0 { &raw_fds } else { &[] };
            match self.stream.try_io(Interest::WRITABLE, || {
                send_with_fds(self.stream.as_raw_fd(), &bytes[written..], attach)
            }) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Shuts down both directions so the peer and our own reader see EOF.
    pub fn shutdown(&self) {
        // ENOTCONN after the peer already went away is fine.
        unsafe {
            libc::shutdown(self.stream.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

fn cmsg_space(fd_count: usize) -> usize {
    unsafe { libc::CMSG_SPACE((fd_count * mem::size_of::<libc::c_int>()) as libc::c_uint) as usize }
}

fn send_with_fds(socket: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    // u64 storage keeps the control buffer aligned for cmsghdr.
    let mut control: Vec<u64>;
    if !fds.is_empty() {
        let payload = (fds.len() * mem::size_of::<libc::c_int>()) as libc::c_uint;
        let space = cmsg_space(fds.len());
        control = vec![0; space.div_ceil(mem::size_of::<u64>())];
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload) as _;
            let data = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
            for (i, fd) in fds.iter().enumerate() {
                ptr::write_unaligned(data.add(i), *fd);
            }
        }
    }

    let n = unsafe { libc::sendmsg(socket, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn recv_with_fds(socket: RawFd, buf: &mut [u8], out: &mut VecDeque<OwnedFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let space = cmsg_space(MAX_FDS_PER_FRAME);
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    let n = unsafe { libc::recvmsg(socket, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let data = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
                for i in 0..payload / mem::size_of::<libc::c_int>() {
                    out.push_back(OwnedFd::from_raw_fd(ptr::read_unaligned(data.add(i))));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }
    Ok(n as usize)
}
