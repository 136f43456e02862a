//! Descriptor-carrying message channel
//!
//! Wraps a connected Unix stream socket and moves [`WireMessage`] frames
//! across it. When a frame is sent with a descriptor, the descriptor rides
//! as `SCM_RIGHTS` on the same `sendmsg` as the frame's first byte, so it is
//! always queued on the receiving side before that frame can be complete.
//! Received descriptors wait in a FIFO, each tagged with the byte range of
//! the read that delivered it. A frame flagged with a descriptor must start
//! inside that range; a descriptor no frame can claim is a protocol error.

use crate::daemon::protocol::{decode_message, encode_frame, FrameDecoder, Received, WireMessage};
use crate::error::ProtocolError;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

const READ_CHUNK: usize = 8192;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

/// Descriptor received alongside the stream bytes `start..end`
#[derive(Debug)]
struct PendingFd {
    fd: OwnedFd,
    start: u64,
    end: u64,
}

/// Framed, descriptor-aware connection speaking message type `M`
pub struct Channel<M> {
    stream: UnixStream,
    decoder: FrameDecoder,
    fds: VecDeque<PendingFd>,
    /// Total bytes pushed into the decoder
    received: u64,
    _message: PhantomData<fn() -> M>,
}

impl<M: WireMessage> Channel<M> {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            fds: VecDeque::new(),
            received: 0,
            _message: PhantomData,
        }
    }

    /// Stream offset of the first byte still held by the decoder
    fn consumed(&self) -> u64 {
        self.received - self.decoder.buffered_len() as u64
    }

    /// Send one message, attaching `fd` when the message type carries one
    pub fn send(&mut self, message: &M, fd: Option<BorrowedFd<'_>>) -> Result<(), ProtocolError> {
        match (message.carries_fd(), fd.is_some()) {
            (true, false) => return Err(ProtocolError::MissingDescriptor),
            (false, true) => return Err(ProtocolError::UnexpectedDescriptor),
            _ => {}
        }

        let bytes = encode_frame(message, fd.is_some())?;
        tracing::trace!(kind = message.kind(), len = bytes.len(), fd = fd.is_some(), "send");

        let raw: Vec<RawFd> = fd.iter().map(|fd| fd.as_raw_fd()).collect();
        let mut sent = 0;
        while sent < bytes.len() {
            let iov = [IoSlice::new(&bytes[sent..])];
            // Descriptor goes with the first chunk only
            let cmsgs: Vec<ControlMessage<'_>> = if sent == 0 && !raw.is_empty() {
                vec![ControlMessage::ScmRights(&raw)]
            } else {
                Vec::new()
            };

            match sendmsg::<()>(self.stream.as_raw_fd(), &iov, &cmsgs, SEND_FLAGS, None) {
                Ok(0) => return Err(ProtocolError::Disconnected),
                Ok(n) => sent += n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                    return Err(ProtocolError::Disconnected)
                }
                Err(e) => return Err(ProtocolError::Io(io::Error::from(e))),
            }
        }
        Ok(())
    }

    /// Block until one complete message is available
    pub fn recv(&mut self) -> Result<Received<M>, ProtocolError> {
        loop {
            if let Some(received) = self.recv_buffered()? {
                return Ok(received);
            }
            self.read_available()?;
        }
    }

    /// Return a message already sitting in the buffer, without reading
    pub fn recv_buffered(&mut self) -> Result<Option<Received<M>>, ProtocolError> {
        let start = self.consumed();
        let Some(frame) = self.decoder.next_frame()? else {
            // Every frame that began in the front descriptor's read is done
            if self.fds.front().is_some_and(|pending| pending.end <= start) {
                return Err(ProtocolError::UnexpectedDescriptor);
            }
            return Ok(None);
        };
        let end = self.consumed();

        let front = self.fds.front().map(|pending| (pending.start, pending.end));
        let fd = match front {
            Some((_, fd_end)) if fd_end <= start => {
                return Err(ProtocolError::UnexpectedDescriptor)
            }
            Some((fd_start, _)) if frame.has_fd && fd_start <= start => {
                self.fds.pop_front().map(|pending| pending.fd)
            }
            _ if frame.has_fd => return Err(ProtocolError::MissingDescriptor),
            // No later frame can start inside that read
            Some((_, fd_end)) if fd_end <= end => {
                return Err(ProtocolError::UnexpectedDescriptor)
            }
            _ => None,
        };

        let received = decode_message::<M>(frame, fd)?;
        tracing::trace!(kind = received.message.kind(), fd = received.fd.is_some(), "recv");
        Ok(Some(received))
    }

    /// Perform exactly one read from the socket
    ///
    /// Call after the socket polled readable; follow with
    /// [`Channel::recv_buffered`] until it yields `None`. End of stream is
    /// reported as [`ProtocolError::Disconnected`].
    pub fn read_available(&mut self) -> Result<usize, ProtocolError> {
        let mut buf = [0u8; READ_CHUNK];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 4]);

        let (bytes, received_fds, truncated) = loop {
            let mut iov = [IoSliceMut::new(&mut buf)];
            match recvmsg::<()>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::empty(),
            ) {
                Ok(msg) => {
                    let mut fds = Vec::new();
                    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                        if let ControlMessageOwned::ScmRights(received) = cmsg {
                            fds.extend(received);
                        }
                    }
                    break (msg.bytes, fds, msg.flags.contains(MsgFlags::MSG_CTRUNC));
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) => return Err(ProtocolError::Disconnected),
                Err(e) => return Err(ProtocolError::Io(io::Error::from(e))),
            }
        };

        let start = self.received;
        let end = start + bytes as u64;
        for raw in received_fds {
            // SAFETY: SCM_RIGHTS installed a fresh descriptor that nothing else owns
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };
            let _ = fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC));
            self.fds.push_back(PendingFd { fd, start, end });
        }

        if truncated {
            tracing::warn!("ancillary data truncated; descriptors were lost");
        }

        if bytes == 0 {
            return Err(ProtocolError::Disconnected);
        }

        self.decoder.push(&buf[..bytes]);
        self.received = end;
        Ok(bytes)
    }
}

impl<M> AsFd for Channel<M> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}
