//! Event multiplexing
//!
//! Readiness waits over borrowed descriptors, plus [`SignalPipe`], which
//! turns asynchronous signal delivery into a readable descriptor so the
//! server loop observes child exits and shutdown requests in the same
//! `poll` as its sockets.

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use signal_hook::SigId;
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::raw::c_int;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

fn readable_flags(want_errors: bool) -> PollFlags {
    let mut flags = PollFlags::POLLIN | PollFlags::POLLHUP;
    if want_errors {
        flags |= PollFlags::POLLERR | PollFlags::POLLNVAL;
    }
    flags
}

fn is_set(fd: &PollFd<'_>, wanted: PollFlags) -> bool {
    fd.revents().is_some_and(|revents| revents.intersects(wanted))
}

fn poll_readable(
    fds: &[BorrowedFd<'_>],
    want_errors: bool,
    deadline: Option<Instant>,
) -> io::Result<Option<Vec<bool>>> {
    let mut poll_fds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();

    loop {
        let (timeout, remaining) = match deadline {
            None => (PollTimeout::NONE, None),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let ms = remaining.as_millis().min(u16::MAX as u128) as u16;
                (PollTimeout::from(ms), Some(remaining))
            }
        };

        match poll(&mut poll_fds, timeout) {
            Ok(0) if remaining.is_some_and(|r| r.is_zero()) => return Ok(None),
            Ok(0) => continue,
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }

    let ready: Vec<bool> = poll_fds
        .iter()
        .map(|fd| is_set(fd, readable_flags(want_errors)))
        .collect();
    if ready.iter().any(|r| *r) {
        return Ok(Some(ready));
    }

    // Only error bits fired; report those descriptors so the caller's next
    // read surfaces the failure instead of polling again
    Ok(Some(
        poll_fds
            .iter()
            .map(|fd| is_set(fd, readable_flags(true)))
            .collect(),
    ))
}

/// Block until at least one descriptor is readable
///
/// Returns one flag per input descriptor. Hang-up counts as readable so the
/// caller's next read observes end of stream. `POLLERR`/`POLLNVAL` count
/// when `want_errors` is set, or when nothing else is ready, so the result
/// always flags at least one descriptor.
pub fn select_readable(fds: &[BorrowedFd<'_>], want_errors: bool) -> io::Result<Vec<bool>> {
    Ok(poll_readable(fds, want_errors, None)?.unwrap_or_else(|| vec![false; fds.len()]))
}

/// Like [`select_readable`] but gives up after `timeout`, returning `None`
pub fn select_readable_timeout(
    fds: &[BorrowedFd<'_>],
    want_errors: bool,
    timeout: Duration,
) -> io::Result<Option<Vec<bool>>> {
    poll_readable(fds, want_errors, Some(Instant::now() + timeout))
}

/// Wait up to `timeout` for `fd` to become writable
pub fn select_writable_timeout(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    let mut poll_fds = [PollFd::new(fd, PollFlags::POLLOUT)];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let ms = remaining.as_millis().min(u16::MAX as u128) as u16;

        match poll(&mut poll_fds, PollTimeout::from(ms)) {
            Ok(0) if remaining.is_zero() => return Ok(false),
            Ok(0) => continue,
            Ok(_) => {
                return Ok(is_set(
                    &poll_fds[0],
                    PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR,
                ))
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
}

/// Self-pipe that becomes readable whenever one of its signals arrives
pub struct SignalPipe {
    read: UnixStream,
    ids: Vec<SigId>,
}

impl SignalPipe {
    /// Install handlers that write a byte into the pipe on each delivery
    pub fn register(signals: &[c_int]) -> io::Result<Self> {
        let (read, write) = UnixStream::pair()?;
        read.set_nonblocking(true)?;
        write.set_nonblocking(true)?;

        let mut ids = Vec::with_capacity(signals.len());
        for &signal in signals {
            match signal_hook::low_level::pipe::register(signal, write.try_clone()?) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for id in ids {
                        signal_hook::low_level::unregister(id);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self { read, ids })
    }

    /// Consume pending wakeups; true if any signal arrived since last drain
    pub fn drain(&self) -> io::Result<bool> {
        let mut buf = [0u8; 64];
        let mut seen = false;
        loop {
            match (&self.read).read(&mut buf) {
                Ok(0) => return Ok(seen),
                Ok(_) => seen = true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(seen),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl AsFd for SignalPipe {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
