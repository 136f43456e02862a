//! ptyd client
//!
//! Connects to a server by pid, performs the handshake, and collects the
//! replayed children so a restarted GUI can pick up where it left off.

use crate::daemon::channel::Channel;
use crate::daemon::protocol::{
    HandshakeRequest, LaunchRequest, LegacyMessage, Message, Received, WaitRequest, WaitResult,
    WireMessage, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use crate::daemon::select::{select_readable_timeout, select_writable_timeout};
use crate::daemon::socket_path::SocketPaths;
use crate::error::{ClientError, ProtocolError};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

/// How long a non-blocking connect may stay in progress
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A child the server already had when we attached
#[derive(Debug)]
pub struct ReportedChild {
    pub pid: i32,
    pub tty: String,
    pub terminated: bool,
    pub launch: LaunchRequest,
    pub master: OwnedFd,
}

/// A child started through [`ServerConnection::launch`]
#[derive(Debug)]
pub struct LaunchedSession {
    pub pid: i32,
    pub tty: String,
    pub unique_id: u64,
    pub master: OwnedFd,
}

/// Result of a successful attach
pub struct Attachment {
    pub connection: ServerConnection,
    pub children: Vec<ReportedChild>,
}

/// Handshaken connection to a multi-child server
pub struct ServerConnection {
    channel: Channel<Message>,
    server_pid: i32,
    protocol_version: i32,
    terminations: VecDeque<i32>,
}

impl ServerConnection {
    /// Attach to the server running as `pid`
    pub fn connect(paths: &SocketPaths, pid: i32) -> Result<Attachment, ClientError> {
        let stream = connect_stream(&paths.path_for(pid))?;
        let mut channel = Channel::new(stream);

        let request = Message::HandshakeRequest(HandshakeRequest {
            max_protocol_version: PROTOCOL_VERSION,
        });
        if let Err(e) = channel.send(&request, None) {
            // A rejected client may find the socket already closed; the
            // rejection itself can still be waiting to be read
            if !e.is_disconnect() {
                return Err(e.into());
            }
        }

        let response = match channel.recv()?.message {
            Message::HandshakeResponse(response) => response,
            other => return Err(unexpected(&other)),
        };
        if response.is_rejected() {
            return Err(ClientError::Rejected);
        }
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&response.protocol_version) {
            return Err(ClientError::IncompatibleVersion(response.protocol_version));
        }

        let mut connection = ServerConnection {
            channel,
            server_pid: response.pid,
            protocol_version: response.protocol_version,
            terminations: VecDeque::new(),
        };

        let expected = usize::try_from(response.num_children).unwrap_or(0);
        let mut children = Vec::with_capacity(expected);
        while children.len() < expected {
            let received = connection.next_response()?;
            match received.message {
                Message::ReportChild(report) => children.push(ReportedChild {
                    pid: report.pid,
                    tty: report.tty,
                    terminated: report.terminated,
                    launch: report.launch,
                    master: received.fd.ok_or(ProtocolError::MissingDescriptor)?,
                }),
                other => return Err(unexpected(&other)),
            }
        }

        tracing::debug!(server = response.pid, children = children.len(), "attached");
        Ok(Attachment {
            connection,
            children,
        })
    }

    pub fn server_pid(&self) -> i32 {
        self.server_pid
    }

    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    /// Ask the server to start a new child
    pub fn launch(&mut self, request: LaunchRequest) -> Result<LaunchedSession, ClientError> {
        self.channel.send(&Message::LaunchRequest(request), None)?;

        let received = self.next_response()?;
        match received.message {
            Message::LaunchResponse(response) if response.status != 0 => {
                Err(ClientError::LaunchFailed(response.status))
            }
            Message::LaunchResponse(response) => Ok(LaunchedSession {
                pid: response.pid,
                tty: response.tty,
                unique_id: response.unique_id,
                master: received.fd.ok_or(ProtocolError::MissingDescriptor)?,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Query a child's status, optionally releasing it while still running
    pub fn wait(&mut self, pid: i32, remove_preemptively: bool) -> Result<WaitResult, ClientError> {
        let request = Message::WaitRequest(WaitRequest {
            pid,
            remove_preemptively,
        });
        self.channel.send(&request, None)?;

        match self.next_response()?.message {
            Message::WaitResponse(response) if response.pid == pid => Ok(response.result),
            other => Err(unexpected(&other)),
        }
    }

    /// Termination notices received so far, oldest first
    pub fn take_terminations(&mut self) -> Vec<i32> {
        self.terminations.drain(..).collect()
    }

    /// Wait up to `timeout` for the next Termination notice
    pub fn next_termination(&mut self, timeout: Duration) -> Result<Option<i32>, ClientError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(pid) = self.terminations.pop_front() {
                return Ok(Some(pid));
            }

            if let Some(received) = self.channel.recv_buffered()? {
                self.queue_unsolicited(received)?;
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let ready = select_readable_timeout(&[self.channel.as_fd()], true, remaining)
                .map_err(ProtocolError::Io)?;
            if ready.is_none() {
                return Ok(None);
            }
            self.channel.read_available()?;
        }
    }

    /// Next message that is not a Termination notice
    fn next_response(&mut self) -> Result<Received<Message>, ClientError> {
        loop {
            let received = self.channel.recv()?;
            if let Message::Termination(notice) = &received.message {
                self.terminations.push_back(notice.pid);
                continue;
            }
            return Ok(received);
        }
    }

    fn queue_unsolicited(&mut self, received: Received<Message>) -> Result<(), ClientError> {
        match received.message {
            Message::Termination(notice) => {
                self.terminations.push_back(notice.pid);
                Ok(())
            }
            other => Err(unexpected(&other)),
        }
    }
}

/// What a legacy server hands its one client
pub struct LegacyAttachment {
    pub master: OwnedFd,
    pub child_pid: i32,
    /// Held open; the server ends when this closes
    _channel: Channel<LegacyMessage>,
}

/// Attach to a legacy single-child server running as `pid`
pub fn connect_legacy(paths: &SocketPaths, pid: i32) -> Result<LegacyAttachment, ClientError> {
    let stream = connect_stream(&paths.path_for(pid))?;
    let mut channel: Channel<LegacyMessage> = Channel::new(stream);

    let master = match channel.recv()? {
        Received {
            message: LegacyMessage::Master,
            fd: Some(fd),
        } => fd,
        other => return Err(unexpected(&other.message)),
    };
    let child_pid = match channel.recv()?.message {
        LegacyMessage::ChildPid(pid) => pid,
        other => return Err(unexpected(&other)),
    };

    Ok(LegacyAttachment {
        master,
        child_pid,
        _channel: channel,
    })
}

fn unexpected<M: WireMessage>(message: &M) -> ClientError {
    ClientError::UnexpectedMessage(message.kind().to_string())
}

/// Connect without blocking indefinitely on a wedged listener
fn connect_stream(path: &Path) -> Result<UnixStream, ClientError> {
    let fail = |source: io::Error| ClientError::Connect {
        path: path.to_path_buf(),
        source,
    };

    let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None)
        .map_err(|e| fail(e.into()))?;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| fail(e.into()))?;

    let stream = UnixStream::from(fd);
    stream.set_nonblocking(true).map_err(fail)?;

    let addr = UnixAddr::new(path).map_err(|e| fail(e.into()))?;
    match connect(stream.as_raw_fd(), &addr) {
        Ok(()) => {}
        // EAGAIN on a Unix socket means the backlog is full, not in progress
        Err(Errno::EINPROGRESS) => {
            if !select_writable_timeout(stream.as_fd(), CONNECT_TIMEOUT).map_err(fail)? {
                return Err(fail(io::Error::from(io::ErrorKind::TimedOut)));
            }
            if let Some(e) = stream.take_error().map_err(fail)? {
                return Err(fail(e));
            }
        }
        Err(e) => return Err(fail(e.into())),
    }

    stream.set_nonblocking(false).map_err(fail)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_missing_socket_fails_fast() {
        let dir = tempfile::TempDir::new().unwrap();
        let start = Instant::now();
        let err = ServerConnection::connect(&SocketPaths::new(dir.path()), 424242).err().unwrap();
        assert!(matches!(err, ClientError::Connect { .. }));
        assert!(start.elapsed() < CONNECT_TIMEOUT);
    }

    #[test]
    fn test_connect_refused_by_stale_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = SocketPaths::new(dir.path());
        // Bound then dropped: the path exists but nobody listens
        drop(std::os::unix::net::UnixListener::bind(paths.path_for(77)).unwrap());

        let err = ServerConnection::connect(&paths, 77).err().unwrap();
        match err {
            ClientError::Connect { source, .. } => {
                assert_eq!(source.raw_os_error(), Some(libc::ECONNREFUSED))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_full_backlog_is_a_connect_error() {
        use nix::sys::socket::{bind, listen, Backlog};

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("backlog");
        let listener =
            socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None).unwrap();
        bind(listener.as_raw_fd(), &UnixAddr::new(&path).unwrap()).unwrap();
        listen(&listener, Backlog::new(0).unwrap()).unwrap();

        // Nobody accepts, so the queue fills after a connection or two
        let mut queued = Vec::new();
        let mut refusal = None;
        for _ in 0..16 {
            match connect_stream(&path) {
                Ok(stream) => queued.push(stream),
                Err(e) => {
                    refusal = Some(e);
                    break;
                }
            }
        }

        match refusal {
            Some(ClientError::Connect { source, .. }) => {
                assert_eq!(source.raw_os_error(), Some(libc::EAGAIN))
            }
            other => panic!("expected a connect error, got {:?}", other),
        }
        assert!(queued.len() <= 2);
    }

    #[test]
    fn test_legacy_connect_missing_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            connect_legacy(&SocketPaths::new(dir.path()), 31337),
            Err(ClientError::Connect { .. })
        ));
    }
}
