//! Error types for the PTY session server
//!
//! Library boundaries return these typed errors; the binary and the server
//! loop wrap them in `anyhow`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while moving frames across a connection
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying socket failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the connection
    #[error("peer disconnected")]
    Disconnected,

    /// Declared frame length exceeds the protocol maximum
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Declared frame length cannot hold the frame header
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// Payload bytes do not form a valid message
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Message type requires a descriptor but none was attached
    #[error("expected an attached file descriptor")]
    MissingDescriptor,

    /// A descriptor arrived with a message type that never carries one
    #[error("unexpected file descriptor attached to message")]
    UnexpectedDescriptor,
}

impl ProtocolError {
    /// True when the peer went away rather than sending garbage
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::Disconnected => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

/// Errors produced by the child launcher
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Path, argument, environment entry, or directory has an interior NUL
    #[error("invalid launch argument: {0}")]
    InvalidArgument(String),

    /// Pseudo-terminal allocation failed
    #[error("failed to allocate pty: {0}")]
    Pty(nix::Error),

    /// fork(2) failed
    #[error("failed to fork: {0}")]
    Fork(nix::Error),

    /// The child could not exec the requested program
    #[error("failed to exec: {0}")]
    Exec(nix::Error),
}

impl LaunchError {
    /// Negative status reported to clients in a Launch response
    pub fn status(&self) -> i32 {
        let errno = match self {
            LaunchError::InvalidArgument(_) => nix::errno::Errno::EINVAL,
            LaunchError::Pty(e) | LaunchError::Fork(e) | LaunchError::Exec(e) => *e,
        };
        match -(errno as i32) {
            0 => -1,
            status => status,
        }
    }
}

/// Errors seen by a client attaching to a server
#[derive(Debug, Error)]
pub enum ClientError {
    /// The socket could not be reached
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The server answered the handshake with a rejection
    #[error("server rejected the connection")]
    Rejected,

    /// The server speaks a protocol version this client does not
    #[error("incompatible protocol version {0}")]
    IncompatibleVersion(i32),

    /// Transport failure after connecting
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server sent a message that does not answer the pending request
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// The server could not start the requested program
    #[error("launch failed with status {0}")]
    LaunchFailed(i32),
}
