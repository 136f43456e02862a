//! ptyd wire protocol
//!
//! Every message travels as one length-prefixed frame:
//!
//! ```text
//! ┌────────────┬─────────┬──────────────────────┐
//! │   Length   │  Flags  │  Payload (bincode)   │
//! │  (4 bytes) │ (1 byte)│  (variable length)   │
//! └────────────┴─────────┴──────────────────────┘
//! ```
//!
//! `Length` is little-endian and counts the flags byte plus the payload.
//! Bit 0 of `Flags` says that exactly one file descriptor rides alongside
//! the frame as `SCM_RIGHTS` ancillary data (see [`crate::daemon::channel`]).
//! Descriptor numbers are never written into payloads.
//!
//! The multi-child server speaks [`Message`]; the legacy single-child server
//! speaks [`LegacyMessage`]. Both go through the same codec via
//! [`WireMessage`].

use crate::error::ProtocolError;
use bincode::Options;
use nix::sys::wait::WaitStatus;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::OwnedFd;

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: i32 = 2;

/// Oldest client version the server accepts
pub const MIN_PROTOCOL_VERSION: i32 = 2;

/// Handshake version meaning "connection refused"
pub const VERSION_REJECTED: i32 = -1;

/// Maximum frame length (flags + payload)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const LENGTH_PREFIX_LEN: usize = 4;
const FLAGS_LEN: usize = 1;
const FLAG_HAS_FD: u8 = 0x01;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_FRAME_SIZE as u64)
        .reject_trailing_bytes()
}

/// A message type that can travel through the frame codec
pub trait WireMessage: Serialize + DeserializeOwned + fmt::Debug {
    /// Whether this message is always accompanied by a file descriptor
    fn carries_fd(&self) -> bool;

    /// Short name used in logs
    fn kind(&self) -> &'static str;
}

// =============================================================================
// Multi-child server messages
// =============================================================================

/// Everything needed to start a child, kept by the server for replays
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Executable to run (not searched in PATH)
    pub path: String,
    /// Full argument vector including argv[0]
    pub argv: Vec<String>,
    /// Environment as `KEY=value` entries
    pub envp: Vec<String>,
    /// Initial working directory; empty keeps the server's
    pub pwd: String,
    pub columns: u16,
    pub rows: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
    pub is_utf8: bool,
    /// Opaque id chosen by the client
    pub unique_id: u64,
}

/// How a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Exited(i32),
    Signaled { signal: i32, core_dumped: bool },
    /// The process was reaped by someone else
    Unknown,
}

impl ExitStatus {
    /// Final status for a terminated child, `None` while it still runs
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
            WaitStatus::Signaled(_, signal, core_dumped) => Some(ExitStatus::Signaled {
                signal: signal as i32,
                core_dumped,
            }),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit {}", code),
            ExitStatus::Signaled { signal, core_dumped: true } => {
                write!(f, "signal {} (core dumped)", signal)
            }
            ExitStatus::Signaled { signal, .. } => write!(f, "signal {}", signal),
            ExitStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of a Wait request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitResult {
    /// Child terminated; its record is now gone
    Exited(ExitStatus),
    /// Pre-emptive release accepted; the server no longer reports the child
    Released,
    /// Child is still running and release was not requested
    StillRunning,
    /// No reportable child has this pid
    NoSuchChild,
}

/// Client handshake (Client → Server)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub max_protocol_version: i32,
}

/// Server handshake (Server → Client)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Negotiated version, or [`VERSION_REJECTED`]
    pub protocol_version: i32,
    /// Server process id
    pub pid: i32,
    /// Number of `ReportChild` messages that follow
    pub num_children: i32,
}

impl HandshakeResponse {
    pub fn rejected(pid: i32) -> Self {
        Self {
            protocol_version: VERSION_REJECTED,
            pid,
            num_children: 0,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.protocol_version == VERSION_REJECTED
    }
}

/// Launch result (Server → Client); carries the master descriptor on success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchResponse {
    /// 0 on success, negative errno on failure
    pub status: i32,
    pub pid: i32,
    pub unique_id: u64,
    /// Slave device path, empty on failure
    pub tty: String,
}

/// Wait request (Client → Server)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitRequest {
    pub pid: i32,
    /// Stop tracking a running child and release its master now
    pub remove_preemptively: bool,
}

/// Wait result (Server → Client)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitResponse {
    pub pid: i32,
    pub result: WaitResult,
}

/// Unsolicited notice that a child terminated (Server → Client)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Termination {
    pub pid: i32,
}

/// Replay of one existing child after a handshake (Server → Client);
/// always carries a duplicate of the child's master descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportChild {
    pub is_last: bool,
    pub pid: i32,
    pub tty: String,
    pub terminated: bool,
    pub launch: LaunchRequest,
}

/// Message envelope containing all multi-server message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    LaunchRequest(LaunchRequest),
    LaunchResponse(LaunchResponse),
    WaitRequest(WaitRequest),
    WaitResponse(WaitResponse),
    Termination(Termination),
    ReportChild(ReportChild),
}

impl Message {
    /// Whether a client is allowed to send this message
    pub fn is_client_originated(&self) -> bool {
        matches!(
            self,
            Message::HandshakeRequest(_) | Message::LaunchRequest(_) | Message::WaitRequest(_)
        )
    }
}

impl WireMessage for Message {
    fn carries_fd(&self) -> bool {
        match self {
            Message::LaunchResponse(response) => response.status == 0,
            Message::ReportChild(_) => true,
            _ => false,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Message::HandshakeRequest(_) => "handshake-request",
            Message::HandshakeResponse(_) => "handshake-response",
            Message::LaunchRequest(_) => "launch-request",
            Message::LaunchResponse(_) => "launch-response",
            Message::WaitRequest(_) => "wait-request",
            Message::WaitResponse(_) => "wait-response",
            Message::Termination(_) => "termination",
            Message::ReportChild(_) => "report-child",
        }
    }
}

// =============================================================================
// Legacy single-child server messages
// =============================================================================

/// Messages sent by the legacy server, in this order, once per connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegacyMessage {
    /// Carries the pty master descriptor
    Master,
    /// The child's process id
    ChildPid(i32),
}

impl WireMessage for LegacyMessage {
    fn carries_fd(&self) -> bool {
        matches!(self, LegacyMessage::Master)
    }

    fn kind(&self) -> &'static str {
        match self {
            LegacyMessage::Master => "legacy-master",
            LegacyMessage::ChildPid(_) => "legacy-child-pid",
        }
    }
}

// =============================================================================
// Framing
// =============================================================================

/// One complete frame pulled off the byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub has_fd: bool,
    pub payload: Vec<u8>,
}

/// A decoded message plus the descriptor that came with it
#[derive(Debug)]
pub struct Received<M> {
    pub message: M,
    pub fd: Option<OwnedFd>,
}

/// Encode a message into the wire format
pub fn encode_frame<M: WireMessage>(message: &M, has_fd: bool) -> Result<Vec<u8>, ProtocolError> {
    let payload = codec()
        .serialize(message)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let frame_len = FLAGS_LEN + payload.len();
    if frame_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(frame_len));
    }

    let mut buffer = Vec::with_capacity(LENGTH_PREFIX_LEN + frame_len);
    buffer.extend_from_slice(&(frame_len as u32).to_le_bytes());
    buffer.push(if has_fd { FLAG_HAS_FD } else { 0 });
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

/// Incremental frame parser
///
/// Bytes are pushed as they arrive; complete frames are popped in order.
/// A partial frame stays buffered until the rest shows up.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as frames
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buffer.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
        len_bytes.copy_from_slice(&self.buffer[..LENGTH_PREFIX_LEN]);
        let frame_len = u32::from_le_bytes(len_bytes) as usize;

        if frame_len < FLAGS_LEN {
            return Err(ProtocolError::FrameTooShort(frame_len));
        }
        if frame_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(frame_len));
        }

        let total = LENGTH_PREFIX_LEN + frame_len;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let flags = self.buffer[LENGTH_PREFIX_LEN];
        let payload = self.buffer[LENGTH_PREFIX_LEN + FLAGS_LEN..total].to_vec();
        self.buffer.drain(..total);

        Ok(Some(Frame {
            has_fd: flags & FLAG_HAS_FD != 0,
            payload,
        }))
    }
}

/// Decode a frame and pair it with the descriptor received alongside it
pub fn decode_message<M: WireMessage>(
    frame: Frame,
    fd: Option<OwnedFd>,
) -> Result<Received<M>, ProtocolError> {
    match (frame.has_fd, fd.is_some()) {
        (true, false) => return Err(ProtocolError::MissingDescriptor),
        (false, true) => return Err(ProtocolError::UnexpectedDescriptor),
        _ => {}
    }

    let message: M = codec().deserialize(&frame.payload).map_err(|e| {
        tracing::debug!("undecodable frame:\n{}", hex_dump(&frame.payload));
        ProtocolError::Malformed(e.to_string())
    })?;

    match (message.carries_fd(), fd.is_some()) {
        (true, false) => Err(ProtocolError::MissingDescriptor),
        (false, true) => Err(ProtocolError::UnexpectedDescriptor),
        _ => Ok(Received { message, fd }),
    }
}

/// Render bytes as offset-prefixed rows of 16 hex values
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        out.push_str(&format!("{:04x}  {}\n", row * 16, hex.join(" ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn dev_null() -> OwnedFd {
        File::open("/dev/null").unwrap().into()
    }

    fn sample_launch() -> LaunchRequest {
        LaunchRequest {
            path: "/bin/zsh".to_string(),
            argv: vec!["-zsh".to_string()],
            envp: vec!["HOME=/home/test".to_string(), "LANG=en_US.UTF-8".to_string()],
            pwd: "/home/test".to_string(),
            columns: 80,
            rows: 24,
            pixel_width: 640,
            pixel_height: 384,
            is_utf8: true,
            unique_id: 0xfeed_beef,
        }
    }

    fn roundtrip(message: Message, fd: Option<OwnedFd>) -> Received<Message> {
        let encoded = encode_frame(&message, fd.is_some()).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoder.buffered_len(), 0);
        let received: Received<Message> = decode_message(frame, fd).unwrap();
        assert_eq!(received.message, message);
        received
    }

    #[test]
    fn test_roundtrip_messages_without_descriptor() {
        let messages = vec![
            Message::HandshakeRequest(HandshakeRequest { max_protocol_version: 2 }),
            Message::HandshakeResponse(HandshakeResponse {
                protocol_version: 2,
                pid: 1234,
                num_children: 3,
            }),
            Message::HandshakeResponse(HandshakeResponse::rejected(1234)),
            Message::LaunchRequest(sample_launch()),
            Message::LaunchResponse(LaunchResponse {
                status: -2,
                pid: 0,
                unique_id: 9,
                tty: String::new(),
            }),
            Message::WaitRequest(WaitRequest { pid: 77, remove_preemptively: true }),
            Message::WaitResponse(WaitResponse {
                pid: 77,
                result: WaitResult::Exited(ExitStatus::Signaled { signal: 9, core_dumped: false }),
            }),
            Message::WaitResponse(WaitResponse { pid: 78, result: WaitResult::StillRunning }),
            Message::WaitResponse(WaitResponse { pid: 79, result: WaitResult::NoSuchChild }),
            Message::WaitResponse(WaitResponse { pid: 80, result: WaitResult::Released }),
            Message::Termination(Termination { pid: 81 }),
        ];

        for message in messages {
            let received = roundtrip(message, None);
            assert!(received.fd.is_none());
        }
    }

    #[test]
    fn test_roundtrip_messages_with_descriptor() {
        let launch = Message::LaunchResponse(LaunchResponse {
            status: 0,
            pid: 4321,
            unique_id: 5,
            tty: "/dev/pts/7".to_string(),
        });
        assert!(roundtrip(launch, Some(dev_null())).fd.is_some());

        let report = Message::ReportChild(ReportChild {
            is_last: true,
            pid: 4321,
            tty: "/dev/pts/7".to_string(),
            terminated: false,
            launch: sample_launch(),
        });
        assert!(roundtrip(report, Some(dev_null())).fd.is_some());
    }

    #[test]
    fn test_legacy_messages_roundtrip() {
        for (message, fd) in [
            (LegacyMessage::Master, Some(dev_null())),
            (LegacyMessage::ChildPid(99), None),
        ] {
            let encoded = encode_frame(&message, fd.is_some()).unwrap();
            let mut decoder = FrameDecoder::new();
            decoder.push(&encoded);
            let frame = decoder.next_frame().unwrap().unwrap();
            let received: Received<LegacyMessage> = decode_message(frame, fd).unwrap();
            assert_eq!(received.message, message);
        }
    }

    #[test]
    fn test_partial_input_is_not_an_error() {
        let encoded = encode_frame(&Message::Termination(Termination { pid: 3 }), false).unwrap();
        let mut decoder = FrameDecoder::new();

        for byte in &encoded[..encoded.len() - 1] {
            decoder.push(std::slice::from_ref(byte));
            assert!(decoder.next_frame().unwrap().is_none());
        }
        decoder.push(&encoded[encoded.len() - 1..]);
        assert!(decoder.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut bytes = encode_frame(&Message::Termination(Termination { pid: 1 }), false).unwrap();
        bytes.extend(encode_frame(&Message::Termination(Termination { pid: 2 }), false).unwrap());
        bytes.extend_from_slice(&[0x10, 0x00]);

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        for expected in [1, 2] {
            let frame = decoder.next_frame().unwrap().unwrap();
            let received: Received<Message> = decode_message(frame, None).unwrap();
            assert_eq!(received.message, Message::Termination(Termination { pid: expected }));
        }
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered_len(), 2);
    }

    #[test]
    fn test_rejects_zero_length_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&0u32.to_le_bytes());
        assert!(matches!(decoder.next_frame(), Err(ProtocolError::FrameTooShort(0))));
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&((MAX_FRAME_SIZE + 1) as u32).to_le_bytes());
        assert!(matches!(decoder.next_frame(), Err(ProtocolError::FrameTooLarge(_))));
    }

    #[test]
    fn test_rejects_garbage_payload() {
        let frame = Frame { has_fd: false, payload: vec![0xff, 0xff, 0xff, 0xff, 0x01] };
        let result: Result<Received<Message>, _> = decode_message(frame, None);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_rejects_trailing_payload_bytes() {
        let encoded = encode_frame(&Message::Termination(Termination { pid: 1 }), false).unwrap();
        let mut payload = encoded[LENGTH_PREFIX_LEN + FLAGS_LEN..].to_vec();
        payload.push(0);
        let result: Result<Received<Message>, _> =
            decode_message(Frame { has_fd: false, payload }, None);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_descriptor_mismatches() {
        let report = Message::ReportChild(ReportChild {
            is_last: true,
            pid: 1,
            tty: String::new(),
            terminated: true,
            launch: LaunchRequest::default(),
        });

        // Flagged but nothing arrived
        let frame = Frame {
            has_fd: true,
            payload: codec().serialize(&report).unwrap(),
        };
        let result: Result<Received<Message>, _> = decode_message(frame, None);
        assert!(matches!(result, Err(ProtocolError::MissingDescriptor)));

        // Message type needs one but the frame has none
        let frame = Frame {
            has_fd: false,
            payload: codec().serialize(&report).unwrap(),
        };
        let result: Result<Received<Message>, _> = decode_message(frame, None);
        assert!(matches!(result, Err(ProtocolError::MissingDescriptor)));

        // Message type never carries one
        let termination = Message::Termination(Termination { pid: 1 });
        let frame = Frame {
            has_fd: true,
            payload: codec().serialize(&termination).unwrap(),
        };
        let result: Result<Received<Message>, _> = decode_message(frame, Some(dev_null()));
        assert!(matches!(result, Err(ProtocolError::UnexpectedDescriptor)));
    }

    #[test]
    fn test_failed_launch_response_has_no_descriptor() {
        let failed = Message::LaunchResponse(LaunchResponse {
            status: -1,
            pid: 0,
            unique_id: 0,
            tty: String::new(),
        });
        assert!(!failed.carries_fd());
    }

    #[test]
    fn test_client_originated_classification() {
        assert!(Message::WaitRequest(WaitRequest { pid: 1, remove_preemptively: false })
            .is_client_originated());
        assert!(!Message::Termination(Termination { pid: 1 }).is_client_originated());
    }

    #[test]
    fn test_exit_status_from_wait_status() {
        use nix::sys::signal::Signal;
        use nix::unistd::Pid;

        let pid = Pid::from_raw(10);
        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::Exited(pid, 3)),
            Some(ExitStatus::Exited(3))
        );
        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(ExitStatus::Signaled { signal: 9, core_dumped: false })
        );
        assert_eq!(ExitStatus::from_wait_status(WaitStatus::StillAlive), None);
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Unknown.success());
    }

    #[test]
    fn test_hex_dump_layout() {
        let dump = hex_dump(&(0u8..18).collect::<Vec<_>>());
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000  00 01 02"));
        assert_eq!(lines[1], "0010  10 11");
    }
}
