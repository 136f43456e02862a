/// Detached pty session daemon
///
/// - `socket_path`: pid to socket path mapping and directory scan
/// - `protocol`: message types and length-prefixed bincode framing
/// - `channel`: frame transport that carries one descriptor per frame
/// - `select`: poll-based readiness and the signal self-pipe
/// - `launcher`: openpty + fork + exec
/// - `server`: multi-child server with reconnect replay
/// - `legacy`: single-child, single-client server
/// - `client`: attach by pid, launch, wait

pub mod socket_path;
pub mod protocol;
pub mod channel;
pub mod select;
pub mod launcher;
pub mod server;
pub mod legacy;
pub mod client;

pub use channel::Channel;
pub use client::{
    connect_legacy, Attachment, LaunchedSession, LegacyAttachment, ReportedChild, ServerConnection,
};
pub use launcher::{launch, LaunchOptions, LaunchedChild};
pub use legacy::{LegacyExit, LegacyServer, LegacyState};
pub use protocol::{
    ExitStatus, LaunchRequest, LegacyMessage, Message, WaitResult, WireMessage,
    MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, VERSION_REJECTED,
};
pub use server::{ChildRecord, ExitReason, MultiServer};
pub use socket_path::SocketPaths;
