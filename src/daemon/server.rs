//! Multi-child server
//!
//! A long-lived process that owns the master side of every pty it launched
//! and hands duplicates of those descriptors to one client at a time. When
//! the client goes away the children keep running; the next client that
//! connects gets every reportable child replayed after its handshake.
//!
//! The loop is single threaded and blocks only in [`select_readable`].
//! `SIGCHLD` arrives through a [`SignalPipe`] so reaping happens in the same
//! loop as socket traffic.

use crate::config::ServerConfig;
use crate::daemon::channel::Channel;
use crate::daemon::launcher::{self, LaunchOptions};
use crate::daemon::protocol::{
    ExitStatus, HandshakeRequest, HandshakeResponse, LaunchRequest, LaunchResponse, Message,
    ReportChild, Termination, WaitRequest, WaitResponse, WaitResult, WireMessage,
    MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use crate::daemon::select::{select_readable, SignalPipe};
use crate::daemon::socket_path::SocketPaths;
use crate::error::ProtocolError;
use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::fs;
use std::os::fd::{AsFd, OwnedFd};
use std::os::raw::c_int;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Why [`MultiServer::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The client disconnected and no reportable child remains
    NoReportableChildren,
    /// A shutdown signal arrived
    ShutdownRequested,
}

/// One supervised process
#[derive(Debug)]
pub struct ChildRecord {
    pid: Pid,
    master: Option<OwnedFd>,
    tty: String,
    launch: LaunchRequest,
    status: Option<ExitStatus>,
    will_terminate: bool,
}

impl ChildRecord {
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn is_terminated(&self) -> bool {
        self.status.is_some()
    }

    /// Reportable children are replayed on connect and answer Wait
    pub fn is_reportable(&self) -> bool {
        !self.will_terminate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    AwaitingHandshake,
    Active,
}

struct Connection {
    channel: Channel<Message>,
    state: ConnectionState,
}

/// Daemon supervising any number of pty children
pub struct MultiServer {
    socket_path: PathBuf,
    listener: UnixListener,
    sigchld: SignalPipe,
    shutdown: Option<SignalPipe>,
    connection: Option<Connection>,
    children: Vec<ChildRecord>,
    launch_options: LaunchOptions,
    pid: i32,
}

impl MultiServer {
    /// Bind the socket for this process and install the SIGCHLD pipe
    pub fn bind(paths: &SocketPaths, config: &ServerConfig) -> Result<Self> {
        let pid = nix::unistd::getpid().as_raw();
        let socket_path = paths.path_for(pid);
        let listener = bind_socket(&socket_path)?;

        let sigchld = SignalPipe::register(&[signal_hook::consts::SIGCHLD])
            .context("failed to install SIGCHLD handler")?;

        info!(pid, socket = %socket_path.display(), "server listening");

        Ok(Self {
            socket_path,
            listener,
            sigchld,
            shutdown: None,
            connection: None,
            children: Vec::new(),
            launch_options: config.launch_options(),
            pid,
        })
    }

    /// Return [`ExitReason::ShutdownRequested`] when any of `signals` arrives
    pub fn with_shutdown_signals(mut self, signals: &[c_int]) -> Result<Self> {
        let pipe = SignalPipe::register(signals).context("failed to install shutdown handler")?;
        self.shutdown = Some(pipe);
        Ok(self)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn children(&self) -> &[ChildRecord] {
        &self.children
    }

    pub fn reportable_count(&self) -> usize {
        self.children.iter().filter(|c| c.is_reportable()).count()
    }

    /// Serve until the last reportable child is gone with no client attached,
    /// or until shutdown is requested
    pub fn run(&mut self) -> Result<ExitReason> {
        loop {
            let (ready, shutdown_at, connection_at) = {
                let mut fds = vec![self.sigchld.as_fd(), self.listener.as_fd()];
                let shutdown_at = self.shutdown.as_ref().map(|pipe| {
                    fds.push(pipe.as_fd());
                    fds.len() - 1
                });
                let connection_at = self.connection.as_ref().map(|connection| {
                    fds.push(connection.channel.as_fd());
                    fds.len() - 1
                });
                let ready = select_readable(&fds, true).context("poll failed")?;
                (ready, shutdown_at, connection_at)
            };
            let is_ready = |at: Option<usize>| at.is_some_and(|i| ready[i]);

            let sigchld_ready = ready[0];
            let listener_ready = ready[1];
            let shutdown_ready = is_ready(shutdown_at);
            let connection_ready = is_ready(connection_at);

            if shutdown_ready {
                if let Some(shutdown) = &self.shutdown {
                    shutdown.drain()?;
                }
                info!("shutdown requested");
                return Ok(ExitReason::ShutdownRequested);
            }

            let mut lost = false;

            if sigchld_ready {
                self.sigchld.drain()?;
                lost |= self.reap_children();
            }

            if connection_ready && self.connection.is_some() {
                lost |= !self.service_connection();
            }

            if lost && self.reportable_count() == 0 {
                info!("client gone and no children left");
                return Ok(ExitReason::NoReportableChildren);
            }

            if listener_ready {
                self.accept();
            }
        }
    }

    fn accept(&mut self) {
        let stream = match self.listener.accept() {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        };

        if self.connection.is_some() {
            self.reject(stream);
            return;
        }

        debug!("client connected");
        self.connection = Some(Connection {
            channel: Channel::new(stream),
            state: ConnectionState::AwaitingHandshake,
        });
    }

    /// Turn away a connection while another one is active
    fn reject(&self, stream: UnixStream) {
        info!("rejecting connection; a client is already attached");
        let mut channel: Channel<Message> = Channel::new(stream);
        let response = Message::HandshakeResponse(HandshakeResponse::rejected(self.pid));
        if let Err(e) = channel.send(&response, None) {
            debug!(error = %e, "failed to send rejection");
        }
    }

    /// Read and handle everything the client sent; false if it is gone
    fn service_connection(&mut self) -> bool {
        let Some(mut connection) = self.connection.take() else {
            return false;
        };

        if let Err(e) = connection.channel.read_available() {
            log_transport_error(&e);
            return false;
        }

        loop {
            match connection.channel.recv_buffered() {
                Ok(Some(received)) => {
                    if let Err(e) = self.handle_message(&mut connection, received.message) {
                        log_transport_error(&e);
                        return false;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log_transport_error(&e);
                    return false;
                }
            }
        }

        self.connection = Some(connection);
        true
    }

    fn handle_message(
        &mut self,
        connection: &mut Connection,
        message: Message,
    ) -> Result<(), ProtocolError> {
        debug!(kind = message.kind(), "request");

        match (connection.state, message) {
            (ConnectionState::AwaitingHandshake, Message::HandshakeRequest(request)) => {
                self.handle_handshake(connection, request)
            }
            (ConnectionState::Active, Message::HandshakeRequest(_)) => {
                warn!("ignoring repeated handshake");
                Ok(())
            }
            (ConnectionState::Active, Message::LaunchRequest(request)) => {
                self.handle_launch(connection, request)
            }
            (ConnectionState::Active, Message::WaitRequest(request)) => {
                self.handle_wait(connection, request)
            }
            (ConnectionState::AwaitingHandshake, message) if message.is_client_originated() => {
                warn!(kind = message.kind(), "ignoring request before handshake");
                Ok(())
            }
            (_, message) => {
                warn!(kind = message.kind(), "ignoring server-originated message from client");
                Ok(())
            }
        }
    }

    fn handle_handshake(
        &mut self,
        connection: &mut Connection,
        request: HandshakeRequest,
    ) -> Result<(), ProtocolError> {
        if request.max_protocol_version < MIN_PROTOCOL_VERSION {
            info!(version = request.max_protocol_version, "rejecting old client");
            let response = Message::HandshakeResponse(HandshakeResponse::rejected(self.pid));
            connection.channel.send(&response, None)?;
            return Err(ProtocolError::Disconnected);
        }

        let reportable: Vec<&ChildRecord> =
            self.children.iter().filter(|c| c.is_reportable()).collect();

        let response = Message::HandshakeResponse(HandshakeResponse {
            protocol_version: PROTOCOL_VERSION,
            pid: self.pid,
            num_children: reportable.len() as i32,
        });
        connection.channel.send(&response, None)?;

        for (index, child) in reportable.iter().enumerate() {
            let master = child.master.as_ref().ok_or(ProtocolError::MissingDescriptor)?;
            let report = Message::ReportChild(ReportChild {
                is_last: index + 1 == reportable.len(),
                pid: child.pid(),
                tty: child.tty.clone(),
                terminated: child.is_terminated(),
                launch: child.launch.clone(),
            });
            connection.channel.send(&report, Some(master.as_fd()))?;
        }

        info!(children = reportable.len(), "client attached");
        connection.state = ConnectionState::Active;
        Ok(())
    }

    fn handle_launch(
        &mut self,
        connection: &mut Connection,
        request: LaunchRequest,
    ) -> Result<(), ProtocolError> {
        let unique_id = request.unique_id;

        match launcher::launch(&request, &self.launch_options) {
            Ok(child) => {
                info!(pid = child.pid.as_raw(), tty = %child.tty, path = %request.path, "launched");
                let response = Message::LaunchResponse(LaunchResponse {
                    status: 0,
                    pid: child.pid.as_raw(),
                    unique_id,
                    tty: child.tty.clone(),
                });

                // Recorded before replying so a lost client cannot orphan it
                self.children.push(ChildRecord {
                    pid: child.pid,
                    master: Some(child.master),
                    tty: child.tty,
                    launch: request,
                    status: None,
                    will_terminate: false,
                });

                let master = self
                    .children
                    .last()
                    .and_then(|record| record.master.as_ref())
                    .ok_or(ProtocolError::MissingDescriptor)?;
                connection.channel.send(&response, Some(master.as_fd()))
            }
            Err(e) => {
                warn!(path = %request.path, error = %e, "launch failed");
                let response = Message::LaunchResponse(LaunchResponse {
                    status: e.status(),
                    pid: 0,
                    unique_id,
                    tty: String::new(),
                });
                connection.channel.send(&response, None)
            }
        }
    }

    fn handle_wait(
        &mut self,
        connection: &mut Connection,
        request: WaitRequest,
    ) -> Result<(), ProtocolError> {
        let index = self
            .children
            .iter()
            .position(|c| c.pid() == request.pid && c.is_reportable());

        let result = match index {
            None => WaitResult::NoSuchChild,
            Some(i) => {
                let child = &mut self.children[i];
                match (child.status, request.remove_preemptively) {
                    (Some(status), _) => WaitResult::Exited(status),
                    (None, false) => WaitResult::StillRunning,
                    (None, true) => {
                        info!(pid = request.pid, "releasing child");
                        child.will_terminate = true;
                        child.master = None;
                        WaitResult::Released
                    }
                }
            }
        };

        let response = Message::WaitResponse(WaitResponse {
            pid: request.pid,
            result,
        });
        connection.channel.send(&response, None)?;

        if let (Some(index), WaitResult::Exited(status)) = (index, result) {
            let record = self.children.remove(index);
            info!(pid = record.pid(), %status, "child collected");
        }
        Ok(())
    }

    /// Collect exited children; true if notifying the client failed
    fn reap_children(&mut self) -> bool {
        let mut terminated = Vec::new();
        let mut index = 0;

        while index < self.children.len() {
            let child = &mut self.children[index];
            if child.status.is_some() {
                index += 1;
                continue;
            }

            let status = match waitpid(child.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => ExitStatus::from_wait_status(status),
                Err(Errno::ECHILD) => Some(ExitStatus::Unknown),
                Err(e) => {
                    warn!(pid = child.pid(), error = %e, "waitpid failed");
                    None
                }
            };

            let Some(status) = status else {
                index += 1;
                continue;
            };

            if child.will_terminate {
                debug!(pid = child.pid(), %status, "released child exited");
                self.children.remove(index);
                continue;
            }

            info!(pid = child.pid(), %status, "child terminated");
            child.status = Some(status);
            terminated.push(child.pid());
            index += 1;
        }

        let Some(connection) = self.connection.as_mut() else {
            return false;
        };
        if connection.state != ConnectionState::Active {
            return false;
        }

        for pid in terminated {
            let notice = Message::Termination(Termination { pid });
            if let Err(e) = connection.channel.send(&notice, None) {
                log_transport_error(&e);
                self.connection = None;
                return true;
            }
        }
        false
    }
}

impl Drop for MultiServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = fs::remove_file(&self.socket_path);
        }
    }
}

/// Bind a Unix socket at `path` with owner-only permissions
///
/// The socket is bound inside a fresh 0700 directory next to `path` and
/// renamed into place once it is 0600, so no other user can connect to it
/// while the permissions are still loose.
pub(crate) fn bind_socket(path: &Path) -> Result<UnixListener> {
    use std::os::unix::fs::DirBuilderExt;

    // Remove stale socket if it exists
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }

    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("socket path {} has no file name", path.display()))?;
    let staging = path.with_file_name(format!(".{}.bind", name.to_string_lossy()));
    // Left over from a crashed server with the same pid
    let _ = fs::remove_dir_all(&staging);
    fs::DirBuilder::new()
        .mode(0o700)
        .create(&staging)
        .with_context(|| format!("failed to create {}", staging.display()))?;

    let bound = bind_staged(&staging.join(name), path);
    let _ = fs::remove_dir_all(&staging);
    bound
}

fn bind_staged(staged: &Path, path: &Path) -> Result<UnixListener> {
    use std::os::unix::fs::PermissionsExt;

    let listener = UnixListener::bind(staged)
        .with_context(|| format!("failed to bind {}", staged.display()))?;
    fs::set_permissions(staged, fs::Permissions::from_mode(0o600))?;
    fs::rename(staged, path)
        .with_context(|| format!("failed to move socket to {}", path.display()))?;
    Ok(listener)
}

fn log_transport_error(error: &ProtocolError) {
    if error.is_disconnect() {
        info!("client disconnected");
    } else {
        warn!(%error, "dropping connection");
    }
}
