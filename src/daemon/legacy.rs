//! Legacy single-child server
//!
//! Runs exactly one program on a pty and hands its master descriptor to the
//! first client that connects, followed by the child's pid. There is no
//! handshake and no reconnect: the server ends when the child exits or when
//! its one client goes away.

use crate::config::ServerConfig;
use crate::daemon::channel::Channel;
use crate::daemon::launcher;
use crate::daemon::protocol::{ExitStatus, LaunchRequest, LegacyMessage};
use crate::daemon::select::{select_readable, SignalPipe};
use crate::daemon::server::bind_socket;
use crate::daemon::socket_path::SocketPaths;
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::fs;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Connection progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyState {
    Listening,
    Accepted,
    ChildMasterSent,
    PidSent,
    Closed,
}

/// Why [`LegacyServer::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyExit {
    ChildExited(ExitStatus),
    ClientDisconnected,
}

pub struct LegacyServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    connection: Option<Channel<LegacyMessage>>,
    sigchld: SignalPipe,
    child: Pid,
    master: OwnedFd,
    state: LegacyState,
}

impl LegacyServer {
    /// Start the child, then bind the socket for this process
    pub fn launch(paths: &SocketPaths, request: &LaunchRequest, config: &ServerConfig) -> Result<Self> {
        let sigchld = SignalPipe::register(&[signal_hook::consts::SIGCHLD])
            .context("failed to install SIGCHLD handler")?;

        let child = launcher::launch(request, &config.launch_options())
            .with_context(|| format!("failed to launch {}", request.path))?;

        let socket_path = paths.path_for(nix::unistd::getpid().as_raw());
        let listener = bind_socket(&socket_path)?;

        info!(pid = child.pid.as_raw(), tty = %child.tty, socket = %socket_path.display(), "legacy server listening");

        Ok(Self {
            socket_path,
            listener: Some(listener),
            connection: None,
            sigchld,
            child: child.pid,
            master: child.master,
            state: LegacyState::Listening,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn child_pid(&self) -> i32 {
        self.child.as_raw()
    }

    pub fn state(&self) -> LegacyState {
        self.state
    }

    pub fn run(&mut self) -> Result<LegacyExit> {
        loop {
            let (ready, listener_at, connection_at) = {
                let mut fds = vec![self.sigchld.as_fd()];
                let listener_at = self.listener.as_ref().map(|listener| {
                    fds.push(listener.as_fd());
                    fds.len() - 1
                });
                let connection_at = self.connection.as_ref().map(|channel| {
                    fds.push(channel.as_fd());
                    fds.len() - 1
                });
                let ready = select_readable(&fds, true).context("poll failed")?;
                (ready, listener_at, connection_at)
            };
            let is_ready = |at: Option<usize>| at.is_some_and(|i| ready[i]);

            if ready[0] {
                self.sigchld.drain()?;
                if let Some(status) = self.reap()? {
                    info!(pid = self.child_pid(), %status, "child exited");
                    self.close();
                    return Ok(LegacyExit::ChildExited(status));
                }
            }

            if is_ready(connection_at) && self.client_gone() {
                info!("client disconnected");
                self.close();
                return Ok(LegacyExit::ClientDisconnected);
            }

            if is_ready(listener_at) {
                self.accept();
            }
        }
    }

    fn reap(&self) -> Result<Option<ExitStatus>> {
        match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => Ok(ExitStatus::from_wait_status(status)),
            Err(Errno::ECHILD) => Ok(Some(ExitStatus::Unknown)),
            Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(e).context("waitpid failed"),
        }
    }

    fn accept(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        let stream = match listener.accept() {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        };
        self.state = LegacyState::Accepted;

        let mut channel = Channel::new(stream);
        if let Err(e) = channel.send(&LegacyMessage::Master, Some(self.master.as_fd())) {
            warn!(error = %e, "failed to send master");
            self.state = LegacyState::Listening;
            return;
        }
        self.state = LegacyState::ChildMasterSent;

        if let Err(e) = channel.send(&LegacyMessage::ChildPid(self.child_pid()), None) {
            warn!(error = %e, "failed to send child pid");
            self.state = LegacyState::Listening;
            return;
        }
        self.state = LegacyState::PidSent;
        debug!("client served");

        // Only one client is ever served
        self.listener = None;
        let _ = fs::remove_file(&self.socket_path);
        self.connection = Some(channel);
    }

    /// True once the served client has closed its end
    fn client_gone(&mut self) -> bool {
        let Some(channel) = self.connection.as_mut() else {
            return false;
        };
        match channel.read_available() {
            // Nothing is expected from the client
            Ok(n) => {
                debug!(bytes = n, "ignoring client data");
                false
            }
            Err(e) => {
                if !e.is_disconnect() {
                    warn!(error = %e, "client connection failed");
                }
                true
            }
        }
    }

    fn close(&mut self) {
        self.state = LegacyState::Closed;
        self.listener = None;
        self.connection = None;
        if self.socket_path.exists() {
            let _ = fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for LegacyServer {
    fn drop(&mut self) {
        if self.state != LegacyState::Closed && self.socket_path.exists() {
            let _ = fs::remove_file(&self.socket_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(argv: &[&str]) -> LaunchRequest {
        LaunchRequest {
            path: argv[0].to_string(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
            columns: 80,
            rows: 24,
            ..LaunchRequest::default()
        }
    }

    #[test]
    fn test_exits_with_child_when_nobody_connects() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut server = LegacyServer::launch(
            &SocketPaths::new(dir.path()),
            &request(&["/bin/sh", "-c", "exit 3"]),
            &ServerConfig::default(),
        )
        .unwrap();

        assert_eq!(server.state(), LegacyState::Listening);
        assert!(server.socket_path().exists());

        let exit = server.run().unwrap();
        assert_eq!(exit, LegacyExit::ChildExited(ExitStatus::Exited(3)));
        assert_eq!(server.state(), LegacyState::Closed);
        assert!(!server.socket_path().exists());
    }

    #[test]
    fn test_launch_failure_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = LegacyServer::launch(
            &SocketPaths::new(dir.path()),
            &request(&["/nonexistent/ptyd-legacy"]),
            &ServerConfig::default(),
        );
        assert!(result.is_err());
    }
}
