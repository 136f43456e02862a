//! Socket path resolution
//!
//! A server listens on `<dir>/ptyd-server-<pid>`. A client that only
//! remembers the server's pid can rebuild the path without any registry,
//! and the pid can be recovered from a path found by scanning the directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File name prefix shared by every server socket
pub const SOCKET_PREFIX: &str = "ptyd-server-";

/// Directory in which server sockets live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPaths {
    dir: PathBuf,
}

impl SocketPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Socket path for the server running as `pid`
    pub fn path_for(&self, pid: i32) -> PathBuf {
        self.dir.join(format!("{}{}", SOCKET_PREFIX, pid))
    }

    /// Recover the server pid from a socket path
    ///
    /// Only the final path component is considered. Returns `None` unless it
    /// is the prefix followed by a positive decimal number and nothing else.
    pub fn pid_from(path: &Path) -> Option<i32> {
        let name = path.file_name()?.to_str()?;
        let digits = name.strip_prefix(SOCKET_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse::<i32>().ok().filter(|pid| *pid > 0)
    }

    /// Pids of every server socket present in the directory, sorted
    pub fn live_server_pids(&self) -> io::Result<Vec<i32>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(pid) = Self::pid_from(&entry.path()) {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }
}

impl Default for SocketPaths {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_for_composes_prefix_and_pid() {
        let paths = SocketPaths::new("/tmp/sockets");
        assert_eq!(
            paths.path_for(4242),
            PathBuf::from("/tmp/sockets/ptyd-server-4242")
        );
    }

    #[test]
    fn test_pid_from_inverts_path_for() {
        let paths = SocketPaths::new("/var/run/user");
        for pid in [1, 77, 65535, i32::MAX] {
            assert_eq!(SocketPaths::pid_from(&paths.path_for(pid)), Some(pid));
        }
    }

    #[test]
    fn test_pid_from_rejects_garbage() {
        assert_eq!(SocketPaths::pid_from(Path::new("/tmp/ptyd-server-")), None);
        assert_eq!(SocketPaths::pid_from(Path::new("/tmp/ptyd-server-12a")), None);
        assert_eq!(SocketPaths::pid_from(Path::new("/tmp/ptyd-server-+12")), None);
        assert_eq!(SocketPaths::pid_from(Path::new("/tmp/ptyd-server--12")), None);
        assert_eq!(SocketPaths::pid_from(Path::new("/tmp/ptyd-server-0")), None);
        assert_eq!(SocketPaths::pid_from(Path::new("/tmp/other-12")), None);
        assert_eq!(SocketPaths::pid_from(Path::new("/tmp/ptyd-server-99999999999")), None);
    }

    #[test]
    fn test_pid_from_uses_last_component_only() {
        assert_eq!(
            SocketPaths::pid_from(Path::new("/tmp/ptyd-server-5/ptyd-server-6")),
            Some(6)
        );
        assert_eq!(SocketPaths::pid_from(Path::new("/tmp/ptyd-server-5/x")), None);
    }

    #[test]
    fn test_live_server_pids_scans_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = SocketPaths::new(dir.path());
        fs::write(paths.path_for(30), b"").unwrap();
        fs::write(paths.path_for(7), b"").unwrap();
        fs::write(dir.path().join("unrelated"), b"").unwrap();
        fs::write(dir.path().join("ptyd-server-x"), b"").unwrap();

        assert_eq!(paths.live_server_pids().unwrap(), vec![7, 30]);
    }

    #[test]
    fn test_default_uses_temp_dir() {
        assert_eq!(SocketPaths::default().dir(), std::env::temp_dir().as_path());
    }
}
