//! Server configuration from ~/.ptydrc and the environment
//!
//! The rc file holds shell-style assignments, one per line:
//! - PTYD_SOCKET_DIR (directory holding server sockets)
//! - PTYD_LOG (tracing filter, e.g. `ptyd=debug`)
//! - PTYD_LOG_FILE (append logs here instead of stderr)
//! - PTYD_DEFAULT_TERM (TERM for children whose environment lacks one)
//!
//! Environment variables with the same names override the file.

use crate::daemon::launcher::LaunchOptions;
use crate::daemon::socket_path::SocketPaths;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_LOG_FILTER: &str = "ptyd=info";
pub const DEFAULT_TERM: &str = "xterm-256color";

const KEY_SOCKET_DIR: &str = "PTYD_SOCKET_DIR";
const KEY_LOG: &str = "PTYD_LOG";
const KEY_LOG_FILE: &str = "PTYD_LOG_FILE";
const KEY_DEFAULT_TERM: &str = "PTYD_DEFAULT_TERM";

/// Complete server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub socket_dir: PathBuf,
    pub log_filter: String,
    pub log_file: Option<PathBuf>,
    /// Empty string disables adding TERM
    pub default_term: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_dir: std::env::temp_dir(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_file: None,
            default_term: DEFAULT_TERM.to_string(),
        }
    }
}

impl ServerConfig {
    /// Load ~/.ptydrc, then apply environment overrides
    pub fn load() -> Self {
        let mut config = Self::from_file(&Self::rc_path()).unwrap_or_default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Get the path to .ptydrc
    pub fn rc_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ptydrc")
    }

    /// Parse configuration from a specific file
    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    /// Parse configuration from content string
    pub fn parse(content: &str) -> Self {
        let mut config = ServerConfig::default();

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);

            if let Some((key, value)) = parse_assignment(line) {
                config.set(&key, unquote(&value));
            }
        }

        config
    }

    /// Override settings from a variable lookup (normally the process environment)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in [KEY_SOCKET_DIR, KEY_LOG, KEY_LOG_FILE, KEY_DEFAULT_TERM] {
            if let Some(value) = lookup(key) {
                self.set(key, value);
            }
        }
    }

    fn set(&mut self, key: &str, value: String) {
        match key {
            KEY_SOCKET_DIR if !value.is_empty() => self.socket_dir = expand_home(&value),
            KEY_LOG if !value.is_empty() => self.log_filter = value,
            KEY_LOG_FILE => {
                self.log_file = if value.is_empty() {
                    None
                } else {
                    Some(expand_home(&value))
                };
            }
            KEY_DEFAULT_TERM => self.default_term = value,
            _ => {}
        }
    }

    pub fn socket_paths(&self) -> SocketPaths {
        SocketPaths::new(&self.socket_dir)
    }

    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            default_term: if self.default_term.is_empty() {
                None
            } else {
                Some(self.default_term.clone())
            },
        }
    }
}

fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(value)),
        None => PathBuf::from(value),
    }
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key.to_string(), value.trim().to_string()))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();

    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }

    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_empty() {
        assert_eq!(ServerConfig::parse(""), ServerConfig::default());
    }

    #[test]
    fn test_parse_all_keys() {
        let content = r#"
PTYD_SOCKET_DIR=/run/user/1000
PTYD_LOG="ptyd=debug"
PTYD_LOG_FILE='/var/log/ptyd.log'
PTYD_DEFAULT_TERM=vt100
"#;
        let config = ServerConfig::parse(content);
        assert_eq!(config.socket_dir, PathBuf::from("/run/user/1000"));
        assert_eq!(config.log_filter, "ptyd=debug");
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/ptyd.log")));
        assert_eq!(config.default_term, "vt100");
    }

    #[test]
    fn test_parse_with_export_and_comments() {
        let content = r#"
# socket location
export PTYD_SOCKET_DIR="/tmp/ptyd"
  # indented comment
UNRELATED=1
not an assignment
"#;
        let config = ServerConfig::parse(content);
        assert_eq!(config.socket_dir, PathBuf::from("/tmp/ptyd"));
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut config = ServerConfig::parse("PTYD_LOG=ptyd=warn\nPTYD_DEFAULT_TERM=vt100\n");
        let env: HashMap<&str, &str> = [("PTYD_LOG", "ptyd=trace"), ("PTYD_DEFAULT_TERM", "")]
            .into_iter()
            .collect();

        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.log_filter, "ptyd=trace");
        assert_eq!(config.default_term, "");
        assert!(config.launch_options().default_term.is_none());
    }

    #[test]
    fn test_empty_log_file_disables_file_logging() {
        let mut config = ServerConfig::parse("PTYD_LOG_FILE=/tmp/ptyd.log");
        config.apply_overrides(|key| (key == "PTYD_LOG_FILE").then(String::new));
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_socket_paths_use_configured_dir() {
        let config = ServerConfig::parse("PTYD_SOCKET_DIR=/srv/sockets");
        assert_eq!(
            config.socket_paths().path_for(12),
            PathBuf::from("/srv/sockets/ptyd-server-12")
        );
    }

    #[test]
    fn test_default_term_in_launch_options() {
        let options = ServerConfig::default().launch_options();
        assert_eq!(options.default_term.as_deref(), Some(DEFAULT_TERM));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(".ptydrc");
        fs::write(&path, "PTYD_DEFAULT_TERM=screen\n").unwrap();

        assert_eq!(ServerConfig::from_file(&path).unwrap().default_term, "screen");
        assert!(ServerConfig::from_file(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"hello\""), "hello");
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("hello"), "hello");
        assert_eq!(unquote("  \"hello\"  "), "hello");
        assert_eq!(unquote("\""), "\"");
    }
}
