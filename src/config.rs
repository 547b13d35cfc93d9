//! Controller configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TETHER_CLI`, `TETHER_STATE_DIR`,
//!    `TETHER_IDLE_TIMEOUT_MINUTES`, `TETHER_SSH_CONFIG`
//! 2. **Config file** — path via `--config <path>`, or `tether.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [cli]
//! path = "cdswctl"
//!
//! [session]
//! state_dir = "~/.local/state/tether"
//! idle_timeout_minutes = 60     # 0 disables the idle monitor
//! max_session_minutes = 600
//! ready_timeout_secs = 60
//! ready_poll_ms = 500
//!
//! [ssh]
//! config_path = "~/.ssh/config"
//! alias = "tether"
//!
//! [supervisor]
//! binary = ""                   # empty = next to the tether executable
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::state::{DEFAULT_POLL_INTERVAL, DEFAULT_READY_TIMEOUT};
use crate::supervisor::DEFAULT_MAX_SESSION_MINUTES;
use crate::util::expand_tilde;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "tether.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cli: CliConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub supervisor: SupervisorBinaryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// External CLI that starts and stops endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    /// Executable name or path (default `cdswctl`). Override with `TETHER_CLI`.
    #[serde(default = "default_cli_path")]
    pub path: String,
}

/// Session files and timers.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Directory holding the state, log and payload files. Override with
    /// `TETHER_STATE_DIR`.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Idle window in minutes; 0 disables the idle monitor (default 60).
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u64,
    /// Hard session limit in minutes (default 600).
    #[serde(default = "default_max_session_minutes")]
    pub max_session_minutes: u64,
    /// How long `connect` waits for the session to become ready (default 60).
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    /// State file poll interval in milliseconds (default 500).
    #[serde(default = "default_ready_poll_ms")]
    pub ready_poll_ms: u64,
}

/// SSH client configuration target.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// File the `Host` block is written to. Override with `TETHER_SSH_CONFIG`.
    #[serde(default = "default_ssh_config_path")]
    pub config_path: String,
    /// Host alias of the block (default `tether`).
    #[serde(default = "default_alias")]
    pub alias: String,
}

/// Where to find the supervisor executable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SupervisorBinaryConfig {
    /// Explicit path; empty means `tether-supervisor` next to the running
    /// `tether` executable.
    #[serde(default)]
    pub binary: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_cli_path() -> String {
    "cdswctl".to_string()
}
fn default_state_dir() -> String {
    "~/.local/state/tether".to_string()
}
fn default_idle_timeout_minutes() -> u64 {
    60
}
fn default_max_session_minutes() -> u64 {
    DEFAULT_MAX_SESSION_MINUTES
}
fn default_ready_timeout_secs() -> u64 {
    DEFAULT_READY_TIMEOUT.as_secs()
}
fn default_ready_poll_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}
fn default_ssh_config_path() -> String {
    "~/.ssh/config".to_string()
}
fn default_alias() -> String {
    "tether".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            path: default_cli_path(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            idle_timeout_minutes: default_idle_timeout_minutes(),
            max_session_minutes: default_max_session_minutes(),
            ready_timeout_secs: default_ready_timeout_secs(),
            ready_poll_ms: default_ready_poll_ms(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            config_path: default_ssh_config_path(),
            alias: default_alias(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SessionConfig {
    /// `state_dir` with `~` expanded.
    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.state_dir).as_ref())
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Poll interval, never below 10 ms.
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms.max(10))
    }
}

impl SshConfig {
    /// `config_path` with `~` expanded.
    pub fn config_path(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.config_path).as_ref())
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise
    /// `tether.toml` in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(expand_tilde(p).as_ref()))?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {}: {e}", path.display()))
    }

    /// Apply env var overrides, looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), String> {
        if let Some(cli) = var("TETHER_CLI") {
            self.cli.path = cli;
        }
        if let Some(dir) = var("TETHER_STATE_DIR") {
            self.session.state_dir = dir;
        }
        if let Some(minutes) = var("TETHER_IDLE_TIMEOUT_MINUTES") {
            self.session.idle_timeout_minutes = minutes
                .trim()
                .parse()
                .map_err(|e| format!("Invalid TETHER_IDLE_TIMEOUT_MINUTES {minutes:?}: {e}"))?;
        }
        if let Some(path) = var("TETHER_SSH_CONFIG") {
            self.ssh.config_path = path;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.cli.path, "cdswctl");
        assert_eq!(config.session.idle_timeout_minutes, 60);
        assert_eq!(config.session.max_session_minutes, 600);
        assert_eq!(config.session.ready_timeout(), Duration::from_secs(60));
        assert_eq!(config.session.ready_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.ssh.alias, "tether");
        assert!(config.supervisor.binary.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut config: Config = toml::from_str(
            r#"
            [session]
            idle_timeout_minutes = 0

            [ssh]
            alias = "cml"
            "#,
        )
        .unwrap();
        config.apply_env(no_env).unwrap();
        assert_eq!(config.session.idle_timeout_minutes, 0);
        assert_eq!(config.session.ready_poll_ms, 500);
        assert_eq!(config.ssh.alias, "cml");
        assert_eq!(config.ssh.config_path, "~/.ssh/config");
        assert_eq!(config.cli.path, "cdswctl");
    }

    #[test]
    fn env_overrides_file() {
        let mut config: Config = toml::from_str("[cli]\npath = \"/opt/cli\"\n").unwrap();
        config
            .apply_env(|key| match key {
                "TETHER_CLI" => Some("/usr/local/bin/cdswctl".into()),
                "TETHER_IDLE_TIMEOUT_MINUTES" => Some(" 15 ".into()),
                "TETHER_STATE_DIR" => Some("/tmp/tether".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.cli.path, "/usr/local/bin/cdswctl");
        assert_eq!(config.session.idle_timeout_minutes, 15);
        assert_eq!(config.session.state_dir(), PathBuf::from("/tmp/tether"));
    }

    #[test]
    fn invalid_idle_override_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_env(|key| (key == "TETHER_IDLE_TIMEOUT_MINUTES").then(|| "soon".into()))
            .unwrap_err();
        assert!(err.contains("TETHER_IDLE_TIMEOUT_MINUTES"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = Config::load(Some("/nonexistent/tether.toml")).unwrap_err();
        assert!(err.contains("Failed to read"));
    }

    #[test]
    fn unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");
        std::fs::write(&path, "[session\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.contains("Failed to parse"));
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let session = SessionConfig {
            ready_poll_ms: 0,
            ..SessionConfig::default()
        };
        assert_eq!(session.ready_poll_interval(), Duration::from_millis(10));
    }
}
