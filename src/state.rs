//! State channel: the JSON status file shared by supervisor and controller.
//!
//! The supervisor is the only writer. Every write replaces the whole file via
//! temp-file-then-rename in the same directory, so a reader sees either the
//! previous record or the new one. Readers never lock; anything that is
//! missing, empty or fails to parse counts as "not yet available" and is
//! retried on the next poll tick. A torn or unparsable read can therefore hide
//! a real `error` record for up to one poll interval.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SessionError;
use crate::readiness::ReadinessMarker;

/// Default interval between state file polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default bound on the readiness wait.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Counter for unique temp file names.
static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Session lifecycle status. `Ready` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Ready,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Starting)
    }
}

/// The single record persisted to the state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub status: SessionStatus,
    /// Human-readable explanation, only on `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Full `ssh -p ...` command, only on `ready`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_and_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_process_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_process_id: Option<u32>,
    /// Time of the last write.
    pub timestamp: DateTime<Utc>,
}

impl SessionState {
    pub fn starting(supervisor_pid: u32, endpoint_pid: Option<u32>) -> Self {
        Self {
            status: SessionStatus::Starting,
            message: None,
            ssh_command: None,
            user_and_host: None,
            port: None,
            supervisor_process_id: Some(supervisor_pid),
            endpoint_process_id: endpoint_pid,
            timestamp: Utc::now(),
        }
    }

    /// A `ready` record. Only constructible from a parsed marker, so `port`
    /// and `user_and_host` are always present.
    pub fn ready(marker: &ReadinessMarker, supervisor_pid: u32, endpoint_pid: Option<u32>) -> Self {
        Self {
            status: SessionStatus::Ready,
            message: None,
            ssh_command: Some(marker.ssh_command.clone()),
            user_and_host: Some(marker.user_and_host.clone()),
            port: Some(marker.port.to_string()),
            supervisor_process_id: Some(supervisor_pid),
            endpoint_process_id: endpoint_pid,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>, supervisor_pid: u32, endpoint_pid: Option<u32>) -> Self {
        Self {
            status: SessionStatus::Error,
            message: Some(message.into()),
            ssh_command: None,
            user_and_host: None,
            port: None,
            supervisor_process_id: Some(supervisor_pid),
            endpoint_process_id: endpoint_pid,
            timestamp: Utc::now(),
        }
    }

    /// Parse a state file's contents. Returns `None` for anything a poller
    /// should treat as "not yet available": empty text, invalid JSON, or a
    /// `ready` record missing its port or user/host.
    pub fn parse(content: &str) -> Option<Self> {
        if content.trim().is_empty() {
            return None;
        }
        let state: Self = serde_json::from_str(content).ok()?;
        if state.status == SessionStatus::Ready && state.port_number().is_none() {
            return None;
        }
        if state.status == SessionStatus::Ready && state.user_and_host.is_none() {
            return None;
        }
        Some(state)
    }

    /// `port` as a number, if present and valid.
    pub fn port_number(&self) -> Option<u16> {
        self.port.as_deref().and_then(|p| p.parse().ok())
    }
}

/// Reader/writer for one state file.
#[derive(Debug, Clone)]
pub struct StateChannel {
    path: PathBuf,
}

impl StateChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the whole file with `state`.
    pub async fn write(&self, state: &SessionState) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let parent = self.path.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent).await?;

        let seq = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_path = parent.join(format!(".tether_state_{}_{seq}", std::process::id()));
        tokio::fs::write(&temp_path, &json).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }
        debug!("State file {} -> {:?}", self.path.display(), state.status);
        Ok(())
    }

    /// Truncate the file to empty so a poller cannot pick up a record from a
    /// previous session.
    pub async fn clear(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, b"").await
    }

    /// Delete the file. A missing file is not an error.
    pub async fn remove(&self) -> std::io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Read the current record, or `None` if it is not available yet.
    pub async fn read(&self) -> Option<SessionState> {
        let content = tokio::fs::read_to_string(&self.path).await.ok()?;
        SessionState::parse(&content)
    }

    /// Poll until the record reaches a terminal status or `timeout` elapses.
    ///
    /// - `ready` → `Ok(record)`
    /// - `error` → [`SessionError::SessionFailed`] with the record's message
    /// - no terminal status in time → [`SessionError::ReadinessWaitTimeout`]
    ///
    /// Never writes the file.
    pub async fn wait_for_ready(
        &self,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<SessionState, SessionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(state) = self.read().await {
                match state.status {
                    SessionStatus::Ready => return Ok(state),
                    SessionStatus::Error => {
                        return Err(SessionError::SessionFailed(
                            state
                                .message
                                .unwrap_or_else(|| "unknown error".to_string()),
                        ));
                    }
                    SessionStatus::Starting => {}
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(SessionError::ReadinessWaitTimeout { waited: timeout });
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}
