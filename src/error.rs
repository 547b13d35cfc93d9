//! Failure taxonomy shared by the supervisor and the controller.
//!
//! Supervisor-local failures never cross the process boundary as values: they
//! are rendered with `Display` into the `message` of a terminal `error`
//! [`SessionState`](crate::state::SessionState) and logged. Only the
//! readiness wait and the SSH config write surface to the controller's caller.

use std::path::PathBuf;
use std::time::Duration;

/// Everything that can end or abort a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The endpoint executable could not be started.
    #[error("failed to start {cli}: {source}")]
    SpawnFailure {
        cli: String,
        #[source]
        source: std::io::Error,
    },

    /// The endpoint exited before printing its readiness marker.
    #[error("endpoint exited before ready ({})", exit_of(.code))]
    PrematureExit { code: Option<i32> },

    /// The endpoint exited after the session had become ready.
    #[error("endpoint exited ({})", exit_of(.code))]
    EndpointExited { code: Option<i32> },

    /// The hard maximum session duration elapsed.
    #[error("session timed out after {} minute(s)", .limit.as_secs() / 60)]
    HardTimeout { limit: Duration },

    /// Nobody used the forwarded port for the whole idle window.
    #[error("session stopped after {minutes} minute(s) of inactivity")]
    IdleShutdown { minutes: u64 },

    /// The controller gave up polling for a terminal state.
    #[error("timed out after {}s waiting for the session to become ready", .waited.as_secs())]
    ReadinessWaitTimeout { waited: Duration },

    /// The supervisor recorded an explicit `error` state.
    #[error("session failed: {0}")]
    SessionFailed(String),

    /// The SSH client configuration could not be written.
    #[error("failed to write {}: {source}", .path.display())]
    ConfigWriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stale supervisors could not be enumerated or killed. Always swallowed.
    #[error("orphan cleanup failed: {0}")]
    OrphanCleanupFailure(String),

    /// The supervisor payload file could not be read or parsed.
    #[error("invalid supervisor payload {}: {reason}", .path.display())]
    Payload { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn exit_of(code: &Option<i32>) -> String {
    describe_exit(*code)
}

/// Render an optional exit code for messages.
pub fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "killed by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn premature_exit_mentions_before() {
        let msg = SessionError::PrematureExit { code: Some(3) }.to_string();
        assert!(msg.contains("before"));
        assert!(msg.contains("exit code 3"));
    }

    #[test]
    fn premature_exit_without_code() {
        let msg = SessionError::PrematureExit { code: None }.to_string();
        assert!(msg.contains("killed by signal"));
    }

    #[test]
    fn endpoint_exit_after_ready_is_not_premature() {
        let msg = SessionError::EndpointExited { code: Some(0) }.to_string();
        assert_eq!(msg, "endpoint exited (exit code 0)");
        assert!(!msg.contains("before"));
    }

    #[test]
    fn hard_timeout_message() {
        let err = SessionError::HardTimeout {
            limit: Duration::from_secs(600 * 60),
        };
        assert_eq!(err.to_string(), "session timed out after 600 minute(s)");
    }

    #[test]
    fn idle_shutdown_message() {
        let err = SessionError::IdleShutdown { minutes: 15 };
        assert!(err.to_string().contains("inactivity"));
    }
}
