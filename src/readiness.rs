//! Readiness marker detection in endpoint output.
//!
//! The external CLI announces a usable tunnel by printing a line that contains
//! `ssh -p <port> <user>@<host>` somewhere in it. Matching is case-sensitive
//! and the marker may be surrounded by arbitrary text.

use std::sync::OnceLock;

use regex::Regex;

/// Parsed readiness marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessMarker {
    /// Forwarded local port.
    pub port: u16,
    /// Token following the port, usually `user@host`.
    pub user_and_host: String,
    /// The matched `ssh -p ...` command text.
    pub ssh_command: String,
}

impl ReadinessMarker {
    pub fn user(&self) -> &str {
        user_of(&self.user_and_host)
    }
}

/// The user part of a `user@host` token (everything before the last `@`).
///
/// Returns the whole token when it carries no `@`.
pub fn user_of(user_and_host: &str) -> &str {
    user_and_host
        .rsplit_once('@')
        .map_or(user_and_host, |(user, _)| user)
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ssh -p (\d+) (\S+)").expect("static regex"))
}

/// Scan one output line for the readiness marker.
///
/// A port that does not fit in `u16` is not a marker.
pub fn parse_marker(line: &str) -> Option<ReadinessMarker> {
    let caps = marker_regex().captures(line)?;
    let port = caps[1].parse::<u16>().ok()?;
    Some(ReadinessMarker {
        port,
        user_and_host: caps[2].to_string(),
        ssh_command: caps[0].to_string(),
    })
}
