//! Inactivity detection for the forwarded port.
//!
//! The supervisor polls a [`ConnectionProbe`] at a fixed interval and feeds
//! the answer to an [`IdleTracker`]:
//!
//! ```text
//! AwaitingFirstConnection ──conn──▶ Active ◀──conn── Idle(n)
//!                                     │               ▲  │
//!                                     └────no conn────┘  └─ n ≥ threshold ─▶ Shutdown
//! ```
//!
//! Ticks without a connection before anyone ever connected are not counted,
//! so a session nobody has opened yet is never reaped by this monitor (the
//! hard timeout still applies).

use std::time::Duration;

/// Fixed poll interval of the idle monitor.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Idle monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    AwaitingFirstConnection,
    Active,
    /// Consecutive polls without a connection.
    Idle(u64),
    Shutdown,
}

/// Pure state machine driven by one observation per poll.
#[derive(Debug, Clone)]
pub struct IdleTracker {
    state: IdleState,
    threshold: u64,
}

impl IdleTracker {
    /// Threshold is `ceil(window / poll_interval)`, at least one poll.
    pub fn new(window: Duration, poll_interval: Duration) -> Self {
        let window_ms = window.as_millis();
        let poll_ms = poll_interval.as_millis().max(1);
        let threshold = window_ms.div_ceil(poll_ms).max(1);
        Self {
            state: IdleState::AwaitingFirstConnection,
            threshold: u64::try_from(threshold).unwrap_or(u64::MAX),
        }
    }

    pub fn state(&self) -> IdleState {
        self.state
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Feed one poll result and return the new state.
    pub fn observe(&mut self, connected: bool) -> IdleState {
        self.state = match (self.state, connected) {
            (IdleState::Shutdown, _) => IdleState::Shutdown,
            (_, true) => IdleState::Active,
            (IdleState::AwaitingFirstConnection, false) => IdleState::AwaitingFirstConnection,
            (IdleState::Active, false) => self.idle(1),
            (IdleState::Idle(n), false) => self.idle(n + 1),
        };
        self.state
    }

    fn idle(&self, count: u64) -> IdleState {
        if count >= self.threshold {
            IdleState::Shutdown
        } else {
            IdleState::Idle(count)
        }
    }
}

/// Answers "is anything connected to this port right now?".
pub trait ConnectionProbe: Send {
    fn has_established_connection(&mut self, port: u16) -> bool;
}

impl<F> ConnectionProbe for F
where
    F: FnMut(u16) -> bool + Send,
{
    fn has_established_connection(&mut self, port: u16) -> bool {
        self(port)
    }
}

/// Probe backed by the operating system's socket table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ConnectionProbe for SystemProbe {
    fn has_established_connection(&mut self, port: u16) -> bool {
        established_on_port(port)
    }
}

/// TCP state code for ESTABLISHED in `/proc/net/tcp`.
const TCP_ESTABLISHED: &str = "01";

/// Whether any row of a `/proc/net/tcp`-format table is an ESTABLISHED
/// connection with `port` on either end.
pub fn table_has_established(table: &str, port: u16) -> bool {
    table.lines().skip(1).any(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[3] != TCP_ESTABLISHED {
            return false;
        }
        let local = parse_hex_port(fields[1]);
        let remote = parse_hex_port(fields[2]);
        local == Some(port) || remote == Some(port)
    })
}

/// Port part of an `ADDR:PORT` hex pair.
fn parse_hex_port(addr: &str) -> Option<u16> {
    let (_, port) = addr.rsplit_once(':')?;
    u16::from_str_radix(port, 16).ok()
}

#[cfg(target_os = "linux")]
fn established_on_port(port: u16) -> bool {
    ["/proc/net/tcp", "/proc/net/tcp6"].iter().any(|path| {
        std::fs::read_to_string(path)
            .map(|table| table_has_established(&table, port))
            .unwrap_or(false)
    })
}

#[cfg(not(target_os = "linux"))]
fn established_on_port(port: u16) -> bool {
    // lsof exits 1 when nothing matches
    std::process::Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:ESTABLISHED"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .output()
        .map(|out| out.status.success() && !out.stdout.is_empty())
        .unwrap_or(false)
}
