//! Detached session supervisor.
//!
//! `tether-supervisor <payload.json>` starts the endpoint CLI, watches its
//! output for the readiness marker and reports progress through the state
//! file. It runs until one of:
//!
//! - the endpoint exits,
//! - the shutdown future resolves (SIGTERM/SIGINT/SIGHUP in production),
//! - the hard session timeout elapses,
//! - the idle monitor decides nobody is using the forwarded port.
//!
//! Everything is multiplexed on one `current_thread` event loop with
//! `tokio::select!`. On every exit path the endpoint's process group is killed.

pub mod log;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::task::Poll;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::Child;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cli::stop_session_args;
use crate::error::{describe_exit, SessionError};
use crate::idle::{ConnectionProbe, IdleState, IdleTracker, IDLE_POLL_INTERVAL};
use crate::process::{kill_process_group, run_command, spawn_endpoint};
use crate::readiness::{parse_marker, ReadinessMarker};
use crate::state::{SessionState, StateChannel};

use self::log::{OutputStream, SessionLog};

/// Default hard cap on session length (10 hours).
pub const DEFAULT_MAX_SESSION_MINUTES: u64 = 600;

/// How long to keep reading buffered output after the endpoint exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on the remote stop call after an idle shutdown.
const STOP_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait for the killed endpoint to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Launch payload, written by the controller and read once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Endpoint CLI executable.
    pub cli_path: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub state_file: PathBuf,
    pub log_file: PathBuf,
    /// Project the remote session belongs to.
    pub project: String,
    /// 0 disables the idle monitor.
    #[serde(default)]
    pub idle_timeout_minutes: u64,
    #[serde(default = "default_max_session_minutes")]
    pub max_session_minutes: u64,
}

fn default_max_session_minutes() -> u64 {
    DEFAULT_MAX_SESSION_MINUTES
}

impl SupervisorConfig {
    /// Read a payload file.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let content = std::fs::read_to_string(path).map_err(|e| SessionError::Payload {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| SessionError::Payload {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Write the payload file, creating parent directories.
    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json).await
    }
}

/// Timer settings derived from the payload.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub hard_timeout: Duration,
    pub idle_poll_interval: Duration,
    /// `None` disables the idle monitor.
    pub idle_window: Option<Duration>,
    pub stop_call_timeout: Duration,
}

impl SupervisorOptions {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            hard_timeout: Duration::from_secs(config.max_session_minutes.saturating_mul(60)),
            idle_poll_interval: IDLE_POLL_INTERVAL,
            idle_window: (config.idle_timeout_minutes > 0)
                .then(|| Duration::from_secs(config.idle_timeout_minutes.saturating_mul(60))),
            stop_call_timeout: STOP_CALL_TIMEOUT,
        }
    }
}

/// Why the event loop ended.
#[derive(Debug)]
enum Exit {
    /// Endpoint exited without ever printing the marker.
    Premature(Option<i32>),
    /// Endpoint exited after the session was ready.
    EndpointEnded(Option<i32>),
    HardTimeout,
    Idle,
    Shutdown,
}

type LineReader<R> = Option<Lines<BufReader<R>>>;

/// Next line from a stream, or pending forever once the stream is closed.
async fn next_line<R>(lines: &mut LineReader<R>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = lines.as_mut() else {
        return std::future::pending().await;
    };
    match reader.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) | Err(_) => {
            *lines = None;
            None
        }
    }
}

/// Resolves on the first SIGTERM, SIGINT or SIGHUP.
///
/// The handlers are installed by this call rather than on first poll, so a
/// signal that arrives while the endpoint is still being spawned is not lost.
/// Must be called from within a runtime.
pub fn shutdown_signal() -> impl Future<Output = ()> {
    let mut streams: Vec<(Signal, &'static str)> = [
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::hangup(), "SIGHUP"),
    ]
    .into_iter()
    .filter_map(|(kind, name)| match signal(kind) {
        Ok(s) => Some((s, name)),
        Err(e) => {
            warn!("Cannot register {name} handler: {e}");
            None
        }
    })
    .collect();

    async move {
        let name = std::future::poll_fn(|cx| {
            for (stream, name) in &mut streams {
                if stream.poll_recv(cx).is_ready() {
                    return Poll::Ready(*name);
                }
            }
            Poll::Pending
        })
        .await;
        info!("Received {name}");
    }
}

/// One supervised session.
pub struct Supervisor<P> {
    config: SupervisorConfig,
    options: SupervisorOptions,
    channel: StateChannel,
    probe: P,
    pid: u32,
    endpoint_pid: Option<u32>,
    ready: Option<ReadinessMarker>,
}

impl<P: ConnectionProbe> Supervisor<P> {
    pub fn new(config: SupervisorConfig, options: SupervisorOptions, probe: P) -> Self {
        let channel = StateChannel::new(&config.state_file);
        Self {
            config,
            options,
            channel,
            probe,
            pid: std::process::id(),
            endpoint_pid: None,
            ready: None,
        }
    }

    /// Run the session until it ends and return the process exit code.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> i32 {
        let mut log = SessionLog::open(&self.config.log_file).await;
        debug!("Endpoint output goes to {}", log.path().display());
        info!(
            "Supervisor pid {} starting {} for project {}",
            self.pid, self.config.cli_path, self.config.project
        );
        self.write_state(SessionState::starting(self.pid, None)).await;

        let mut child = match spawn_endpoint(&self.config.cli_path, &self.config.args) {
            Ok(c) => c,
            Err(source) => {
                let err = SessionError::SpawnFailure {
                    cli: self.config.cli_path.clone(),
                    source,
                };
                self.fail(&err).await;
                return 1;
            }
        };
        self.endpoint_pid = child.id();
        info!("Endpoint started (pid {:?})", self.endpoint_pid);
        self.write_state(SessionState::starting(self.pid, self.endpoint_pid))
            .await;

        let mut stdout: LineReader<_> = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr: LineReader<_> = child.stderr.take().map(|s| BufReader::new(s).lines());

        let hard_timeout = tokio::time::sleep(self.options.hard_timeout);
        tokio::pin!(hard_timeout);
        tokio::pin!(shutdown);

        let mut idle = self
            .options
            .idle_window
            .map(|window| IdleTracker::new(window, self.options.idle_poll_interval));
        match &idle {
            Some(t) => info!(
                "Idle monitor enabled: {} min window, shutdown after {} idle poll(s)",
                self.config.idle_timeout_minutes,
                t.threshold()
            ),
            None => info!("Idle monitor disabled"),
        }
        let poll = self.options.idle_poll_interval;
        let mut idle_tick = tokio::time::interval_at(Instant::now() + poll, poll);
        idle_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                Some(line) = next_line(&mut stdout) => {
                    self.on_line(&mut log, OutputStream::Stdout, &line).await;
                }
                Some(line) = next_line(&mut stderr) => {
                    self.on_line(&mut log, OutputStream::Stderr, &line).await;
                }
                status = child.wait() => {
                    let code = match status {
                        Ok(s) => s.code(),
                        Err(e) => {
                            warn!("Endpoint wait failed: {e}");
                            None
                        }
                    };
                    info!("Endpoint exited ({})", describe_exit(code));
                    self.drain(&mut log, &mut stdout, &mut stderr).await;
                    break if self.ready.is_some() {
                        Exit::EndpointEnded(code)
                    } else {
                        Exit::Premature(code)
                    };
                }
                () = &mut hard_timeout => break Exit::HardTimeout,
                _ = idle_tick.tick(), if idle.is_some() => {
                    if let (Some(tracker), Some(marker)) = (idle.as_mut(), self.ready.as_ref()) {
                        let connected = self.probe.has_established_connection(marker.port);
                        let before = tracker.state();
                        let after = tracker.observe(connected);
                        if before != after {
                            debug!("Idle monitor: {before:?} -> {after:?}");
                        }
                        if after == IdleState::Shutdown {
                            break Exit::Idle;
                        }
                    }
                }
                () = &mut shutdown => break Exit::Shutdown,
            }
        };

        let code = self.finish(exit).await;
        self.teardown(&mut child).await;
        code
    }

    async fn on_line(&mut self, log: &mut SessionLog, stream: OutputStream, line: &str) {
        log.append(stream, line).await;
        if self.ready.is_some() {
            return;
        }
        if let Some(marker) = parse_marker(line) {
            info!(
                "Endpoint ready on port {} for user {} ({})",
                marker.port,
                marker.user(),
                marker.user_and_host
            );
            self.write_state(SessionState::ready(&marker, self.pid, self.endpoint_pid))
                .await;
            self.ready = Some(marker);
        }
    }

    /// Process output still buffered in the pipes after the endpoint exited.
    async fn drain<R1, R2>(
        &mut self,
        log: &mut SessionLog,
        stdout: &mut LineReader<R1>,
        stderr: &mut LineReader<R2>,
    ) where
        R1: AsyncRead + Unpin,
        R2: AsyncRead + Unpin,
    {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while stdout.is_some() || stderr.is_some() {
            let next = tokio::time::timeout_at(deadline, async {
                tokio::select! {
                    Some(line) = next_line(stdout), if stdout.is_some() => {
                        Some((OutputStream::Stdout, line))
                    }
                    Some(line) = next_line(stderr), if stderr.is_some() => {
                        Some((OutputStream::Stderr, line))
                    }
                    else => None,
                }
            })
            .await;
            match next {
                Ok(Some((stream, line))) => self.on_line(log, stream, &line).await,
                Ok(None) => {}
                Err(_) => {
                    debug!("Output drain timed out");
                    break;
                }
            }
        }
    }

    /// Record the terminal state for `exit` and pick the exit code.
    async fn finish(&mut self, exit: Exit) -> i32 {
        match exit {
            Exit::Premature(code) => {
                self.fail(&SessionError::PrematureExit { code }).await;
                code.unwrap_or(1)
            }
            Exit::EndpointEnded(code) => {
                self.fail(&SessionError::EndpointExited { code }).await;
                0
            }
            Exit::HardTimeout => {
                self.fail(&SessionError::HardTimeout {
                    limit: self.options.hard_timeout,
                })
                .await;
                0
            }
            Exit::Idle => {
                self.fail(&SessionError::IdleShutdown {
                    minutes: self.config.idle_timeout_minutes,
                })
                .await;
                if let Some(pid) = self.endpoint_pid {
                    kill_process_group(pid);
                }
                self.stop_remote_session().await;
                0
            }
            Exit::Shutdown => {
                info!("Shutdown requested, leaving state file untouched");
                0
            }
        }
    }

    /// Best-effort `stop` call for the project's remote session.
    async fn stop_remote_session(&self) {
        let args = stop_session_args(&self.config.project);
        info!("Stopping remote session for project {}", self.config.project);
        match run_command(&self.config.cli_path, &args, self.options.stop_call_timeout).await {
            Ok(out) if out.success() => info!("Remote session stopped"),
            Ok(out) => warn!(
                "Remote stop exited with {:?}: {}",
                out.exit_code,
                out.stderr.trim()
            ),
            Err(e) => warn!("Remote stop failed: {e}"),
        }
    }

    /// Kill the endpoint's process group and reap it.
    async fn teardown(&self, child: &mut Child) {
        if let Some(pid) = self.endpoint_pid {
            kill_process_group(pid);
        }
        let _ = child.start_kill();
        if tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
            warn!("Endpoint did not exit within {}s", REAP_TIMEOUT.as_secs());
        }
    }

    async fn fail(&self, err: &SessionError) {
        error!("{err}");
        self.write_state(SessionState::error(err.to_string(), self.pid, self.endpoint_pid))
            .await;
    }

    async fn write_state(&self, state: SessionState) {
        if let Err(e) = self.channel.write(&state).await {
            error!(
                "Failed to write state file {}: {e}",
                self.channel.path().display()
            );
        }
    }
}
