//! Controller flows: connect, disconnect, status, reap.
//!
//! Every flow takes an explicit [`SessionContext`] built once per invocation
//! from [`Config`] and command-line flags. The controller never talks to the
//! supervisor directly; it launches it detached and then only reads the state
//! file.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cli::{endpoint_args, EndpointRequest};
use crate::config::Config;
use crate::error::SessionError;
use crate::process::{kill_process_group, spawn_detached};
use crate::readiness::user_of;
use crate::reaper::{self, is_process_alive, terminate_process, ReapReport, SUPERVISOR_SIGNATURE};
use crate::ssh_config::{remove_host_block, upsert_host_block, ConfigBlock};
use crate::state::{SessionState, StateChannel};
use crate::supervisor::SupervisorConfig;
use crate::util::sibling_of;

const STATE_FILE: &str = "session.json";
const LOG_FILE: &str = "supervisor.log";
const PAYLOAD_FILE: &str = "supervisor-payload.json";

/// Everything a controller flow needs, resolved up front.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub alias: String,
    pub cli_path: String,
    pub state_file: PathBuf,
    pub log_file: PathBuf,
    pub payload_file: PathBuf,
    pub ssh_config: PathBuf,
    pub supervisor_binary: PathBuf,
    /// Process name the reaper looks for.
    pub supervisor_signature: String,
    pub idle_timeout_minutes: u64,
    pub max_session_minutes: u64,
    pub ready_poll_interval: Duration,
    pub ready_timeout: Duration,
    /// `RUST_LOG` value handed to the supervisor.
    pub log_filter: String,
}

impl SessionContext {
    /// Resolve paths and timers from `config`. `alias` overrides `[ssh] alias`.
    pub fn from_config(config: &Config, alias: Option<&str>) -> Result<Self, SessionError> {
        let state_dir = config.session.state_dir();
        let supervisor_binary = if config.supervisor.binary.is_empty() {
            sibling_of(&std::env::current_exe()?, SUPERVISOR_SIGNATURE)
        } else {
            PathBuf::from(crate::util::expand_tilde(&config.supervisor.binary).as_ref())
        };
        Ok(Self {
            alias: alias.unwrap_or(config.ssh.alias.as_str()).to_string(),
            cli_path: config.cli.path.clone(),
            state_file: state_dir.join(STATE_FILE),
            log_file: state_dir.join(LOG_FILE),
            payload_file: state_dir.join(PAYLOAD_FILE),
            ssh_config: config.ssh.config_path(),
            supervisor_binary,
            supervisor_signature: SUPERVISOR_SIGNATURE.to_string(),
            idle_timeout_minutes: config.session.idle_timeout_minutes,
            max_session_minutes: config.session.max_session_minutes,
            ready_poll_interval: config.session.ready_poll_interval(),
            ready_timeout: config.session.ready_timeout(),
            log_filter: std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        })
    }

    fn channel(&self) -> StateChannel {
        StateChannel::new(&self.state_file)
    }

    fn payload(&self, request: &EndpointRequest) -> SupervisorConfig {
        SupervisorConfig {
            cli_path: self.cli_path.clone(),
            args: endpoint_args(request),
            state_file: self.state_file.clone(),
            log_file: self.log_file.clone(),
            project: request.project.clone(),
            idle_timeout_minutes: self.idle_timeout_minutes,
            max_session_minutes: self.max_session_minutes,
        }
    }
}

/// A ready session, as reported by `connect`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub alias: String,
    pub port: u16,
    pub user_and_host: String,
    pub ssh_command: Option<String>,
    pub supervisor_process_id: u32,
}

/// What `disconnect` cleaned up.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectReport {
    pub supervisor_process_id: Option<u32>,
    pub endpoint_process_id: Option<u32>,
    pub removed_host_blocks: usize,
}

/// The current state record plus a liveness check of its supervisor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state: Option<SessionState>,
    pub supervisor_alive: bool,
}

/// Start a session and point the SSH alias at it.
pub async fn connect(
    ctx: &SessionContext,
    request: &EndpointRequest,
) -> Result<Connection, SessionError> {
    reap(ctx);

    let channel = ctx.channel();
    if let Some(previous) = channel.read().await {
        debug!("Found previous session state: {:?}", previous.status);
        kill_session(&previous);
    }
    channel.clear().await?;

    ctx.payload(request).save(&ctx.payload_file).await?;
    let supervisor_pid = spawn_detached(
        &ctx.supervisor_binary,
        &[OsStr::new(&ctx.payload_file)],
        &[("RUST_LOG", ctx.log_filter.clone())],
    )
    .map_err(|source| SessionError::SpawnFailure {
        cli: ctx.supervisor_binary.display().to_string(),
        source,
    })?;
    info!(
        "Launched supervisor (pid {supervisor_pid}) for project {}",
        request.project
    );

    let state = match channel
        .wait_for_ready(ctx.ready_poll_interval, ctx.ready_timeout)
        .await
    {
        Ok(state) => state,
        Err(e) => {
            warn!("Session did not become ready: {e}");
            abandon(&channel, supervisor_pid).await;
            return Err(e);
        }
    };

    // parse() never yields a ready record without these
    let (Some(port), Some(user_and_host)) = (state.port_number(), state.user_and_host.clone())
    else {
        abandon(&channel, supervisor_pid).await;
        return Err(SessionError::SessionFailed(
            "ready record is missing its port".to_string(),
        ));
    };
    let block = ConfigBlock::new(&ctx.alias, port, user_of(&user_and_host));
    let written = match upsert_host_block(&ctx.ssh_config, &block).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(SessionError::ConfigWriteFailure {
            path: ctx.ssh_config.clone(),
            source: std::io::Error::other(format!(
                "expected exactly one Host {} block after update",
                ctx.alias
            )),
        }),
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        // A session nobody can reach by alias would only idle out later
        warn!("Stopping session, SSH config not updated: {e}");
        abandon(&channel, supervisor_pid).await;
        return Err(e);
    }

    info!("Session ready: ssh {} (port {port})", ctx.alias);
    Ok(Connection {
        alias: ctx.alias.clone(),
        port,
        user_and_host,
        ssh_command: state.ssh_command,
        supervisor_process_id: state.supervisor_process_id.unwrap_or(supervisor_pid),
    })
}

/// Stop the recorded session and remove its state file. With `forget`, the
/// SSH alias is removed as well.
pub async fn disconnect(
    ctx: &SessionContext,
    forget: bool,
) -> Result<DisconnectReport, SessionError> {
    let channel = ctx.channel();
    let mut report = DisconnectReport::default();
    if let Some(state) = channel.read().await {
        kill_session(&state);
        report.supervisor_process_id = state.supervisor_process_id;
        report.endpoint_process_id = state.endpoint_process_id;
    } else {
        info!("No recorded session");
    }
    channel.remove().await?;

    if forget {
        report.removed_host_blocks = remove_host_block(&ctx.ssh_config, &ctx.alias).await?;
    }
    Ok(report)
}

/// Read the current state record.
pub async fn status(ctx: &SessionContext) -> StatusReport {
    let state = ctx.channel().read().await;
    let supervisor_alive = state
        .as_ref()
        .and_then(|s| s.supervisor_process_id)
        .is_some_and(is_process_alive);
    if let Some(s) = state.as_ref().filter(|s| !s.status.is_terminal() && !supervisor_alive) {
        warn!("State is {:?} but its supervisor is not running", s.status);
    }
    StatusReport {
        state,
        supervisor_alive,
    }
}

/// Stop every orphaned supervisor.
pub fn reap(ctx: &SessionContext) -> ReapReport {
    reaper::reap_with(
        reaper::list_processes,
        terminate_process,
        &ctx.supervisor_signature,
        std::process::id(),
    )
}

/// Stop the supervisor and endpoint named in `state`, if still alive.
///
/// The supervisor is asked to shut down first so it tears its endpoint down
/// itself; the endpoint group is killed only if it outlived that.
fn kill_session(state: &SessionState) {
    if let Some(pid) = state.supervisor_process_id.filter(|&p| is_process_alive(p)) {
        info!("Stopping supervisor (pid {pid})");
        if let Err(e) = terminate_process(pid) {
            warn!("{e}");
        }
    }
    if let Some(pid) = state.endpoint_process_id.filter(|&p| is_process_alive(p)) {
        info!("Killing endpoint (pid {pid})");
        kill_process_group(pid);
    }
}

/// Tear down a supervisor that never reached `ready`.
async fn abandon(channel: &StateChannel, supervisor_pid: u32) {
    if let Err(e) = terminate_process(supervisor_pid) {
        warn!("{e}");
    }
    if let Some(pid) = channel
        .read()
        .await
        .and_then(|s| s.endpoint_process_id)
        .filter(|&p| is_process_alive(p))
    {
        kill_process_group(pid);
    }
}
