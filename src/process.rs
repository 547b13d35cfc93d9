//! Low-level process spawning and teardown.
//!
//! - [`spawn_endpoint`] starts the external CLI for a session: new session (no
//!   controlling terminal), own process group, piped output, `kill_on_drop`.
//! - [`spawn_detached`] launches the supervisor fire-and-forget so it outlives
//!   the controller.
//! - [`kill_process_group`] tears an endpoint down together with anything it
//!   forked.
//! - [`run_command`] runs a one-shot CLI call with captured output and a
//!   timeout.

use std::fmt::Write;
use std::os::unix::process::CommandExt as _;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

/// Max captured output per stream for [`run_command`] (64 KB).
const MAX_COMMAND_OUTPUT: usize = 64 * 1024;

/// Spawn the endpoint CLI with piped stdout/stderr and no stdin.
///
/// `setsid` in `pre_exec` detaches the child from any controlling terminal
/// and makes it a process group leader, so [`kill_process_group`] reaches its
/// whole tree.
pub fn spawn_endpoint(program: &str, args: &[String]) -> std::io::Result<Child> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // SAFETY: setsid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.spawn()
}

/// Launch `program` with `args` as an independent session leader with all
/// standard streams discarded, and return its pid without waiting on it.
///
/// `envs` are added on top of the inherited environment.
pub fn spawn_detached(
    program: &Path,
    args: &[&std::ffi::OsStr],
    envs: &[(&str, String)],
) -> std::io::Result<u32> {
    let mut cmd = std::process::Command::new(program);
    cmd.args(args)
        .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: setsid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = cmd.spawn()?;
    Ok(child.id())
}

/// SIGKILL the process group led by `pid`, falling back to the single process
/// if the group is already gone. Errors are ignored.
pub fn kill_process_group(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 0 {
        return;
    }
    if signal::kill(Pid::from_raw(-raw), Signal::SIGKILL).is_err() {
        let _ = signal::kill(Pid::from_raw(raw), Signal::SIGKILL);
    }
}

/// Run `program args...` to completion, capturing output.
///
/// Stdout and stderr are read concurrently to avoid pipe deadlock. The whole
/// call is bounded by `timeout`; on expiry the child is killed via
/// `kill_on_drop`.
pub async fn run_command(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CommandError::SpawnFailed(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| CommandError::ProcessFailed("Failed to take stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| CommandError::ProcessFailed("Failed to take stderr pipe".to_string()))?;

    let run = async {
        let (stdout_data, stderr_data) = tokio::join!(
            read_capped(&mut stdout, MAX_COMMAND_OUTPUT),
            read_capped(&mut stderr, MAX_COMMAND_OUTPUT),
        );
        let status = child
            .wait()
            .await
            .map_err(|e| CommandError::ProcessFailed(e.to_string()))?;
        Ok::<_, CommandError>(CommandOutput {
            exit_code: status.code(),
            stdout: stdout_data,
            stderr: stderr_data,
        })
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(result) => result,
        Err(_) => Err(CommandError::Timeout(timeout)),
    }
}

/// Read everything from `reader`, keeping the first `max_bytes`.
///
/// Keeps draining past the cap so the child never blocks on a full pipe.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> String {
    let mut buf = Vec::with_capacity(max_bytes.min(8192));
    let mut tmp = [0u8; 8192];
    let mut total_read = 0usize;
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total_read += n;
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if total_read > max_bytes {
        let _ = write!(s, "\n[truncated: {total_read} bytes total]");
    }
    s
}

/// Result of [`run_command`].
#[derive(Debug)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Errors from [`run_command`].
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
    #[error("Process error: {0}")]
    ProcessFailed(String),
    #[error("Command timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaper::is_process_alive;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn run_command_captures_both_streams() {
        let out = run_command("/bin/sh", &sh("echo out; echo err >&2; exit 4"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(4));
        assert!(!out.success());
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[tokio::test]
    async fn run_command_times_out() {
        let err = run_command("/bin/sh", &sh("sleep 10"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));
    }

    #[tokio::test]
    async fn run_command_missing_binary() {
        let err = run_command("/nonexistent/cli", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn endpoint_is_group_leader_and_group_kill_works() {
        let mut child = spawn_endpoint("/bin/sh", &sh("sleep 30 & wait")).unwrap();
        let pid = child.id().unwrap();
        // Give the shell a moment to exec
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pgid = nix::unistd::getpgid(Some(Pid::from_raw(pid as i32))).unwrap();
        assert_eq!(pgid.as_raw(), pid as i32);

        kill_process_group(pid);
        let status = child.wait().await.unwrap();
        assert!(status.code().is_none());
    }

    #[test]
    fn detached_spawn_returns_pid() {
        let args = [std::ffi::OsStr::new("-c"), std::ffi::OsStr::new("sleep 5")];
        let pid = spawn_detached(Path::new("/bin/sh"), &args, &[]).unwrap();
        assert!(is_process_alive(pid));
        kill_process_group(pid);
    }
}
