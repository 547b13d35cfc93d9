//! Cleanup of supervisors left behind by crashed or killed controllers.
//!
//! Before a new session starts, every process invoked as the supervisor
//! binary is stopped, except the caller itself. Orphans get SIGTERM first so
//! they run their own teardown and take their endpoint down with them; SIGKILL
//! follows only if one is still alive after a grace period.
//!
//! Everything here is best-effort: failures are logged and reported, never
//! returned as errors, so a stuck orphan can't block a new session.

use std::path::Path;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SessionError;

/// File name the supervisor binary is invoked as.
pub const SUPERVISOR_SIGNATURE: &str = "tether-supervisor";

/// How long a SIGTERMed process gets before SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

const TERMINATE_POLL: Duration = Duration::from_millis(50);

/// A process as seen by the reaper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// argv, one element per argument.
    pub args: Vec<String>,
}

/// Outcome of one reaper pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReapReport {
    /// Orphans matching the signature.
    pub found: Vec<u32>,
    /// Orphans that were signalled successfully.
    pub killed: Vec<u32>,
    /// Orphans that could not be signalled, with the reason.
    pub failed: Vec<(u32, String)>,
}

/// Whether `args` is an invocation of the binary named `signature`.
///
/// Only argv[0] counts, so `less .../tether-supervisor` or
/// `gdb --args tether-supervisor` are left alone.
pub fn matches_signature(args: &[String], signature: &str) -> bool {
    args.first().is_some_and(|exe| {
        Path::new(exe)
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name == signature)
    })
}

/// Pick the processes to kill: signature matches, minus `self_pid`.
pub fn select_orphans(processes: &[ProcessInfo], signature: &str, self_pid: u32) -> Vec<u32> {
    processes
        .iter()
        .filter(|p| p.pid != self_pid)
        .filter(|p| matches_signature(&p.args, signature))
        .map(|p| p.pid)
        .collect()
}

/// Whether a process with `pid` exists (signal 0).
///
/// A process owned by another user still counts as alive. A zombie that is
/// only waiting to be reaped does not.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => !is_zombie(pid),
        Err(e) => e == nix::errno::Errno::EPERM,
    }
}

/// State field of `/proc/<pid>/stat` is `Z`.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            // comm may contain spaces and parens; the state follows the last ')'
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .is_some_and(|state| state == 'Z')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Send SIGKILL to `pid`. An already-gone process counts as success.
pub fn kill_process(pid: u32) -> Result<(), SessionError> {
    let raw = i32::try_from(pid)
        .map_err(|_| SessionError::OrphanCleanupFailure(format!("invalid pid {pid}")))?;
    if raw <= 0 {
        return Err(SessionError::OrphanCleanupFailure(format!("invalid pid {pid}")));
    }
    match signal::kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(SessionError::OrphanCleanupFailure(format!(
            "kill {pid}: {e}"
        ))),
    }
}

/// Stop `pid` gracefully: SIGTERM, wait up to [`TERMINATE_GRACE`], then
/// SIGKILL if it is still alive. An already-gone process counts as success.
pub fn terminate_process(pid: u32) -> Result<(), SessionError> {
    terminate_with_grace(pid, TERMINATE_GRACE)
}

pub fn terminate_with_grace(pid: u32, grace: Duration) -> Result<(), SessionError> {
    let raw = i32::try_from(pid)
        .ok()
        .filter(|&raw| raw > 0)
        .ok_or_else(|| SessionError::OrphanCleanupFailure(format!("invalid pid {pid}")))?;
    match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => return Ok(()),
        Err(e) => {
            return Err(SessionError::OrphanCleanupFailure(format!(
                "terminate {pid}: {e}"
            )))
        }
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return Ok(());
        }
        std::thread::sleep(TERMINATE_POLL);
    }
    if !is_process_alive(pid) {
        return Ok(());
    }
    info!("pid {pid} survived SIGTERM for {}ms, sending SIGKILL", grace.as_millis());
    kill_process(pid)
}

/// Enumerate processes via `/proc/<pid>/cmdline`.
#[cfg(target_os = "linux")]
pub fn list_processes() -> Result<Vec<ProcessInfo>, SessionError> {
    let entries = std::fs::read_dir("/proc")
        .map_err(|e| SessionError::OrphanCleanupFailure(format!("read /proc: {e}")))?;

    let mut processes = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Processes can exit between readdir and read
        let Ok(bytes) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        // cmdline is NUL-separated with a trailing NUL
        let args: Vec<String> = bytes
            .split(|&b| b == 0)
            .filter(|a| !a.is_empty())
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        if !args.is_empty() {
            processes.push(ProcessInfo { pid, args });
        }
    }
    Ok(processes)
}

/// Enumerate processes via `ps`.
#[cfg(not(target_os = "linux"))]
pub fn list_processes() -> Result<Vec<ProcessInfo>, SessionError> {
    let output = std::process::Command::new("ps")
        .args(["-axo", "pid=,command="])
        .stdin(std::process::Stdio::null())
        .output()
        .map_err(|e| SessionError::OrphanCleanupFailure(format!("ps: {e}")))?;
    if !output.status.success() {
        return Err(SessionError::OrphanCleanupFailure(format!(
            "ps exited with {}",
            output.status
        )));
    }
    Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `ps -o pid=,command=` output. Arguments are split on whitespace, so
/// paths with spaces are not preserved exactly.
pub fn parse_ps_output(text: &str) -> Vec<ProcessInfo> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse().ok()?;
            let args: Vec<String> = parts.map(ToString::to_string).collect();
            (!args.is_empty()).then_some(ProcessInfo { pid, args })
        })
        .collect()
}

/// Stop every process matching `signature` except `self_pid`.
///
/// Enumeration and kill are injected; production callers pass
/// [`list_processes`] and [`terminate_process`].
pub fn reap_with<L, K>(list: L, mut kill: K, signature: &str, self_pid: u32) -> ReapReport
where
    L: FnOnce() -> Result<Vec<ProcessInfo>, SessionError>,
    K: FnMut(u32) -> Result<(), SessionError>,
{
    let mut report = ReapReport::default();
    let processes = match list() {
        Ok(p) => p,
        Err(e) => {
            warn!("Orphan scan skipped: {e}");
            return report;
        }
    };

    report.found = select_orphans(&processes, signature, self_pid);
    if report.found.is_empty() {
        debug!("No orphaned {signature} processes");
        return report;
    }

    for &pid in &report.found {
        match kill(pid) {
            Ok(()) => {
                info!("Stopped orphaned {signature} (pid {pid})");
                report.killed.push(pid);
            }
            Err(e) => {
                warn!("Could not stop orphaned {signature} (pid {pid}): {e}");
                report.failed.push((pid, e.to_string()));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc_info(pid: u32, cmd: &str) -> ProcessInfo {
        ProcessInfo {
            pid,
            args: cmd.split(' ').map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn signature_matches_file_name_only() {
        let args = |s: &str| s.split(' ').map(ToString::to_string).collect::<Vec<_>>();
        assert!(matches_signature(&args("/opt/tether/bin/tether-supervisor /tmp/p.json"), SUPERVISOR_SIGNATURE));
        assert!(matches_signature(&args("tether-supervisor /tmp/p.json"), SUPERVISOR_SIGNATURE));
        assert!(!matches_signature(&args("/usr/bin/tether connect"), SUPERVISOR_SIGNATURE));
        assert!(!matches_signature(&args("vim tether-supervisor.rs"), SUPERVISOR_SIGNATURE));
        assert!(!matches_signature(&args("grep tether-supervisor-old"), SUPERVISOR_SIGNATURE));
        assert!(!matches_signature(&args("less /usr/local/bin/tether-supervisor"), SUPERVISOR_SIGNATURE));
        assert!(!matches_signature(&args("gdb --args target/debug/tether-supervisor"), SUPERVISOR_SIGNATURE));
        assert!(!matches_signature(&args("strace -f /opt/tether/bin/tether-supervisor /tmp/p.json"), SUPERVISOR_SIGNATURE));
        assert!(!matches_signature(&[], SUPERVISOR_SIGNATURE));
    }

    #[test]
    fn never_selects_own_pid() {
        let processes = vec![
            proc_info(100, "/bin/tether-supervisor /a.json"),
            proc_info(200, "/bin/tether-supervisor /b.json"),
            proc_info(300, "/bin/bash"),
            proc_info(400, "/bin/tether-supervisor /c.json"),
        ];
        let selected = select_orphans(&processes, SUPERVISOR_SIGNATURE, 200);
        assert_eq!(selected, vec![100, 400]);
        assert!(!selected.contains(&200));
    }

    #[test]
    fn reap_kills_selected_and_records_failures() {
        let processes = vec![
            proc_info(10, "/bin/tether-supervisor /a.json"),
            proc_info(11, "/bin/tether-supervisor /b.json"),
            proc_info(12, "/bin/tether-supervisor /c.json"),
        ];
        let mut killed = Vec::new();
        let report = reap_with(
            || Ok(processes),
            |pid| {
                killed.push(pid);
                if pid == 11 {
                    Err(SessionError::OrphanCleanupFailure("EPERM".into()))
                } else {
                    Ok(())
                }
            },
            SUPERVISOR_SIGNATURE,
            12,
        );
        assert_eq!(killed, vec![10, 11]);
        assert_eq!(report.found, vec![10, 11]);
        assert_eq!(report.killed, vec![10]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 11);
    }

    #[test]
    fn enumeration_failure_is_swallowed() {
        let report = reap_with(
            || Err(SessionError::OrphanCleanupFailure("no /proc".into())),
            |_| panic!("nothing to kill"),
            SUPERVISOR_SIGNATURE,
            1,
        );
        assert!(report.found.is_empty());
        assert!(report.failed.is_empty());
    }

    #[test]
    fn parse_ps_lines() {
        let text = "  1 /sbin/launchd\n 512 /usr/local/bin/tether-supervisor /tmp/p.json\n garbage\n";
        let procs = parse_ps_output(text);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[1].pid, 512);
        assert_eq!(procs[1].args[1], "/tmp/p.json");
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn listing_includes_self() {
        let me = std::process::id();
        let procs = list_processes().unwrap();
        assert!(procs.iter().any(|p| p.pid == me));
    }

    #[test]
    fn kill_process_handles_exited_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        kill_process(pid).unwrap();
        child.wait().unwrap();
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn wrapper_processes_are_not_orphans() {
        let processes = vec![
            proc_info(100, "less /usr/local/bin/tether-supervisor"),
            proc_info(101, "gdb --args target/debug/tether-supervisor"),
            proc_info(102, "/usr/local/bin/tether-supervisor /tmp/p.json"),
        ];
        assert_eq!(select_orphans(&processes, SUPERVISOR_SIGNATURE, 1), vec![102]);
    }

    #[test]
    fn exited_unwaited_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        // Exited but not yet waited on
        std::thread::sleep(Duration::from_millis(200));
        if cfg!(target_os = "linux") {
            assert!(!is_process_alive(pid));
        }
        child.wait().unwrap();
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn terminate_uses_sigterm_first() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        terminate_process(pid).unwrap();
        let status = child.wait().unwrap();
        use std::os::unix::process::ExitStatusExt as _;
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    }

    #[test]
    fn terminate_escalates_to_sigkill() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "trap '' TERM; while :; do sleep 1; done"])
            .spawn()
            .unwrap();
        let pid = child.id();
        // Let the shell install its trap
        std::thread::sleep(Duration::from_millis(200));
        let started = Instant::now();
        terminate_with_grace(pid, Duration::from_millis(300)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        let status = child.wait().unwrap();
        use std::os::unix::process::ExitStatusExt as _;
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    }

    #[test]
    fn terminate_missing_pid_is_ok() {
        terminate_process(i32::MAX as u32).unwrap();
    }

    #[test]
    fn kill_missing_pid_is_ok() {
        // Above any pid_max, so always ESRCH
        kill_process(i32::MAX as u32).unwrap();
    }
}
