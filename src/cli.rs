//! Arguments for the external CLI that owns the remote side of a session.
//!
//! Only the two invocations the supervisor needs are modelled: starting an SSH
//! endpoint for a project, and stopping the project's remote session.

use serde::{Deserialize, Serialize};

/// Resources requested for a new endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointRequest {
    /// Owning project, e.g. `alice/analysis`.
    pub project: String,
    /// vCPUs.
    pub cpu: u32,
    /// Memory in GB.
    pub memory_gb: u32,
    /// GPUs; omitted from the command line when zero.
    #[serde(default)]
    pub gpus: u32,
    /// Runtime image id; the CLI picks its default when absent.
    #[serde(default)]
    pub runtime_id: Option<u64>,
}

/// Arguments that start an SSH endpoint.
pub fn endpoint_args(req: &EndpointRequest) -> Vec<String> {
    let mut args = vec![
        "ssh-endpoint".to_string(),
        "-p".to_string(),
        req.project.clone(),
        "-c".to_string(),
        req.cpu.to_string(),
        "-m".to_string(),
        req.memory_gb.to_string(),
    ];
    if req.gpus > 0 {
        args.push("-g".to_string());
        args.push(req.gpus.to_string());
    }
    if let Some(id) = req.runtime_id {
        args.push("-r".to_string());
        args.push(id.to_string());
    }
    args
}

/// Arguments that stop the remote session of `project`.
pub fn stop_session_args(project: &str) -> Vec<String> {
    vec![
        "sessions".to_string(),
        "stop".to_string(),
        "-p".to_string(),
        project.to_string(),
    ]
}
