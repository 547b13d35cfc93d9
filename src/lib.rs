#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! tether library — shared by the `tether` controller and the
//! `tether-supervisor` binary.
//!
//! - `supervisor` — detached endpoint supervisor event loop
//! - `state` — state file protocol between supervisor and controller
//! - `idle` — idle session detection
//! - `reaper` — orphaned supervisor cleanup
//! - `ssh_config` — SSH `Host` block maintenance
//! - `controller` — connect / disconnect / status / reap flows
//! - `config` — configuration loading

pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod idle;
pub mod process;
pub mod readiness;
pub mod reaper;
pub mod ssh_config;
pub mod state;
pub mod supervisor;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use controller::SessionContext;
pub use error::SessionError;
pub use state::{SessionState, SessionStatus, StateChannel};
pub use supervisor::{Supervisor, SupervisorConfig};
