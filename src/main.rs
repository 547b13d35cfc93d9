#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tether
//!
//! Keeps a remote interactive session reachable over a locally forwarded SSH
//! port.
//!
//! `tether connect` launches a detached `tether-supervisor`, which starts the
//! external endpoint CLI and reports progress through a JSON state file. Once
//! the endpoint prints its `ssh -p <port> <user>@<host>` marker, the
//! controller writes a `Host <alias>` block into the SSH client config so
//! `ssh <alias>` reaches the session. The supervisor stops the session after
//! a period without SSH connections or after a hard time limit.
//!
//! ## Subcommands
//!
//! - `tether connect -p <project>` — start a session and update the SSH alias
//! - `tether disconnect [--forget]` — stop the session, optionally drop the alias
//! - `tether status` — print the current state record
//! - `tether reap` — kill supervisors left behind by earlier crashes
//!
//! ## Architecture
//!
//! ```text
//! main.rs              — controller entry point, clap subcommands
//! bin/tether-supervisor.rs — detached supervisor entry point
//! controller.rs        — connect / disconnect / status / reap flows
//! supervisor/
//!   mod.rs             — endpoint event loop, timeouts, teardown
//!   log.rs             — tagged endpoint output log
//! state.rs             — state file schema, atomic writes, readiness poll
//! readiness.rs         — `ssh -p` marker detection
//! idle.rs              — idle state machine, ESTABLISHED connection probe
//! reaper.rs            — orphaned supervisor cleanup
//! ssh_config.rs        — idempotent `Host` block upsert
//! process.rs           — setsid spawns, process-group kill, one-shot exec
//! cli.rs               — external CLI arguments
//! config.rs            — TOML + env-var configuration
//! error.rs             — failure taxonomy
//! ```

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::error;

use tether::cli::EndpointRequest;
use tether::config::Config;
use tether::controller::{self, SessionContext};

/// Remote session supervisor with SSH alias management.
#[derive(Parser)]
#[command(name = "tether", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a session and point the SSH alias at it.
    Connect {
        /// Project owning the session, e.g. `alice/analysis`.
        #[arg(short, long)]
        project: String,
        /// vCPUs.
        #[arg(short, long, default_value_t = 1)]
        cpu: u32,
        /// Memory in GB.
        #[arg(short, long, default_value_t = 2)]
        memory: u32,
        /// GPUs.
        #[arg(short, long, default_value_t = 0)]
        gpus: u32,
        /// Runtime image id.
        #[arg(short, long)]
        runtime: Option<u64>,
        /// SSH host alias (overrides `[ssh] alias`).
        #[arg(long)]
        alias: Option<String>,
    },
    /// Stop the current session.
    Disconnect {
        /// Also remove the SSH alias.
        #[arg(long)]
        forget: bool,
        /// SSH host alias (overrides `[ssh] alias`).
        #[arg(long)]
        alias: Option<String>,
    },
    /// Print the current session state.
    Status,
    /// Kill orphaned supervisors.
    Reap,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("tether: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let alias = match &cli.command {
        Commands::Connect { alias, .. } | Commands::Disconnect { alias, .. } => alias.as_deref(),
        Commands::Status | Commands::Reap => None,
    };
    let ctx = match SessionContext::from_config(&config, alias) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Connect {
            project,
            cpu,
            memory,
            gpus,
            runtime,
            ..
        } => {
            let request = EndpointRequest {
                project,
                cpu,
                memory_gb: memory,
                gpus,
                runtime_id: runtime,
            };
            controller::connect(&ctx, &request).await.map(|c| print_json(&c))
        }
        Commands::Disconnect { forget, .. } => controller::disconnect(&ctx, forget)
            .await
            .map(|r| print_json(&r)),
        Commands::Status => {
            let report = controller::status(&ctx).await;
            if report.state.is_none() {
                println!("no session");
            } else {
                print_json(&report);
            }
            Ok(())
        }
        Commands::Reap => {
            print_json(&controller::reap(&ctx));
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

fn print_json(value: &impl Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("Failed to serialize output: {e}"),
    }
}
