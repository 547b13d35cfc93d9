//! Detached session supervisor. Launched by `tether connect` with the path of
//! a JSON payload file; see [`tether::supervisor`].

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tether::idle::SystemProbe;
use tether::supervisor::{shutdown_signal, Supervisor, SupervisorConfig, SupervisorOptions};

/// Supervise one remote session endpoint.
#[derive(Parser)]
#[command(name = "tether-supervisor", version)]
struct Cli {
    /// Launch payload written by the controller.
    payload: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let config = match SupervisorConfig::load(&cli.payload) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("tether-supervisor: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to build runtime: {e}");
            std::process::exit(1);
        }
    };

    let options = SupervisorOptions::from_config(&config);
    let code = runtime.block_on(async {
        Supervisor::new(config, options, SystemProbe)
            .run(shutdown_signal())
            .await
    });
    tracing::info!("Supervisor exiting with code {code}");
    std::process::exit(code);
}

/// Send `tracing` output to the session log; there is no terminal.
fn init_tracing(config: &SupervisorConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(parent) = config.log_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file)
    {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        Err(_) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::io::sink)
            .init(),
    }
}
