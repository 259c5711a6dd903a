//! tcp-echo-server: a TCP echo server with bounded concurrent sessions
//!
//! Features:
//! - Raw byte echo, one reply per receive event
//! - Admission control: at most `max_clients` sessions, extra connections
//!   wait in the listen backlog
//! - Semaphore or polling admission gate
//! - Per-connection TCP keepalive
//! - Waits for a usable network link before listening
//! - Configuration via CLI arguments or TOML file

mod admission;
mod config;
mod counter;
mod link;
mod server;
mod session;
mod shutdown;
mod supervisor;

use config::{Config, LinkMode};
use link::{RouteProbe, StaticLink};
use shutdown::Shutdown;
use supervisor::{Supervisor, SupervisorError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        port = config.port,
        max_clients = config.max_clients,
        admission = ?config.admission,
        buffer_size = config.receive_buffer_size,
        link = ?config.link.mode,
        "Starting tcp-echo-server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config))?;
    Ok(())
}

/// Wire Ctrl-C to shutdown and run the supervisor with the configured link.
async fn run(config: Config) -> Result<(), SupervisorError> {
    let shutdown = Shutdown::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                signal.trigger();
            }
            Err(e) => warn!(error = %e, "Unable to listen for Ctrl-C"),
        }
    });

    let supervisor = Supervisor::new(config.clone());
    match config.link.mode {
        LinkMode::Probe => {
            let mut link = RouteProbe::new(&config.link);
            supervisor.run(&mut link, shutdown).await
        }
        LinkMode::Static => supervisor.run(&mut StaticLink, shutdown).await,
    }
}
