//! prefix-echo: a prefixed line echo server
//!
//! Every newline-terminated line a client sends is written back to that
//! client with a configured prefix in front of it.
//!
//! Features:
//! - One task per connection on a multi-threaded tokio runtime
//! - Open-connection and received-line counters reported every second
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod server;
mod stats;

use config::Config;
use server::Server;
use tracing::{error, info};
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
        listen = %config.listen,
        workers = ?config.workers,
        max_connections = ?config.max_connections,
        stats_interval_secs = config.stats_interval.as_secs(),
        "Starting prefix-echo server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(run(config));
    Ok(())
}

/// Bind and serve; a bind failure ends the process with a non-zero status
async fn run(config: Config) {
    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to create listener");
            std::process::exit(1);
        }
    };

    server.run().await;
}
