//! tcp-meter: TCP throughput measurement pair
//!
//! - `server`: accepts connections, measures received bytes over one-second
//!   windows and appends `HH:MM:SS,<kbps>Kbps` lines to a log file
//! - `client`: keeps a connection to the server, forwards stdin to it and
//!   reconnects after a fixed delay whenever the connection is lost
//!
//! Configuration via CLI arguments or TOML file

mod client;
mod config;
mod logger;
mod server;
mod window;

use client::ReconnectingClient;
use config::{Command, Config};
use server::Server;
use tracing::info;
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

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    if config.command == (Command::Server { suffix: None }) {
        println!("usage: tcp-meter server <log file name>");
    }

    match config.command {
        Command::Server { .. } => runtime.block_on(run_server(config)),
        Command::Client => runtime.block_on(run_client(config)),
    }
}

/// Run the measurement server until killed; bind failure is fatal
async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.server.listen,
        log_dir = %config.server.log_dir.display(),
        "Starting tcp-meter server"
    );

    Server::new(config.server).run().await?;
    Ok(())
}

/// Run the reconnecting client until killed
async fn run_client(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        target_addr = %config.client.target,
        retry_delay_ms = config.client.retry_delay.as_millis() as u64,
        "Starting tcp-meter client"
    );

    ReconnectingClient::new(config.client, tokio::io::stdin(), tokio::io::stdout())
        .run()
        .await;
    Ok(())
}
