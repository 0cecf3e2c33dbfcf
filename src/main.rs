use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use teeproxy::config::{Cli, Config};
use teeproxy::proxy::DualDispatcher;
use teeproxy::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load(Cli::parse())?;
    let dispatcher = Arc::new(DualDispatcher::from_config(&cfg)?);

    tokio::select! {
        res = server::listener::run(&cfg, dispatcher) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
