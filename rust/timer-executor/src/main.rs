use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use timer_executor::app::{self, Backends};
use timer_executor::telemetry;
use timer_executor::Config;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = telemetry::init_tracing() {
        eprintln!("Failed to initialize tracing: {e}");
    }

    info!("Starting timer executor");

    let config = Config::load().context("Failed to load configuration")?;
    let backends = Backends::connect(&config).await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        shutdown.cancel();
    });

    let stats = app::run(&config, backends, cancel).await?;

    info!(?stats, "Timer executor stopped");
    telemetry::shutdown_tracing();
    Ok(())
}
