use anyhow::{Context, Result};
use sfr_relay::RelayConfig;
use sfr_telemetry::{TelemetryConfig, init_telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = TelemetryConfig::from_env("sfr-relay", env!("CARGO_PKG_VERSION"));
    init_telemetry(telemetry)?;

    let config = RelayConfig::from_env().context("load relay configuration")?;
    tracing::info!(?config, "relay configuration loaded");
    sfr_relay::run(config, shutdown_signal()).await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown requested"),
        Err(err) => {
            tracing::error!(error = %err, "cannot listen for ctrl-c; running until killed");
            std::future::pending::<()>().await;
        }
    }
}
