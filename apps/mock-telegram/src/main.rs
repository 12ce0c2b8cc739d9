use anyhow::{Context, Result};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    sfr_telemetry::install("sfr-mock-telegram", env!("CARGO_PKG_VERSION"))?;
    let bind = std::env::var("MOCK_TELEGRAM_BIND").unwrap_or_else(|_| "0.0.0.0:9081".into());
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!("mock-telegram listening on {}", listener.local_addr()?);
    axum::serve(listener, sfr_mock_telegram::app())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;
    Ok(())
}
