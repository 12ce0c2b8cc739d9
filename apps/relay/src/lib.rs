//! Storefront feedback relay service.
//!
//! Wires the transport-neutral pieces from `sfr-core` to axum (visitor websockets,
//! contact form, Telegram webhook) and to the Telegram Bot API.

pub mod config;
pub mod contact;
pub mod http;
pub mod rate;
pub mod telegram;
pub mod updates;
pub mod visitor;

use anyhow::{Context, Result};
use sfr_core::{ConnectionRegistry, ReplyRouter};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
};

pub use config::{ConfigError, RateSettings, RelayConfig, UpdatesMode};
pub use http::{AppState, HttpOptions, build_router};
pub use telegram::{HttpTelegramApi, TelegramApi};
pub use updates::UpdatePoller;

/// Operator messages buffered between the Telegram side and the reply router.
pub const OPERATOR_INBOX_CAPACITY: usize = 256;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the relay until `shutdown` resolves.
pub async fn run<F>(config: RelayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let client = reqwest::Client::builder()
        .build()
        .context("build telegram http client")?;
    let telegram = Arc::new(HttpTelegramApi::new(
        client,
        &config.api_base,
        &config.bot_token,
    ));
    let registry = Arc::new(ConnectionRegistry::new());
    let (inbox_tx, inbox_rx) = mpsc::channel(OPERATOR_INBOX_CAPACITY);

    let router = ReplyRouter::new(registry.clone(), telegram.clone(), config.operator.clone());
    let router_task = tokio::spawn(router.run(inbox_rx));

    let (stop_tx, stop_rx) = watch::channel(false);
    let poller_task = match config.updates_mode {
        UpdatesMode::Polling => {
            if let Err(err) = telegram.delete_webhook(false).await {
                tracing::warn!(error = %err, "failed to clear telegram webhook before polling");
            }
            let poller = UpdatePoller::new(telegram.clone(), inbox_tx.clone());
            Some(tokio::spawn(poller.run(stop_rx)))
        }
        UpdatesMode::Webhook => {
            match &config.webhook_url {
                Some(url) => {
                    telegram
                        .set_webhook(url, config.webhook_secret.as_deref())
                        .await
                        .context("register telegram webhook")?;
                    tracing::info!(url = %url, "telegram webhook registered");
                }
                None => tracing::info!(
                    "TELEGRAM_WEBHOOK_URL not set; expecting the webhook to be registered already"
                ),
            }
            None
        }
    };

    let state = AppState {
        registry,
        channel: telegram,
        operator: config.operator.clone(),
        token_policy: config.token_policy,
        inbox: inbox_tx,
        webhook_secret: config.webhook_secret.clone(),
    };
    let app = build_router(state, &HttpOptions::from(&config));

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    tracing::info!(addr = %listener.local_addr()?, mode = ?config.updates_mode, "relay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("serve relay")?;

    tracing::info!("http server drained; stopping background tasks");
    stop_tx.send(true).ok();
    if let Some(task) = poller_task {
        if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
            tracing::warn!("update poller did not stop in time");
        }
    }
    if tokio::time::timeout(DRAIN_TIMEOUT, router_task).await.is_err() {
        tracing::warn!("reply router did not drain in time");
    }
    Ok(())
}
