//! Operator inbound path: Telegram webhook handler and `getUpdates` long-poll loop.
//!
//! Both producers feed the same bounded queue consumed by the reply router.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use rand::Rng;
use serde_json::Value;
use sfr_core::OperatorMessage;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};

use crate::http::AppState;
use crate::telegram::{TelegramApi, TelegramUpdate, operator_message};

pub const SECRET_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";
/// Long-poll window passed to `getUpdates`.
pub const POLL_TIMEOUT_SECS: u64 = 25;

#[cfg(test)]
const BASE_DELAY_MS: u64 = 5;
#[cfg(not(test))]
const BASE_DELAY_MS: u64 = 500;

#[cfg(test)]
const MAX_DELAY_MS: u64 = 200;
#[cfg(not(test))]
const MAX_DELAY_MS: u64 = 30_000;

pub fn secret_token_valid(expected: Option<&str>, provided: Option<&str>) -> bool {
    match expected {
        Some(exp) => provided == Some(exp),
        None => true,
    }
}

pub async fn telegram_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    if !secret_token_valid(state.webhook_secret.as_deref(), provided) {
        tracing::warn!("telegram secret token mismatch");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let update: TelegramUpdate = match serde_json::from_value(payload) {
        Ok(update) => update,
        Err(err) => {
            tracing::warn!(error = %err, "bad telegram update");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let Some(message) = operator_message(&update) else {
        tracing::debug!(update_id = update.update_id, "update without message dropped");
        return StatusCode::OK.into_response();
    };
    if state.inbox.send(message).await.is_err() {
        tracing::error!("reply router is gone; dropping operator message");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    StatusCode::OK.into_response()
}

/// Delay before the next `getUpdates` after `attempt` consecutive failures.
pub fn backoff_delay(attempt: u32) -> Duration {
    let pow = attempt.min(16);
    let capped = BASE_DELAY_MS.saturating_mul(1u64 << pow).min(MAX_DELAY_MS);
    let jitter = if capped == 0 {
        0
    } else {
        rand::rng().random_range(0..capped)
    };
    Duration::from_millis(capped.saturating_add(jitter).min(MAX_DELAY_MS))
}

pub struct UpdatePoller {
    api: Arc<dyn TelegramApi>,
    inbox: mpsc::Sender<OperatorMessage>,
    timeout_secs: u64,
}

impl UpdatePoller {
    pub fn new(api: Arc<dyn TelegramApi>, inbox: mpsc::Sender<OperatorMessage>) -> Self {
        Self {
            api,
            inbox,
            timeout_secs: POLL_TIMEOUT_SECS,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Polls until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// The offset moves past every update seen, including ones that carry nothing
    /// for the router, so Telegram never redelivers them.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(timeout_secs = self.timeout_secs, "telegram update poller started");
        let mut offset: Option<i64> = None;
        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let polled = tokio::select! {
                _ = shutdown.changed() => break,
                polled = self.api.get_updates(offset, self.timeout_secs) => polled,
            };
            match polled {
                Ok(updates) => {
                    failures = 0;
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        let Some(message) = operator_message(&update) else {
                            continue;
                        };
                        if self.inbox.send(message).await.is_err() {
                            tracing::warn!("reply router is gone; stopping poller");
                            return;
                        }
                    }
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = backoff_delay(failures);
                    tracing::warn!(
                        error = %err,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "getUpdates failed; backing off"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        tracing::info!("telegram update poller stopped");
    }
}
