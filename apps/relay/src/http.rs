use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{HeaderValue, Method, Request, StatusCode, header::HeaderName},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use sfr_core::{ConnectionRegistry, OperatorChannel, OperatorIdentity, OperatorMessage, TokenPolicy};
use std::{convert::Infallible, fmt, sync::Arc};
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

use crate::config::{RateSettings, RelayConfig, UpdatesMode};
use crate::contact::{MAX_BODY_BYTES, submit_contact};
use crate::rate::RateLimitLayer;
use crate::updates::telegram_webhook;
use crate::visitor::visitor_socket;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared handler state. Cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub channel: Arc<dyn OperatorChannel>,
    pub operator: OperatorIdentity,
    pub token_policy: TokenPolicy,
    /// Producer side of the reply router's queue.
    pub inbox: mpsc::Sender<OperatorMessage>,
    pub webhook_secret: Option<String>,
}

/// Router-level knobs that do not belong in handler state.
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    pub allowed_origins: Vec<String>,
    pub contact_rate: RateSettings,
    /// Mounts `POST /telegram/webhook`.
    pub webhook: bool,
}

impl From<&RelayConfig> for HttpOptions {
    fn from(config: &RelayConfig) -> Self {
        Self {
            allowed_origins: config.allowed_origins.clone(),
            contact_rate: config.contact_rate,
            webhook: config.updates_mode == UpdatesMode::Webhook,
        }
    }
}

pub fn build_router(state: AppState, options: &HttpOptions) -> Router {
    let contact = post(submit_contact)
        .layer::<_, Infallible>(RateLimitLayer::new(options.contact_rate))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    let mut app = Router::new()
        .route("/ws", get(visitor_socket))
        .route("/api/contact", contact)
        .route("/healthz", get(healthz));
    if options.webhook {
        app = app.route("/telegram/webhook", post(telegram_webhook));
    }

    app.layer(middleware::from_fn(tag_request))
        .layer(cors_layer(&options.allowed_origins))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "ok": true, "visitors": state.registry.size() }))
}

/// Per-request id, echoed in the `x-request-id` header and in contact acks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

async fn tag_request(mut req: Request<Body>, next: Next) -> Response {
    let id = RequestId::new();
    req.extensions_mut().insert(id.clone());

    let mut res = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(id.as_str()) {
        res.headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    res
}

/// 202 for a submission that reached the operator.
pub fn accepted(request_id: Option<&RequestId>) -> Response {
    let body = match request_id {
        Some(id) => json!({ "ok": true, "request_id": id.as_str() }),
        None => json!({ "ok": true }),
    };
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "skipping invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}
