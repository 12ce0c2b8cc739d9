//! Minimal Telegram Bot API double.
//!
//! Outbound calls are logged and answered with `{"ok": true}`. Operator messages are
//! queued through `POST /inject` and handed out by the next `getUpdates`.

use axum::{
    Json, Router,
    extract::{FromRequest, Multipart, Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::{Map, Value, json};
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicI64, Ordering},
};
use std::time::Duration;
use tokio::time::Instant;

const MAX_POLL_SECS: u64 = 30;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct MockBot {
    next_message_id: AtomicI64,
    next_update_id: AtomicI64,
    pending: Mutex<Vec<Value>>,
}

impl MockBot {
    fn message_id(&self) -> i64 {
        self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn update_id(&self) -> i64 {
        self.next_update_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn drain(&self) -> Vec<Value> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

type Shared = Arc<MockBot>;

pub fn app() -> Router {
    Router::new()
        .route("/inject", post(inject))
        .route("/{bot}/{method}", post(bot_method))
        .with_state(Shared::default())
}

/// Returns pending updates, waiting up to `wait` for one to arrive.
async fn long_poll(bot: &MockBot, wait: Duration) -> Vec<Value> {
    let deadline = Instant::now() + wait;
    loop {
        let updates = bot.drain();
        if !updates.is_empty() || Instant::now() >= deadline {
            return updates;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn ok(result: Value) -> Response {
    Json(json!({ "ok": true, "result": result })).into_response()
}

fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn chat(chat_id: Option<&Value>) -> Value {
    let id = match chat_id {
        Some(Value::String(raw)) => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.clone())),
        Some(other) => other.clone(),
        None => Value::Null,
    };
    json!({ "id": id })
}

async fn bot_method(
    State(bot): State<Shared>,
    Path((token, method)): Path<(String, String)>,
    request: Request,
) -> Response {
    if !token.starts_with("bot") {
        return StatusCode::NOT_FOUND.into_response();
    }
    match method.as_str() {
        "sendPhoto" => send_photo(bot, request).await,
        "sendMessage" | "setWebhook" | "deleteWebhook" | "getUpdates" => {
            let body = match Json::<Value>::from_request(request, &()).await {
                Ok(Json(body)) => body,
                Err(_) => Value::Object(Map::new()),
            };
            match method.as_str() {
                "sendMessage" => {
                    tracing::info!(
                        chat_id = %body["chat_id"],
                        text = %body["text"],
                        "TELEGRAM sendMessage"
                    );
                    ok(json!({
                        "message_id": bot.message_id(),
                        "date": now(),
                        "chat": chat(body.get("chat_id")),
                        "text": body["text"],
                    }))
                }
                "getUpdates" => {
                    let wait = body["timeout"].as_u64().unwrap_or(0).min(MAX_POLL_SECS);
                    ok(Value::Array(long_poll(&bot, Duration::from_secs(wait)).await))
                }
                _ => {
                    tracing::info!(method = %method, payload = %body, "TELEGRAM bot management");
                    ok(Value::Bool(true))
                }
            }
        }
        other => {
            tracing::warn!(method = other, "unsupported mock method");
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "ok": false, "description": "Not Found: method not found" })),
            )
                .into_response()
        }
    }
}

async fn send_photo(bot: Shared, request: Request) -> Response {
    let mut multipart = match Multipart::from_request(request, &()).await {
        Ok(multipart) => multipart,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "description": err.body_text() })),
            )
                .into_response();
        }
    };
    let mut chat_id = None;
    let mut caption = None;
    let mut photo_len = 0;
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "chat_id" => chat_id = field.text().await.ok(),
            "caption" => caption = field.text().await.ok(),
            "photo" => photo_len = field.bytes().await.map(|b| b.len()).unwrap_or(0),
            _ => {}
        }
    }
    tracing::info!(?chat_id, photo_len, "TELEGRAM sendPhoto");
    ok(json!({
        "message_id": bot.message_id(),
        "date": now(),
        "chat": chat(chat_id.map(Value::String).as_ref()),
        "caption": caption,
        "photo": [{ "file_id": format!("mock-photo-{photo_len}"), "file_size": photo_len }],
    }))
}

/// Queues a `Message` object as the next operator update.
async fn inject(State(bot): State<Shared>, Json(mut message): Json<Value>) -> Response {
    if !message.is_object() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "description": "body must be a Message object" })),
        )
            .into_response();
    }
    if message.get("message_id").is_none() {
        message["message_id"] = json!(bot.message_id());
    }
    if message.get("date").is_none() {
        message["date"] = json!(now());
    }
    let update_id = bot.update_id();
    bot.pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(json!({ "update_id": update_id, "message": message }));
    tracing::info!(update_id, "queued operator update");
    ok(json!({ "update_id": update_id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn call(app: &Router, uri: &str, content_type: &str, body: Body) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, content_type)
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn send_message_returns_incrementing_ids() {
        let app = app();
        let body = || Body::from(json!({"chat_id": "4242", "text": "hi"}).to_string());
        let (status, first) = call(&app, "/botT/sendMessage", "application/json", body()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["ok"], true);
        assert_eq!(first["result"]["chat"]["id"], 4242);
        let (_, second) = call(&app, "/botT/sendMessage", "application/json", body()).await;
        assert_eq!(
            second["result"]["message_id"].as_i64().unwrap(),
            first["result"]["message_id"].as_i64().unwrap() + 1
        );
    }

    #[tokio::test]
    async fn injected_messages_are_drained_by_get_updates() {
        let app = app();
        let message = json!({"chat": {"id": 4242}, "text": "/status"});
        let body = Body::from(message.to_string());
        let (status, _) = call(&app, "/inject", "application/json", body).await;
        assert_eq!(status, StatusCode::OK);

        let (_, updates) =
            call(&app, "/botT/getUpdates", "application/json", Body::from("{}")).await;
        let updates = updates["result"].as_array().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["update_id"], 1);
        assert_eq!(updates[0]["message"]["text"], "/status");
        assert!(updates[0]["message"]["message_id"].is_i64());

        let (_, again) = call(&app, "/botT/getUpdates", "application/json", Body::from("{}")).await;
        assert!(again["result"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_photo_accepts_multipart() {
        let app = app();
        let body = "--b\r\nContent-Disposition: form-data; name=\"chat_id\"\r\n\r\n7\r\n\
                    --b\r\nContent-Disposition: form-data; name=\"caption\"\r\n\r\nhello\r\n\
                    --b\r\nContent-Disposition: form-data; name=\"photo\"; filename=\"a.png\"\r\n\
                    Content-Type: image/png\r\n\r\nPNG\r\n--b--\r\n";
        let content_type = "multipart/form-data; boundary=b";
        let (status, reply) = call(&app, "/botT/sendPhoto", content_type, Body::from(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["result"]["caption"], "hello");
        assert_eq!(reply["result"]["chat"]["id"], 7);
        assert_eq!(reply["result"]["photo"][0]["file_size"], 3);
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let (status, reply) =
            call(&app(), "/botT/sendSticker", "application/json", Body::from("{}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(reply["ok"], false);
    }
}
