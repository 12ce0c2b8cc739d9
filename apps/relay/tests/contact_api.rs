mod support;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use sfr_core::{ConnectionRegistry, InMemoryOperatorChannel, SentMessage, TokenPolicy};
use sfr_relay::{HttpOptions, RateSettings, build_router};
use std::sync::Arc;
use support::state;
use tower::ServiceExt;

const BOUNDARY: &str = "relay-test-boundary";

fn app(channel: &InMemoryOperatorChannel, rate: RateSettings) -> Router {
    let (state, _inbox) = state(
        Arc::new(ConnectionRegistry::new()),
        channel.clone(),
        TokenPolicy::Client,
        None,
    );
    let options = HttpOptions {
        contact_rate: rate,
        ..HttpOptions::default()
    };
    build_router(state, &options)
}

fn json_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/contact")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File {
        name: &'a str,
        file_name: &'a str,
        content_type: &'a str,
        data: &'a [u8],
    },
}

fn multipart_request(parts: &[Part<'_>]) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                        .as_bytes(),
                );
            }
            Part::File {
                name,
                file_name,
                content_type,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                         Content-Type: {content_type}\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    Request::builder()
        .method("POST")
        .uri("/api/contact")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn json_submission_is_forwarded_and_acknowledged() {
    let channel = InMemoryOperatorChannel::new();
    let response = app(&channel, RateSettings::default())
        .oneshot(json_request(json!({
            "name": "Ann",
            "replyToAddress": "ann@example.com",
            "messageText": "Do you ship abroad?",
            "token": "abc123"
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let request_id = response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["request_id"], request_id);

    let sent = channel.take_sent().await;
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0], SentMessage::Text { .. }));
    assert!(sent[0].body().contains("Do you ship abroad?"));
    assert!(sent[0].body().ends_with("Session-Token: abc123"));
}

#[tokio::test]
async fn validation_failures_are_400() {
    let channel = InMemoryOperatorChannel::new();
    for body in [
        json!({"token": "abc123"}),
        json!({"messageText": "   ", "token": "abc123"}),
        json!({"messageText": "Hi"}),
        json!({"messageText": "Hi", "token": "two words"}),
    ] {
        let response = app(&channel, RateSettings::default())
            .oneshot(json_request(body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].is_string());
    }

    let response = app(&channel, RateSettings::default())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/contact")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(channel.sent().await.is_empty());
}

#[tokio::test]
async fn other_content_types_are_415() {
    let channel = InMemoryOperatorChannel::new();
    let response = app(&channel, RateSettings::default())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/contact")
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn multipart_with_image_is_sent_as_photo() {
    let channel = InMemoryOperatorChannel::new();
    let png = b"\x89PNG\r\n\x1a\nfake";
    let response = app(&channel, RateSettings::default())
        .oneshot(multipart_request(&[
            Part::Text("name", "Ann"),
            Part::Text("email", "ann@example.com"),
            Part::Text("message", "See attached"),
            Part::Text("token", "abc123"),
            Part::File {
                name: "image",
                file_name: "shot.png",
                content_type: "image/png",
                data: png,
            },
        ]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let sent = channel.take_sent().await;
    match &sent[..] {
        [SentMessage::Image {
            caption,
            content_type,
            size,
            ..
        }] => {
            assert!(caption.contains("See attached"));
            assert!(caption.ends_with("Session-Token: abc123"));
            assert_eq!(content_type, "image/png");
            assert_eq!(*size, png.len());
        }
        other => panic!("expected one photo, got {other:?}"),
    }
}

#[tokio::test]
async fn multipart_without_file_falls_back_to_text() {
    let channel = InMemoryOperatorChannel::new();
    let response = app(&channel, RateSettings::default())
        .oneshot(multipart_request(&[
            Part::Text("messageText", "No picture"),
            Part::Text("token", "abc123"),
            Part::File {
                name: "image",
                file_name: "",
                content_type: "application/octet-stream",
                data: b"",
            },
        ]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let sent = channel.take_sent().await;
    assert!(matches!(&sent[..], [SentMessage::Text { .. }]));
}

#[tokio::test]
async fn non_image_upload_is_rejected() {
    let channel = InMemoryOperatorChannel::new();
    let response = app(&channel, RateSettings::default())
        .oneshot(multipart_request(&[
            Part::Text("messageText", "Invoice"),
            Part::Text("token", "abc123"),
            Part::File {
                name: "image",
                file_name: "invoice.pdf",
                content_type: "application/pdf",
                data: b"%PDF-1.7",
            },
        ]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(channel.sent().await.is_empty());
}

#[tokio::test]
async fn channel_failure_is_502() {
    let channel = InMemoryOperatorChannel::new();
    channel.fail_sends(true);
    let response = app(&channel, RateSettings::default())
        .oneshot(json_request(json!({"messageText": "Hi", "token": "abc123"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        body_json(response).await,
        json!({"error": "operator channel unavailable"})
    );
}

#[tokio::test]
async fn submissions_are_rate_limited_per_client() {
    let channel = InMemoryOperatorChannel::new();
    let app = app(
        &channel,
        RateSettings {
            capacity: 2,
            refill_per_sec: 0,
        },
    );
    let request = |client: &str| {
        let mut req = json_request(json!({"messageText": "Hi", "token": "abc123"}));
        req.headers_mut()
            .insert("x-forwarded-for", client.parse().unwrap());
        req
    };

    for _ in 0..2 {
        let res = app.clone().oneshot(request("198.51.100.1")).await.unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
    }
    let res = app.clone().oneshot(request("198.51.100.1")).await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);

    let res = app.clone().oneshot(request("198.51.100.2")).await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    assert_eq!(channel.sent().await.len(), 3);
}

#[tokio::test]
async fn webhook_route_is_absent_in_polling_mode() {
    let channel = InMemoryOperatorChannel::new();
    let response = app(&channel, RateSettings::default())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/telegram/webhook")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
