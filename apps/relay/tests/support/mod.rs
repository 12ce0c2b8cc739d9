#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use sfr_core::{
    ConnectionRegistry, InMemoryOperatorChannel, OperatorIdentity, ReplyRouter, TokenPolicy,
};
use sfr_relay::{AppState, HttpOptions, build_router};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

pub const OPERATOR: &str = "4242";
pub const WAIT: Duration = Duration::from_secs(3);

pub type Visitor = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct Relay {
    pub base: String,
    pub ws_base: String,
    pub channel: InMemoryOperatorChannel,
    pub registry: Arc<ConnectionRegistry>,
    pub http: reqwest::Client,
}

pub fn state(
    registry: Arc<ConnectionRegistry>,
    channel: InMemoryOperatorChannel,
    policy: TokenPolicy,
    secret: Option<&str>,
) -> (AppState, mpsc::Receiver<sfr_core::OperatorMessage>) {
    let (inbox, rx) = mpsc::channel(64);
    let state = AppState {
        registry,
        channel: Arc::new(channel),
        operator: OperatorIdentity::new(OPERATOR),
        token_policy: policy,
        inbox,
        webhook_secret: secret.map(str::to_string),
    };
    (state, rx)
}

pub async fn spawn_relay(policy: TokenPolicy, secret: Option<&str>) -> Relay {
    let registry = Arc::new(ConnectionRegistry::new());
    let channel = InMemoryOperatorChannel::new();
    let (state, inbox) = state(registry.clone(), channel.clone(), policy, secret);
    let router = ReplyRouter::new(
        registry.clone(),
        Arc::new(channel.clone()),
        OperatorIdentity::new(OPERATOR),
    );
    tokio::spawn(router.run(inbox));

    let options = HttpOptions {
        webhook: true,
        ..HttpOptions::default()
    };
    let app = build_router(state, &options);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Relay {
        base: format!("http://{addr}"),
        ws_base: format!("ws://{addr}"),
        channel,
        registry,
        http: reqwest::Client::new(),
    }
}

impl Relay {
    pub async fn connect(&self, query: &str) -> Visitor {
        let (socket, _) = connect_async(format!("{}/ws{query}", self.ws_base))
            .await
            .expect("websocket handshake");
        socket
    }

    /// Connects with `token` and waits until the registry knows it.
    pub async fn visitor(&self, token: &str) -> Visitor {
        let mut socket = self.connect(&format!("?token={token}")).await;
        let ack = next_json(&mut socket).await;
        assert_eq!(ack["type"], "connected-ack");
        assert_eq!(ack["token"], token);
        let registry = self.registry.clone();
        let key = sfr_core::CorrelationToken::parse(token).unwrap();
        wait_until(|| registry.lookup(&key).is_some()).await;
        socket
    }

    pub async fn submit(&self, body: Value) -> reqwest::Response {
        self.http
            .post(format!("{}/api/contact", self.base))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn operator_update(&self, update: Value) -> reqwest::Response {
        self.http
            .post(format!("{}/telegram/webhook", self.base))
            .json(&update)
            .send()
            .await
            .unwrap()
    }
}

pub fn reply_update(update_id: i64, sender: &str, text: &str, quoted: &str) -> Value {
    let chat: i64 = sender.parse().unwrap();
    json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id + 100,
            "date": 1_700_000_000,
            "chat": {"id": chat, "type": "private"},
            "from": {"id": chat},
            "text": text,
            "reply_to_message": {
                "message_id": update_id + 50,
                "chat": {"id": chat},
                "text": quoted
            }
        }
    })
}

pub fn plain_update(update_id: i64, sender: &str, text: &str) -> Value {
    let chat: i64 = sender.parse().unwrap();
    json!({
        "update_id": update_id,
        "message": {"message_id": update_id + 100, "chat": {"id": chat}, "text": text}
    })
}

pub async fn next_json(socket: &mut Visitor) -> Value {
    loop {
        let msg = tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("frame before timeout")
            .expect("stream open")
            .expect("frame ok");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

pub async fn send_text(socket: &mut Visitor, text: &str) {
    socket.send(Message::text(text.to_string())).await.unwrap();
}

pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
