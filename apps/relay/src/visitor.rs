//! Visitor websocket ingress: `GET /ws?token=…`.

use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use serde::Deserialize;
use sfr_core::{ClientFrame, ConnectionRegistry, CorrelationToken, VisitorFrame, VisitorHandle};
use sfr_telemetry::{record_counter, relay_span};
use std::sync::Arc;
use tracing::Instrument;

use crate::http::AppState;

pub const MISSING_TOKEN_REASON: &str = "token query parameter is required";

const MALFORMED_COUNTER: &str = "relay_malformed_frames_total";

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn visitor_socket(
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = state.token_policy.resolve(query.token.as_deref());
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| async move {
        match token {
            Some(token) => {
                let span = relay_span("visitor", token.as_str());
                run_visitor(socket, registry, token).instrument(span).await;
            }
            None => reject(socket).await,
        }
    })
}

async fn reject(mut socket: WebSocket) {
    tracing::info!("visitor handshake without a usable token; closing");
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Utf8Bytes::from_static(MISSING_TOKEN_REASON),
    };
    if let Err(err) = socket.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %err, "failed to send policy close");
    }
}

async fn run_visitor(
    mut socket: WebSocket,
    registry: Arc<ConnectionRegistry>,
    token: CorrelationToken,
) {
    let (handle, mut outbound) = VisitorHandle::channel();
    let connection_id = handle.id();

    if let Err(err) = send_frame(&mut socket, &VisitorFrame::connected_ack(token.clone())).await {
        tracing::warn!(%connection_id, error = %err, "failed to acknowledge visitor");
        return;
    }
    if let Some(previous) = registry.register(token.clone(), handle) {
        tracing::info!(
            %connection_id,
            displaced = %previous.handle.id(),
            "token re-registered; older connection no longer receives replies"
        );
    }
    tracing::info!(%connection_id, visitors = registry.size(), "visitor connected");

    // Closes once this connection is displaced; the socket itself stays up.
    let mut reachable = true;
    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = handle_client_text(&mut socket, text.as_str()).await {
                            tracing::warn!(%connection_id, error = %err, "websocket send error");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::warn!(%connection_id, error = %err, "websocket recv error");
                        break;
                    }
                }
            }
            frame = outbound.recv(), if reachable => {
                match frame {
                    Some(frame) => {
                        if let Err(err) = send_frame(&mut socket, &frame).await {
                            tracing::warn!(%connection_id, error = %err, "websocket send error");
                            break;
                        }
                    }
                    None => reachable = false,
                }
            }
        }
    }

    let released = registry.release(&token, connection_id);
    tracing::info!(%connection_id, released, visitors = registry.size(), "visitor disconnected");
}

async fn handle_client_text(socket: &mut WebSocket, text: &str) -> Result<(), axum::Error> {
    match ClientFrame::parse(text) {
        Ok(ClientFrame::Ping) => send_frame(socket, &VisitorFrame::pong()).await,
        Ok(ClientFrame::Other) => {
            tracing::debug!("ignoring unsupported visitor frame");
            Ok(())
        }
        Err(err) => {
            record_counter(MALFORMED_COUNTER, &[]);
            tracing::warn!(error = %err, "malformed visitor frame dropped");
            Ok(())
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &VisitorFrame) -> Result<(), axum::Error> {
    let payload = match frame.to_json() {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(kind = frame.kind(), error = %err, "failed to encode visitor frame");
            return Ok(());
        }
    };
    socket.send(Message::Text(payload.into())).await
}
