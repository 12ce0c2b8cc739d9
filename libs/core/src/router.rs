//! Routes operator messages back to visitor connections.

use sfr_telemetry::{record_counter, relay_span};
use std::sync::Arc;
use time::{OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    ConnectionRegistry, CorrelationToken, OperatorChannel, OperatorIdentity, OperatorMessage,
    TEXT_LIMIT, VisitorFrame, extract_token,
};

/// Tokens listed individually in a status summary.
pub const STATUS_LIST_LIMIT: usize = 50;

pub const MISSING_TOKEN_NOTICE: &str = "Could not find a session token in the quoted message.";
pub const EMPTY_REPLY_NOTICE: &str = "Only text replies can be relayed to visitors.";

const OUTCOME_COUNTER: &str = "relay_operator_messages_total";
const CLOCK: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]:[second]");

/// An operator reply paired with the message it quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub original_quoted_text: String,
    pub reply_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Sender is not the operator; nothing was sent.
    Ignored,
    /// Not a reply; a status summary went back to the operator.
    Status { visitors: usize },
    MissingToken,
    EmptyReply,
    Delivered(CorrelationToken),
    /// No open connection for the token. Expected when a visitor left.
    Offline(CorrelationToken),
}

impl RouteOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RouteOutcome::Ignored => "ignored",
            RouteOutcome::Status { .. } => "status",
            RouteOutcome::MissingToken => "missing_token",
            RouteOutcome::EmptyReply => "empty_reply",
            RouteOutcome::Delivered(_) => "delivered",
            RouteOutcome::Offline(_) => "offline",
        }
    }
}

/// Single consumer of the operator inbox.
///
/// Messages are handled one at a time in arrival order, which keeps replies to a
/// given visitor in the order the operator sent them.
pub struct ReplyRouter {
    registry: Arc<ConnectionRegistry>,
    channel: Arc<dyn OperatorChannel>,
    operator: OperatorIdentity,
}

impl ReplyRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        channel: Arc<dyn OperatorChannel>,
        operator: OperatorIdentity,
    ) -> Self {
        Self {
            registry,
            channel,
            operator,
        }
    }

    /// Consumes `inbox` until every sender is dropped.
    pub async fn run(self, mut inbox: mpsc::Receiver<OperatorMessage>) {
        tracing::info!(operator = %self.operator, "reply router started");
        while let Some(message) = inbox.recv().await {
            self.handle(message).await;
        }
        tracing::info!("reply router stopped");
    }

    pub async fn handle(&self, message: OperatorMessage) -> RouteOutcome {
        let outcome = self.route(message).await;
        record_counter(OUTCOME_COUNTER, &[("outcome", outcome.label())]);
        outcome
    }

    async fn route(&self, message: OperatorMessage) -> RouteOutcome {
        if !self.operator.authorizes(&message.sender) {
            tracing::debug!(sender = %message.sender, "ignoring message from unauthorized sender");
            return RouteOutcome::Ignored;
        }

        let Some(quoted) = message.quoted_text else {
            let entries = self.registry.entries();
            self.notify(&status_summary(&entries)).await;
            return RouteOutcome::Status {
                visitors: entries.len(),
            };
        };

        let Some(token) = extract_token(&quoted) else {
            self.notify(MISSING_TOKEN_NOTICE).await;
            return RouteOutcome::MissingToken;
        };

        let reply_text = message
            .text
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        let Some(reply_text) = reply_text else {
            self.notify(EMPTY_REPLY_NOTICE).await;
            return RouteOutcome::EmptyReply;
        };

        let reply = ReplyEnvelope {
            original_quoted_text: quoted,
            reply_text,
        };
        let span = relay_span("reply", token.as_str());
        self.deliver(token, reply).instrument(span).await
    }

    async fn deliver(&self, token: CorrelationToken, reply: ReplyEnvelope) -> RouteOutcome {
        let delivered = match self.registry.lookup(&token) {
            Some(handle) if handle.is_open() => {
                match handle.deliver(VisitorFrame::operator_reply(reply.reply_text)) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(token = %token, error = %err, "visitor delivery failed");
                        false
                    }
                }
            }
            Some(_) => {
                tracing::debug!(token = %token, "visitor connection already closed");
                false
            }
            None => false,
        };

        if delivered {
            tracing::info!(
                token = %token,
                quoted_len = reply.original_quoted_text.len(),
                "operator reply delivered"
            );
            self.notify(&delivered_notice(&token)).await;
            RouteOutcome::Delivered(token)
        } else {
            tracing::info!(token = %token, "visitor offline; reply dropped");
            self.notify(&offline_notice(&token)).await;
            RouteOutcome::Offline(token)
        }
    }

    async fn notify(&self, text: &str) {
        if let Err(err) = self.channel.send_text(&self.operator, text).await {
            tracing::warn!(error = %err, "failed to notify operator");
        }
    }
}

pub fn delivered_notice(token: &CorrelationToken) -> String {
    format!("✅ Reply delivered to visitor {token}.")
}

pub fn offline_notice(token: &CorrelationToken) -> String {
    format!("⚠️ Visitor {token} is offline; reply not delivered.")
}

/// Human-readable summary of connected visitors for the operator.
///
/// Lists at most [`STATUS_LIST_LIMIT`] tokens and stays within [`TEXT_LIMIT`]
/// characters.
pub fn status_summary(entries: &[(CorrelationToken, OffsetDateTime)]) -> String {
    let mut out = format!(
        "🟢 Feedback relay is online.\nConnected visitors: {}",
        entries.len()
    );
    let tail_room = remainder_line(entries.len()).chars().count();
    let mut used = out.chars().count();
    let mut listed = 0;
    for (token, since) in entries.iter().take(STATUS_LIST_LIMIT) {
        let clock = since.format(CLOCK).unwrap_or_default();
        let line = format!("\n• {token} (since {clock} UTC)");
        let len = line.chars().count();
        if used + len + tail_room > TEXT_LIMIT {
            break;
        }
        out.push_str(&line);
        used += len;
        listed += 1;
    }
    if listed < entries.len() {
        out.push_str(&remainder_line(entries.len() - listed));
    }
    out
}

fn remainder_line(count: usize) -> String {
    format!("\n…and {count} more")
}
