use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::ImageAttachment;

/// The single identity allowed to answer visitors. Injected at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorIdentity(String);

impl OperatorIdentity {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `sender` is the configured operator.
    pub fn authorizes(&self, sender: &str) -> bool {
        !self.0.is_empty() && self.0 == sender.trim()
    }
}

impl std::fmt::Display for OperatorIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One inbound message from the operator channel, stripped of vendor detail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorMessage {
    pub sender: String,
    pub text: Option<String>,
    /// Text of the message being replied to, if this is a reply.
    pub quoted_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("operator channel rejected {method}: {reason}")]
    Rejected { method: &'static str, reason: String },
    #[error("operator channel transport failed during {method}")]
    Transport {
        method: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Outbound half of the operator channel.
#[async_trait]
pub trait OperatorChannel: Send + Sync {
    async fn send_text(
        &self,
        operator: &OperatorIdentity,
        text: &str,
    ) -> Result<SendReceipt, ChannelError>;

    async fn send_image(
        &self,
        operator: &OperatorIdentity,
        image: &ImageAttachment,
        caption: &str,
    ) -> Result<SendReceipt, ChannelError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentMessage {
    Text {
        to: OperatorIdentity,
        text: String,
    },
    Image {
        to: OperatorIdentity,
        caption: String,
        content_type: String,
        size: usize,
    },
}

impl SentMessage {
    /// Text body or caption.
    pub fn body(&self) -> &str {
        match self {
            SentMessage::Text { text, .. } => text,
            SentMessage::Image { caption, .. } => caption,
        }
    }
}

/// Records sends instead of performing them.
#[derive(Clone, Default)]
pub struct InMemoryOperatorChannel {
    sent: Arc<Mutex<Vec<SentMessage>>>,
    failing: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl InMemoryOperatorChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following send fail with [`ChannelError::Rejected`].
    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn take_sent(&self) -> Vec<SentMessage> {
        let mut guard = self.sent.lock().await;
        std::mem::take(&mut *guard)
    }

    /// Waits until at least `count` sends were recorded or `timeout` elapses.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<SentMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sent = self.sent().await;
            if sent.len() >= count || tokio::time::Instant::now() >= deadline {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn record(
        &self,
        method: &'static str,
        message: SentMessage,
    ) -> Result<SendReceipt, ChannelError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::Rejected {
                method,
                reason: "sends disabled".into(),
            });
        }
        self.sent.lock().await.push(message);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SendReceipt {
            message_id: Some(id.to_string()),
        })
    }
}

#[async_trait]
impl OperatorChannel for InMemoryOperatorChannel {
    async fn send_text(
        &self,
        operator: &OperatorIdentity,
        text: &str,
    ) -> Result<SendReceipt, ChannelError> {
        self.record(
            "sendMessage",
            SentMessage::Text {
                to: operator.clone(),
                text: text.to_string(),
            },
        )
        .await
    }

    async fn send_image(
        &self,
        operator: &OperatorIdentity,
        image: &ImageAttachment,
        caption: &str,
    ) -> Result<SendReceipt, ChannelError> {
        self.record(
            "sendPhoto",
            SentMessage::Image {
                to: operator.clone(),
                caption: caption.to_string(),
                content_type: image.content_type.clone(),
                size: image.bytes.len(),
            },
        )
        .await
    }
}
