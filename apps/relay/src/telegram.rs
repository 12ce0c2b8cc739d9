//! Telegram Bot API adapter.
//!
//! `HttpTelegramApi` is both the outbound [`OperatorChannel`] and the bot-management
//! client used to receive operator messages (`getUpdates` or `setWebhook`).

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, multipart};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use sfr_core::{
    ChannelError, ImageAttachment, OperatorChannel, OperatorIdentity, OperatorMessage, SendReceipt,
};
use std::time::Duration;
use tokio::time::sleep;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_secs(1),
    Duration::from_secs(4),
];

#[derive(Debug, Clone, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageRef {
    message_id: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub edited_message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default)]
    pub date: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub reply_to_message: Option<Box<TelegramMessage>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(default)]
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

/// Maps an update to the transport-neutral shape the reply router consumes.
///
/// The sender is the chat id, which is what `TELEGRAM_OPERATOR_CHAT_ID` names. Edited
/// messages are skipped so an edit never re-sends a reply.
pub fn operator_message(update: &TelegramUpdate) -> Option<OperatorMessage> {
    let message = update.message.as_ref()?;
    let quoted_text = message.reply_to_message.as_ref().map(|quoted| {
        quoted
            .text
            .clone()
            .or_else(|| quoted.caption.clone())
            .unwrap_or_default()
    });
    Some(OperatorMessage {
        sender: message.chat.id.to_string(),
        text: message.text.clone(),
        quoted_text,
    })
}

/// Bot-management calls used to receive operator messages.
#[async_trait]
pub trait TelegramApi: Send + Sync {
    async fn get_updates(&self, offset: Option<i64>, timeout_secs: u64)
    -> Result<Vec<TelegramUpdate>>;
    async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<()>;
    async fn delete_webhook(&self, drop_pending: bool) -> Result<()>;
}

#[derive(Clone)]
pub struct HttpTelegramApi {
    client: Client,
    api_base: String,
    bot_token: String,
}

impl HttpTelegramApi {
    pub fn new(client: Client, api_base: &str, bot_token: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        method: &'static str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Option<T>, ChannelError> {
        let res = self
            .client
            .post(self.url(method))
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|err| transport(method, err))?;
        decode(method, res).await
    }
}

async fn decode<T: DeserializeOwned>(
    method: &'static str,
    res: reqwest::Response,
) -> Result<Option<T>, ChannelError> {
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(ChannelError::Rejected {
            method,
            reason: format!("{status}: {body}"),
        });
    }
    let body: TelegramResponse<T> = res.json().await.map_err(|err| transport(method, err))?;
    if body.ok {
        Ok(body.result)
    } else {
        Err(ChannelError::Rejected {
            method,
            reason: body.description.unwrap_or_else(|| "unknown error".into()),
        })
    }
}

fn transport(method: &'static str, err: reqwest::Error) -> ChannelError {
    ChannelError::Transport {
        method,
        source: Box::new(err),
    }
}

fn receipt(result: Option<MessageRef>) -> SendReceipt {
    SendReceipt {
        message_id: result.map(|msg| msg.message_id.to_string()),
    }
}

/// Retries `op` after 250ms, 1s and 4s before giving up.
pub(crate) async fn with_retry<F, Fut, T>(method: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < RETRY_DELAYS.len() => {
                tracing::debug!(method, attempt, error = %err, "telegram call failed; retrying");
                sleep(RETRY_DELAYS[attempt]).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[async_trait]
impl OperatorChannel for HttpTelegramApi {
    async fn send_text(
        &self,
        operator: &OperatorIdentity,
        text: &str,
    ) -> Result<SendReceipt, ChannelError> {
        let payload = json!({
            "chat_id": operator.as_str(),
            "text": text,
        });
        let result = self
            .post_json::<MessageRef>("sendMessage", &payload, REQUEST_TIMEOUT)
            .await?;
        Ok(receipt(result))
    }

    async fn send_image(
        &self,
        operator: &OperatorIdentity,
        image: &ImageAttachment,
        caption: &str,
    ) -> Result<SendReceipt, ChannelError> {
        const METHOD: &str = "sendPhoto";
        let photo = multipart::Part::bytes(image.bytes.to_vec())
            .file_name(image.file_name.clone())
            .mime_str(&image.content_type)
            .map_err(|err| ChannelError::Rejected {
                method: METHOD,
                reason: format!("invalid image content type: {err}"),
            })?;
        let form = multipart::Form::new()
            .text("chat_id", operator.as_str().to_string())
            .text("caption", caption.to_string())
            .part("photo", photo);
        let res = self
            .client
            .post(self.url(METHOD))
            .timeout(REQUEST_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(|err| transport(METHOD, err))?;
        Ok(receipt(decode::<MessageRef>(METHOD, res).await?))
    }
}

#[async_trait]
impl TelegramApi for HttpTelegramApi {
    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<TelegramUpdate>> {
        let mut payload = json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            payload["offset"] = json!(offset);
        }
        let timeout = REQUEST_TIMEOUT + Duration::from_secs(timeout_secs);
        with_retry("getUpdates", || async {
            let updates = self
                .post_json::<Vec<TelegramUpdate>>("getUpdates", &payload, timeout)
                .await?;
            Ok::<_, anyhow::Error>(updates.unwrap_or_default())
        })
        .await
    }

    async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<()> {
        let mut payload = json!({
            "url": url,
            "allowed_updates": ["message"],
        });
        if let Some(secret) = secret {
            payload["secret_token"] = Value::String(secret.to_string());
        }
        with_retry("setWebhook", || async {
            self.post_json::<Value>("setWebhook", &payload, REQUEST_TIMEOUT)
                .await?;
            Ok::<_, anyhow::Error>(())
        })
        .await
    }

    async fn delete_webhook(&self, drop_pending: bool) -> Result<()> {
        let payload = json!({ "drop_pending_updates": drop_pending });
        with_retry("deleteWebhook", || async {
            self.post_json::<Value>("deleteWebhook", &payload, REQUEST_TIMEOUT)
                .await?;
            Ok::<_, anyhow::Error>(())
        })
        .await
    }
}
