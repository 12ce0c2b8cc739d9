//! Renders visitor submissions into operator-channel messages.

use bytes::Bytes;
use sfr_telemetry::{record_counter, relay_span};
use std::borrow::Cow;
use tracing::Instrument;

use crate::{
    ChannelError, CorrelationToken, OperatorChannel, OperatorIdentity, SendReceipt, token_line,
};

/// Longest plain text message the operator channel accepts.
pub const TEXT_LIMIT: usize = 4096;
/// Longest photo caption the operator channel accepts.
pub const CAPTION_LIMIT: usize = 1024;

const HEADING: &str = "📬 New message from the storefront";
const NOT_PROVIDED: &str = "(not provided)";
const FIELD_LIMIT: usize = 200;
const FORWARDED_COUNTER: &str = "relay_submissions_forwarded_total";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub bytes: Bytes,
    pub content_type: String,
    pub file_name: String,
}

/// A contact-form message submitted by a visitor.
#[derive(Debug, Clone)]
pub struct ContactSubmission {
    pub name: Option<String>,
    pub reply_to: Option<String>,
    pub message: String,
    pub token: CorrelationToken,
    pub image: Option<ImageAttachment>,
}

/// A submission rendered for the operator channel.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub token: CorrelationToken,
    pub text: String,
    pub image: Option<ImageAttachment>,
}

impl OutboundEnvelope {
    pub fn from_submission(submission: ContactSubmission) -> Self {
        let limit = if submission.image.is_some() {
            CAPTION_LIMIT
        } else {
            TEXT_LIMIT
        };
        let text = render_submission(&submission, limit);
        Self {
            token: submission.token,
            text,
            image: submission.image,
        }
    }
}

/// Renders `submission` into at most `limit` characters.
///
/// Only the message body is shortened; the trailing token line is always present so
/// a reply to this message can be routed back.
pub fn render_submission(submission: &ContactSubmission, limit: usize) -> String {
    let head = format!(
        "{HEADING}\nName: {}\nReply-to: {}\nMessage:\n",
        field(submission.name.as_deref()),
        field(submission.reply_to.as_deref()),
    );
    let tail = format!("\n\n{}", token_line(&submission.token));
    let budget = limit.saturating_sub(head.chars().count() + tail.chars().count());
    let body = truncate(submission.message.trim(), budget);
    format!("{head}{body}{tail}")
}

/// Sends a rendered envelope to the operator, as a photo when an image is attached.
pub async fn forward(
    channel: &dyn OperatorChannel,
    operator: &OperatorIdentity,
    envelope: &OutboundEnvelope,
) -> Result<SendReceipt, ChannelError> {
    let kind = if envelope.image.is_some() {
        "image"
    } else {
        "text"
    };
    let span = relay_span("forward", envelope.token.as_str());
    let result = async {
        match &envelope.image {
            Some(image) => channel.send_image(operator, image, &envelope.text).await,
            None => channel.send_text(operator, &envelope.text).await,
        }
    }
    .instrument(span)
    .await;

    match &result {
        Ok(_) => {
            record_counter(FORWARDED_COUNTER, &[("kind", kind)]);
            tracing::info!(token = %envelope.token, kind, "submission forwarded to operator");
        }
        Err(err) => {
            tracing::warn!(
                token = %envelope.token,
                kind,
                error = %err,
                "forwarding submission failed"
            );
        }
    }
    result
}

fn field(value: Option<&str>) -> Cow<'_, str> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => truncate(v, FIELD_LIMIT),
        None => Cow::Borrowed(NOT_PROVIDED),
    }
}

fn truncate(text: &str, budget: usize) -> Cow<'_, str> {
    if text.chars().count() <= budget {
        return Cow::Borrowed(text);
    }
    if budget == 0 {
        return Cow::Borrowed("");
    }
    let kept: String = text.chars().take(budget - 1).collect();
    Cow::Owned(format!("{kept}…"))
}
