//! `POST /api/contact`: forwards a visitor's message to the operator.

use axum::{
    Extension, Json,
    extract::{FromRequest, Multipart, Request, State, multipart::Field},
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sfr_core::{
    ChannelError, ContactSubmission, CorrelationToken, ImageAttachment, OutboundEnvelope, forward,
};

use crate::http::{AppState, RequestId, accepted};

/// Largest accepted image upload.
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
/// Request body cap for the contact route; leaves room for the text fields.
pub const MAX_BODY_BYTES: usize = MAX_IMAGE_BYTES + 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ContactError {
    #[error("{0}")]
    Invalid(&'static str),
    #[error("content type must be application/json or multipart/form-data")]
    UnsupportedMediaType,
    #[error("operator channel unavailable")]
    Channel(#[from] ChannelError),
}

impl ContactError {
    pub fn status(&self) -> StatusCode {
        match self {
            ContactError::Invalid(_) => StatusCode::BAD_REQUEST,
            ContactError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ContactError::Channel(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ContactError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (self.status(), body).into_response()
    }
}

/// Raw contact form fields, before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactForm {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "email", alias = "replyTo")]
    pub reply_to_address: Option<String>,
    #[serde(default, alias = "message")]
    pub message_text: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl ContactForm {
    pub fn into_submission(
        self,
        image: Option<ImageAttachment>,
    ) -> Result<ContactSubmission, ContactError> {
        let message = self
            .message_text
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(ContactError::Invalid("messageText is required"))?;
        let token = self
            .token
            .as_deref()
            .and_then(CorrelationToken::parse)
            .ok_or(ContactError::Invalid("a valid token is required"))?;
        Ok(ContactSubmission {
            name: non_blank(self.name),
            reply_to: non_blank(self.reply_to_address),
            message,
            token,
            image,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn submit_contact(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    request: Request,
) -> Result<Response, ContactError> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let submission = if content_type.starts_with("application/json") {
        let Json(form) = Json::<ContactForm>::from_request(request, &state)
            .await
            .map_err(|_| ContactError::Invalid("request body is not a valid contact form"))?;
        form.into_submission(None)?
    } else if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|_| ContactError::Invalid("malformed multipart body"))?;
        read_multipart(multipart).await?
    } else {
        return Err(ContactError::UnsupportedMediaType);
    };

    let envelope = OutboundEnvelope::from_submission(submission);
    forward(state.channel.as_ref(), &state.operator, &envelope).await?;
    let request_id = request_id.map(|Extension(id)| id);
    Ok(accepted(request_id.as_ref()))
}

async fn read_multipart(mut multipart: Multipart) -> Result<ContactSubmission, ContactError> {
    let mut form = ContactForm::default();
    let mut image = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ContactError::Invalid("malformed multipart body"))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => image = read_image(field).await?,
            "name" => form.name = Some(read_text(field).await?),
            "replyToAddress" | "replyTo" | "email" => {
                form.reply_to_address = Some(read_text(field).await?)
            }
            "messageText" | "message" => form.message_text = Some(read_text(field).await?),
            "token" => form.token = Some(read_text(field).await?),
            other => tracing::debug!(field = other, "ignoring unknown contact field"),
        }
    }
    form.into_submission(image)
}

async fn read_text(field: Field<'_>) -> Result<String, ContactError> {
    field
        .text()
        .await
        .map_err(|_| ContactError::Invalid("malformed multipart body"))
}

/// Reads the optional image part. An empty file part counts as no image.
async fn read_image(field: Field<'_>) -> Result<Option<ImageAttachment>, ContactError> {
    let content_type = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_ascii_lowercase();
    let file_name = field
        .file_name()
        .filter(|name| !name.is_empty())
        .unwrap_or("image")
        .to_string();
    let bytes: Bytes = field
        .bytes()
        .await
        .map_err(|_| ContactError::Invalid("image exceeds the 10 MiB limit or is truncated"))?;
    if bytes.is_empty() {
        return Ok(None);
    }
    if !content_type.starts_with("image/") {
        return Err(ContactError::Invalid("image must be an image/* file"));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ContactError::Invalid("image exceeds the 10 MiB limit"));
    }
    Ok(Some(ImageAttachment {
        bytes,
        content_type,
        file_name,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn form(value: serde_json::Value) -> ContactForm {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn aliases_are_accepted() {
        let parsed = form(json!({"email": "a@b.c", "message": "hi", "token": "t1"}));
        assert_eq!(parsed.reply_to_address.as_deref(), Some("a@b.c"));
        assert_eq!(parsed.message_text.as_deref(), Some("hi"));

        let parsed = form(json!({"replyTo": "x", "messageText": "hi", "token": "t1"}));
        assert_eq!(parsed.reply_to_address.as_deref(), Some("x"));
    }

    #[test]
    fn submission_requires_message_and_token() {
        let err = form(json!({"token": "t1", "messageText": "  "}))
            .into_submission(None)
            .unwrap_err();
        assert!(matches!(err, ContactError::Invalid("messageText is required")));

        let err = form(json!({"messageText": "hi", "token": "has space"}))
            .into_submission(None)
            .unwrap_err();
        assert!(matches!(err, ContactError::Invalid("a valid token is required")));

        let sub = form(json!({"messageText": " hi ", "token": "t1", "name": " "}))
            .into_submission(None)
            .unwrap();
        assert_eq!(sub.message, "hi");
        assert_eq!(sub.token.as_str(), "t1");
        assert!(sub.name.is_none());
    }

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(ContactError::Invalid("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ContactError::UnsupportedMediaType.status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        let channel = ChannelError::Rejected {
            method: "sendMessage",
            reason: "down".into(),
        };
        assert_eq!(ContactError::from(channel).status(), StatusCode::BAD_GATEWAY);
    }
}
