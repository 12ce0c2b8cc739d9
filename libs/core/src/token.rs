use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest token accepted from a visitor.
pub const MAX_TOKEN_LEN: usize = 128;

/// Opaque routing key that ties a visitor connection to operator replies.
///
/// Tokens are normally generated by the storefront client and trusted as-is. They
/// must survive being embedded in a chat message and extracted again, so
/// whitespace is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    /// Validates a raw token. Surrounding whitespace is trimmed first.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed.chars().count() > MAX_TOKEN_LEN
            || trimmed.chars().any(char::is_whitespace)
        {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    /// Mints a fresh server-side token.
    pub fn mint() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CorrelationToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the relay obtains the token for a new visitor connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenPolicy {
    /// Use the token supplied in the handshake query.
    #[default]
    Client,
    /// Ignore the handshake value and mint a unique token per connection.
    Server,
}

impl TokenPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "client" => Some(Self::Client),
            "server" => Some(Self::Server),
            _ => None,
        }
    }

    /// Resolves the token for a handshake, or `None` when the handshake must be rejected.
    pub fn resolve(self, supplied: Option<&str>) -> Option<CorrelationToken> {
        match self {
            Self::Client => supplied.and_then(CorrelationToken::parse),
            Self::Server => Some(CorrelationToken::mint()),
        }
    }
}
