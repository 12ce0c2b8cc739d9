//! Relay settings: optional YAML file plus environment overrides.

use serde::Deserialize;
use sfr_core::{OperatorIdentity, TokenPolicy};
use std::{fmt, fs, net::SocketAddr, path::Path};

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid bind address {value:?}")]
    InvalidBind {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("unknown updates mode {0:?}; expected polling or webhook")]
    InvalidUpdatesMode(String),
    #[error("unknown token policy {0:?}; expected client or server")]
    InvalidTokenPolicy(String),
    #[error("read relay config {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse relay config {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml_bw::Error,
    },
}

/// How operator messages reach the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatesMode {
    #[default]
    Polling,
    Webhook,
}

impl UpdatesMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "polling" | "poll" => Some(Self::Polling),
            "webhook" => Some(Self::Webhook),
            _ => None,
        }
    }
}

/// Token bucket settings for `POST /api/contact`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateSettings {
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_refill")]
    pub refill_per_sec: u32,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_sec: default_refill(),
        }
    }
}

fn default_capacity() -> u32 {
    10
}

fn default_refill() -> u32 {
    1
}

/// Shape of the YAML file. Secrets are only read from the environment.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    bind: Option<String>,
    operator_chat_id: Option<String>,
    api_base: Option<String>,
    updates_mode: Option<UpdatesMode>,
    webhook_url: Option<String>,
    token_policy: Option<TokenPolicy>,
    allowed_origins: Vec<String>,
    contact_rate: RateSettings,
}

#[derive(Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub bot_token: String,
    pub operator: OperatorIdentity,
    pub api_base: String,
    pub updates_mode: UpdatesMode,
    pub webhook_secret: Option<String>,
    pub webhook_url: Option<String>,
    pub token_policy: TokenPolicy,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
    pub contact_rate: RateSettings,
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("bind", &self.bind)
            .field("bot_token", &"<redacted>")
            .field("operator", &self.operator)
            .field("api_base", &self.api_base)
            .field("updates_mode", &self.updates_mode)
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .field("webhook_url", &self.webhook_url)
            .field("token_policy", &self.token_policy)
            .field("allowed_origins", &self.allowed_origins)
            .field("contact_rate", &self.contact_rate)
            .finish()
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves settings through `lookup`. The file named by `RELAY_CONFIG` is read
    /// first when it exists; environment values win over file values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let file = match lookup("RELAY_CONFIG") {
            Some(path) => load_file(&path)?,
            None => ConfigFile::default(),
        };

        let bind_raw = lookup("RELAY_BIND")
            .or_else(|| lookup("PORT").map(|port| format!("0.0.0.0:{port}")))
            .or(file.bind)
            .unwrap_or_else(|| DEFAULT_BIND.into());
        let bind = bind_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBind {
                value: bind_raw.clone(),
                source,
            })?;

        let bot_token =
            lookup("TELEGRAM_BOT_TOKEN").ok_or(ConfigError::Missing("TELEGRAM_BOT_TOKEN"))?;
        let operator = lookup("TELEGRAM_OPERATOR_CHAT_ID")
            .or(file.operator_chat_id)
            .map(OperatorIdentity::new)
            .filter(|id| !id.as_str().is_empty())
            .ok_or(ConfigError::Missing("TELEGRAM_OPERATOR_CHAT_ID"))?;

        let updates_mode = match lookup("TELEGRAM_UPDATES_MODE") {
            Some(raw) => UpdatesMode::parse(&raw).ok_or(ConfigError::InvalidUpdatesMode(raw))?,
            None => file.updates_mode.unwrap_or_default(),
        };
        let token_policy = match lookup("RELAY_TOKEN_POLICY") {
            Some(raw) => TokenPolicy::parse(&raw).ok_or(ConfigError::InvalidTokenPolicy(raw))?,
            None => file.token_policy.unwrap_or_default(),
        };

        let webhook_secret = lookup("TELEGRAM_WEBHOOK_SECRET");
        if updates_mode == UpdatesMode::Webhook && webhook_secret.is_none() {
            return Err(ConfigError::Missing("TELEGRAM_WEBHOOK_SECRET"));
        }

        let allowed_origins = match lookup("RELAY_ALLOWED_ORIGINS") {
            Some(raw) => split_list(&raw),
            None => file.allowed_origins,
        };

        Ok(Self {
            bind,
            bot_token,
            operator,
            api_base: lookup("TELEGRAM_API_BASE")
                .or(file.api_base)
                .unwrap_or_else(|| DEFAULT_API_BASE.into()),
            updates_mode,
            webhook_secret,
            webhook_url: lookup("TELEGRAM_WEBHOOK_URL").or(file.webhook_url),
            token_policy,
            allowed_origins,
            contact_rate: file.contact_rate,
        })
    }
}

fn load_file(path: &str) -> Result<ConfigFile, ConfigError> {
    let file = Path::new(path);
    if !file.exists() {
        tracing::debug!(path, "relay config file not found; using environment only");
        return Ok(ConfigFile::default());
    }
    let raw = fs::read_to_string(file).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    serde_yaml_bw::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}
