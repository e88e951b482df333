//! WhatsApp channel configuration
//!
//! Exactly one transport must be configured: a WebSocket `bridge` or the
//! HTTP `business_api`. Credential fields accept either an environment
//! variable name or an inline value (see [`resolve_credential`]).

use crate::error::{ChannelError, Result};
use crate::retry::RetryConfig;
use crate::validator::DEFAULT_MEDIA_EXTENSIONS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default Graph API version for the business API
pub const DEFAULT_API_VERSION: &str = "v22.0";

/// Default Graph API base URL
pub const DEFAULT_BASE_URL: &str = "https://graph.facebook.com";

/// Main WhatsApp channel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    /// WebSocket bridge transport
    #[serde(default)]
    pub bridge: Option<BridgeConfig>,

    /// Business API (REST) transport
    #[serde(default)]
    pub business_api: Option<BusinessApiConfig>,

    /// Allowed sender identifiers; empty means unrestricted
    #[serde(default)]
    pub allow_from: Vec<String>,
}

impl WhatsAppConfig {
    /// Check transport selection and per-transport settings
    pub fn validate(&self) -> Result<()> {
        match (&self.bridge, &self.business_api) {
            (None, None) => Err(ChannelError::Config(
                "whatsapp: either bridge or business_api must be configured".into(),
            )),
            (Some(_), Some(_)) => Err(ChannelError::Config(
                "whatsapp: cannot use both bridge and business_api simultaneously".into(),
            )),
            (Some(bridge), None) => bridge.validate(),
            (None, Some(api)) => api.validate(),
        }
    }
}

/// WebSocket bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bridge URL (`wss://`; `ws://` only with `allow_insecure`)
    pub url: String,

    /// Bearer token reference; a `token` query parameter in `url` also works
    #[serde(default)]
    pub auth_token: Option<String>,

    /// HMAC-SHA256 key reference for frame signing
    #[serde(default)]
    pub hmac_key: Option<String>,

    /// Explicit opt-out of frame signing when no key is configured
    #[serde(default)]
    pub allow_unsigned: bool,

    /// Accept plaintext `ws://` (local testing only)
    #[serde(default)]
    pub allow_insecure: bool,

    /// Require the bridge to echo the handshake nonce and a fresh timestamp
    #[serde(default = "default_true")]
    pub verify_handshake_echo: bool,

    /// Allowed media file extensions
    #[serde(default = "default_media_extensions")]
    pub media_extensions: Vec<String>,

    /// Transport timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Reconnection backoff
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_true() -> bool {
    true
}

fn default_media_extensions() -> Vec<String> {
    DEFAULT_MEDIA_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

impl BridgeConfig {
    /// Create a bridge configuration with defaults for everything but the URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            hmac_key: None,
            allow_unsigned: false,
            allow_insecure: false,
            verify_handshake_echo: true,
            media_extensions: default_media_extensions(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(ChannelError::Config("whatsapp: bridge url is empty".into()));
        }
        let has_key = self.hmac_key.as_deref().is_some_and(|k| !k.is_empty());
        if !has_key && !self.allow_unsigned {
            return Err(ChannelError::Config(
                "whatsapp: bridge requires hmac_key unless allow_unsigned is set".into(),
            ));
        }
        if self.media_extensions.is_empty() {
            return Err(ChannelError::Config(
                "whatsapp: media_extensions must not be empty".into(),
            ));
        }
        self.timeouts.validate()?;
        if self.retry.initial_delay_ms == 0 || self.retry.max_delay_ms == 0 {
            return Err(ChannelError::Config(
                "whatsapp: retry delays must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Bridge transport timeouts, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_handshake_secs")]
    pub handshake_secs: u64,
    #[serde(default = "default_write_secs")]
    pub write_secs: u64,
    /// Read deadline, renewed by every keepalive response
    #[serde(default = "default_read_secs")]
    pub read_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Bound on the graceful close during shutdown
    #[serde(default = "default_close_secs")]
    pub close_secs: u64,
}

fn default_handshake_secs() -> u64 {
    10
}
fn default_write_secs() -> u64 {
    10
}
fn default_read_secs() -> u64 {
    60
}
fn default_ping_interval_secs() -> u64 {
    30
}
fn default_close_secs() -> u64 {
    5
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_secs: default_handshake_secs(),
            write_secs: default_write_secs(),
            read_secs: default_read_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            close_secs: default_close_secs(),
        }
    }
}

impl TimeoutConfig {
    /// Reject zero timeouts
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("handshake_secs", self.handshake_secs),
            ("write_secs", self.write_secs),
            ("read_secs", self.read_secs),
            ("ping_interval_secs", self.ping_interval_secs),
            ("close_secs", self.close_secs),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(ChannelError::Config(format!(
                    "whatsapp: timeouts.{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }
    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }
    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
    pub fn close(&self) -> Duration {
        Duration::from_secs(self.close_secs)
    }
}

/// WhatsApp Business API (Graph API) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessApiConfig {
    /// Numeric phone number ID
    pub phone_number_id: String,

    /// Access token reference
    pub access_token: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl BusinessApiConfig {
    pub fn new(phone_number_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            phone_number_id: phone_number_id.into(),
            access_token: access_token.into(),
            api_version: default_api_version(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.phone_number_id.is_empty() || self.access_token.is_empty() {
            return Err(ChannelError::Config(
                "whatsapp: business_api requires phone_number_id and access_token".into(),
            ));
        }
        if !self.phone_number_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(ChannelError::Config(format!(
                "whatsapp: phone_number_id must be numeric, got '{}'",
                self.phone_number_id
            )));
        }
        Ok(())
    }
}

/// Resolve a credential reference: environment variable first, inline value otherwise.
pub(crate) fn resolve_credential(credential_ref: &str) -> Result<String> {
    if let Ok(val) =
        std::env::var(credential_ref).or_else(|_| std::env::var(credential_ref.to_uppercase()))
    {
        return Ok(val);
    }
    if !credential_ref.is_empty() {
        return Ok(credential_ref.to_string());
    }
    Err(ChannelError::Config(format!(
        "Failed to resolve credential: {}",
        credential_ref
    )))
}
