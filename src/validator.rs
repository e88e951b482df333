//! Message validation, sanitization, and HMAC integrity
//!
//! `MessageValidator` is the only gate between raw bridge bytes and the rest
//! of the channel. Inbound frames are decoded, checked per kind, sanitized,
//! and (for chat messages) verified against an HMAC-SHA256 signature.
//! Outbound frames are checked, sanitized, timestamped, and signed in place.
//!
//! Signing is on by default: constructing a validator without a key requires
//! the explicit [`MessageValidator::unsigned`] opt-out, which is logged.

use crate::error::{ChannelError, Result};
use crate::frame::{
    BridgeError, ChatMessage, InboundFrame, MessageKind, OutgoingMessage, RawFrame, StatusUpdate,
};
use ring::hmac;
use std::fmt;
use subtle::ConstantTimeEq;

/// Maximum content length, in characters, after sanitization
pub const MAX_CONTENT_CHARS: usize = 4096;

/// Maximum length of a bridge error report
pub const MAX_ERROR_TEXT_CHARS: usize = 500;

/// Maximum length of a sender or recipient identifier
pub const MAX_IDENTIFIER_CHARS: usize = 50;

/// Media extensions accepted when none are configured
pub const DEFAULT_MEDIA_EXTENSIONS: &[&str] =
    &[".jpg", ".jpeg", ".png", ".gif", ".mp4", ".mp3", ".pdf", ".txt"];

enum Signing {
    Keyed(hmac::Key),
    Unsigned,
}

/// Validates and signs bridge frames
pub struct MessageValidator {
    signing: Signing,
    media_extensions: Vec<String>,
}

impl fmt::Debug for MessageValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageValidator")
            .field("signing", &self.is_signing())
            .field("media_extensions", &self.media_extensions)
            .finish()
    }
}

impl MessageValidator {
    /// Create a validator that signs outbound and verifies inbound messages
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(ChannelError::Config(
                "HMAC key must not be empty; use MessageValidator::unsigned() to opt out".into(),
            ));
        }
        Ok(Self {
            signing: Signing::Keyed(hmac::Key::new(hmac::HMAC_SHA256, key)),
            media_extensions: default_extensions(),
        })
    }

    /// Create a validator that neither signs nor verifies
    pub fn unsigned() -> Self {
        tracing::warn!(
            channel = "whatsapp",
            "HMAC signing disabled: bridge messages will not be signed or verified"
        );
        Self {
            signing: Signing::Unsigned,
            media_extensions: default_extensions(),
        }
    }

    /// Replace the media extension allow-list
    pub fn with_media_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.media_extensions = extensions
            .into_iter()
            .map(|ext| {
                let ext = ext.as_ref().trim().to_lowercase();
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{}", ext)
                }
            })
            .collect();
        self
    }

    /// Whether a signing key is configured
    pub fn is_signing(&self) -> bool {
        matches!(self.signing, Signing::Keyed(_))
    }

    /// Decode and validate one inbound frame
    pub fn validate_incoming(&self, data: &[u8]) -> Result<InboundFrame> {
        let raw = RawFrame::decode(data)?;
        let kind: MessageKind = raw.kind.parse()?;

        match kind {
            MessageKind::Message => self.validate_chat_message(raw).map(InboundFrame::Message),
            MessageKind::Status => validate_status(raw).map(InboundFrame::Status),
            MessageKind::Error => validate_error(raw).map(InboundFrame::Error),
            MessageKind::Ping => Ok(InboundFrame::Ping {
                timestamp: raw.timestamp.unwrap_or(0),
            }),
            MessageKind::Pong => Ok(InboundFrame::Pong {
                timestamp: raw.timestamp.unwrap_or(0),
            }),
        }
    }

    /// Validate, sanitize, timestamp, and sign an outgoing frame in place
    pub fn validate_outgoing(&self, msg: &mut OutgoingMessage) -> Result<()> {
        match msg.kind {
            MessageKind::Message => {
                validate_identifier(&msg.to)?;
                msg.content = sanitize_content(&msg.content)?;
                if msg.content.is_empty() && msg.media.is_empty() {
                    return Err(ChannelError::MissingContent);
                }
            }
            MessageKind::Pong => {
                msg.content = sanitize_content(&msg.content)?;
            }
            other => return Err(ChannelError::InvalidKind(other.to_string())),
        }

        for path in &msg.media {
            validate_media_path(path, &self.media_extensions)?;
        }

        if msg.timestamp == 0 {
            msg.timestamp = chrono::Utc::now().timestamp();
        }

        msg.signature = None;
        msg.signature = self.sign(&msg.canonical_bytes()?);
        Ok(())
    }

    /// Verify the signature of serialized outgoing bytes
    ///
    /// The counterpart of [`validate_outgoing`](Self::validate_outgoing) for
    /// a peer holding the same key.
    pub fn verify_outgoing(&self, data: &[u8]) -> Result<OutgoingMessage> {
        let msg = OutgoingMessage::decode(data)?;
        self.verify(&msg.canonical_bytes()?, msg.signature.as_deref())?;
        Ok(msg)
    }

    /// Lowercase hex HMAC-SHA256 over `canonical`, or `None` when unsigned
    pub fn sign(&self, canonical: &[u8]) -> Option<String> {
        match &self.signing {
            Signing::Keyed(key) => Some(hex::encode(hmac::sign(key, canonical).as_ref())),
            Signing::Unsigned => None,
        }
    }

    fn verify(&self, canonical: &[u8], signature: Option<&str>) -> Result<()> {
        let Some(expected) = self.sign(canonical) else {
            return Ok(());
        };
        let provided = match signature {
            Some(sig) if !sig.is_empty() => sig.to_ascii_lowercase(),
            _ => return Err(ChannelError::MissingSignature),
        };

        if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
            Ok(())
        } else {
            Err(ChannelError::SignatureMismatch)
        }
    }

    fn validate_chat_message(&self, raw: RawFrame) -> Result<ChatMessage> {
        let sender = raw.from.clone().unwrap_or_default();
        if sender.is_empty() {
            return Err(ChannelError::InvalidIdentifier("missing 'from' field".into()));
        }
        validate_identifier(&sender)?;

        let content = sanitize_content(raw.content.as_deref().unwrap_or(""))?;
        if content.is_empty() && raw.media.is_empty() {
            return Err(ChannelError::MissingContent);
        }

        for path in &raw.media {
            validate_media_path(path, &self.media_extensions)?;
        }

        // The peer signs what it sent, so verify against the frame as received.
        self.verify(&raw.canonical_bytes()?, raw.signature.as_deref())?;

        let chat = raw
            .chat
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| sender.clone());

        Ok(ChatMessage {
            id: raw.id.filter(|id| !id.is_empty()),
            sender,
            chat,
            content,
            media: raw.media,
            sender_name: raw.from_name.filter(|n| !n.is_empty()),
            timestamp: raw.timestamp.unwrap_or(0),
        })
    }
}

fn default_extensions() -> Vec<String> {
    DEFAULT_MEDIA_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

fn validate_status(raw: RawFrame) -> Result<StatusUpdate> {
    let id = raw
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ChannelError::InvalidStatus("missing 'id' field".into()))?;
    let status = raw
        .status
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ChannelError::InvalidStatus("missing 'status' field".into()))?
        .parse()?;

    Ok(StatusUpdate {
        id,
        status,
        timestamp: raw.timestamp.unwrap_or(0),
    })
}

fn validate_error(raw: RawFrame) -> Result<BridgeError> {
    let text = raw.error.unwrap_or_default();
    if text.is_empty() {
        return Err(ChannelError::ErrorTextInvalid("missing 'error' field".into()));
    }
    let len = text.chars().count();
    if len > MAX_ERROR_TEXT_CHARS {
        return Err(ChannelError::ErrorTextInvalid(format!(
            "error text too long ({} > {})",
            len, MAX_ERROR_TEXT_CHARS
        )));
    }

    Ok(BridgeError {
        text,
        timestamp: raw.timestamp.unwrap_or(0),
    })
}

/// Check a sender or recipient identifier: 1 to 50 characters
pub fn validate_identifier(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ChannelError::InvalidIdentifier(
            "identifier cannot be empty".into(),
        ));
    }
    if id.chars().count() > MAX_IDENTIFIER_CHARS {
        return Err(ChannelError::InvalidIdentifier(format!(
            "identifier must be between 1 and {} characters",
            MAX_IDENTIFIER_CHARS
        )));
    }
    Ok(())
}

/// Strip control characters (keeping tab, CR, LF), trim, and enforce the length limit
pub fn sanitize_content(content: &str) -> Result<String> {
    let cleaned: String = content
        .chars()
        .filter(|c| (*c as u32) >= 0x20 || matches!(c, '\t' | '\r' | '\n'))
        .collect();
    let cleaned = cleaned.trim().to_string();

    let len = cleaned.chars().count();
    if len > MAX_CONTENT_CHARS {
        return Err(ChannelError::ContentTooLong {
            len,
            max: MAX_CONTENT_CHARS,
        });
    }
    Ok(cleaned)
}

/// Reject traversal segments and extensions outside the allow-list
pub fn validate_media_path(path: &str, allowed_extensions: &[String]) -> Result<()> {
    let unsafe_path = |reason: &str| ChannelError::UnsafeMediaPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.is_empty() {
        return Err(unsafe_path("empty path"));
    }
    if path.contains('\0') {
        return Err(unsafe_path("NUL byte in path"));
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(unsafe_path("directory traversal detected"));
    }

    let lower = path.to_lowercase();
    if !allowed_extensions.iter().any(|ext| lower.ends_with(ext.as_str())) {
        return Err(unsafe_path("file extension not allowed"));
    }
    Ok(())
}
