//! Error types for a3s-whatsapp

use crate::connection::ConnectionState;
use thiserror::Error;

/// Errors that can occur in the WhatsApp channel
#[derive(Debug, Error)]
pub enum ChannelError {
    // ─── Validation layer: discard the offending frame ───────────
    /// Frame could not be decoded as the wire format
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Frame `type` is not one of the recognized kinds
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),

    /// Outgoing message kind is not sendable
    #[error("Outgoing message kind must be 'message' or 'pong', got '{0}'")]
    InvalidKind(String),

    /// Sender or recipient identifier failed format validation
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Chat message carries neither content nor media
    #[error("Message must have either content or media")]
    MissingContent,

    /// Content exceeds the maximum length after sanitization
    #[error("Content exceeds maximum length of {max} characters ({len})")]
    ContentTooLong { len: usize, max: usize },

    /// Media reference escapes its directory or has a disallowed extension
    #[error("Unsafe media path '{path}': {reason}")]
    UnsafeMediaPath { path: String, reason: String },

    /// A signing key is configured but the frame carries no signature
    #[error("Missing signature")]
    MissingSignature,

    /// Signature does not match the recomputed HMAC
    #[error("Signature mismatch")]
    SignatureMismatch,

    /// Status frame without `id` or with an unrecognized status
    #[error("Invalid status frame: {0}")]
    InvalidStatus(String),

    /// Error frame with empty or oversized error text
    #[error("Invalid error frame: {0}")]
    ErrorTextInvalid(String),

    // ─── Transport layer ─────────────────────────────────────────
    /// Send attempted while the connection is not established
    #[error("WhatsApp bridge connection not established")]
    NotConnected,

    /// Transport scheme rejected (plaintext without explicit opt-in)
    #[error("Insecure transport: {0}")]
    InsecureTransport(String),

    /// Opening handshake failed or timed out
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Frame write failed or timed out
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Frame read failed, timed out, or the peer closed
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// Operation not valid in the current connection state
    #[error("Invalid connection state: {0:?}")]
    InvalidState(ConnectionState),

    // ─── Business API layer ──────────────────────────────────────
    /// Credential check rejected or unreachable; fatal to starting the
    /// business API variant. `status` is `None` when no response arrived.
    #[error("Credential validation failed ({}): {body}", describe_status(.status))]
    CredentialValidationFailed { status: Option<u16>, body: String },

    /// Business API returned an error response
    #[error("Business API error (status {status}): {message} (type: {kind}, code: {code})")]
    Api {
        status: u16,
        message: String,
        kind: String,
        code: i64,
        subcode: Option<i64>,
    },

    /// Operation not supported by the active transport variant
    #[error("Unsupported on this transport: {0}")]
    Unsupported(String),

    // ─── Ambient ─────────────────────────────────────────────────
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChannelError {
    /// Validation errors are confined to a single frame; the connection survives them.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ChannelError::MalformedPayload(_)
                | ChannelError::UnknownKind(_)
                | ChannelError::InvalidKind(_)
                | ChannelError::InvalidIdentifier(_)
                | ChannelError::MissingContent
                | ChannelError::ContentTooLong { .. }
                | ChannelError::UnsafeMediaPath { .. }
                | ChannelError::MissingSignature
                | ChannelError::SignatureMismatch
                | ChannelError::InvalidStatus(_)
                | ChannelError::ErrorTextInvalid(_)
        )
    }

    /// Transport errors move an established connection to `Degraded`.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChannelError::NotConnected
                | ChannelError::HandshakeFailed(_)
                | ChannelError::WriteFailed(_)
                | ChannelError::ReadFailed(_)
                | ChannelError::InsecureTransport(_)
        )
    }
}

fn describe_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "no response".to_string(),
    }
}

/// Result type alias for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;
