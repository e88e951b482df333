//! Wire frames exchanged with the WhatsApp bridge
//!
//! Every frame is one JSON object. Inbound frames are first decoded into
//! [`RawFrame`], which mirrors the wire exactly and rejects unknown fields,
//! then validated into the closed [`InboundFrame`] enum. Outbound frames are
//! [`OutgoingMessage`].
//!
//! Signatures cover the canonical serialization of a frame: fields in
//! declaration order, empty strings, empty lists and zero timestamps omitted,
//! and the `signature` field removed.

use crate::error::{ChannelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Recognized frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Chat message
    Message,
    /// Delivery status update
    Status,
    /// Bridge-reported error
    Error,
    /// Application-level keepalive request
    Ping,
    /// Application-level keepalive answer
    Pong,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Message => "message",
            MessageKind::Status => "status",
            MessageKind::Error => "error",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "message" => Ok(MessageKind::Message),
            "status" => Ok(MessageKind::Status),
            "error" => Ok(MessageKind::Error),
            "ping" => Ok(MessageKind::Ping),
            "pong" => Ok(MessageKind::Pong),
            other => Err(ChannelError::UnknownKind(other.to_string())),
        }
    }
}

/// Delivery status reported by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "read" => Ok(DeliveryStatus::Read),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(ChannelError::InvalidStatus(format!(
                "unrecognized status '{}'",
                other
            ))),
        }
    }
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// An inbound frame exactly as received, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl RawFrame {
    /// Decode one wire frame
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| ChannelError::MalformedPayload(e.to_string()))
    }

    /// Canonical bytes covered by the signature
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        fn present(field: &Option<String>) -> Option<String> {
            field.as_ref().filter(|s| !s.is_empty()).cloned()
        }

        let unsigned = RawFrame {
            kind: self.kind.clone(),
            id: present(&self.id),
            from: present(&self.from),
            chat: present(&self.chat),
            content: present(&self.content),
            media: self.media.clone(),
            from_name: present(&self.from_name),
            status: present(&self.status),
            error: present(&self.error),
            timestamp: self.timestamp.filter(|ts| *ts != 0),
            signature: None,
        };
        Ok(serde_json::to_vec(&unsigned)?)
    }
}

/// A validated chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Bridge message identifier
    pub id: Option<String>,
    /// Sender identifier
    pub sender: String,
    /// Conversation identifier, defaults to the sender
    pub chat: String,
    /// Sanitized content, possibly empty when media is present
    pub content: String,
    /// Validated media references, in wire order
    pub media: Vec<String>,
    /// Sender display name
    pub sender_name: Option<String>,
    /// Seconds since epoch, 0 when the bridge sent none
    pub timestamp: i64,
}

/// A validated delivery status update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub id: String,
    pub status: DeliveryStatus,
    pub timestamp: i64,
}

/// A validated bridge error report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeError {
    pub text: String,
    pub timestamp: i64,
}

/// A validated inbound frame: one payload shape per kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Message(ChatMessage),
    Status(StatusUpdate),
    Error(BridgeError),
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
}

impl InboundFrame {
    pub fn kind(&self) -> MessageKind {
        match self {
            InboundFrame::Message(_) => MessageKind::Message,
            InboundFrame::Status(_) => MessageKind::Status,
            InboundFrame::Error(_) => MessageKind::Error,
            InboundFrame::Ping { .. } => MessageKind::Ping,
            InboundFrame::Pong { .. } => MessageKind::Pong,
        }
    }

    /// Keepalive frames renew the read deadline and never reach the bus
    pub fn is_keepalive(&self) -> bool {
        matches!(self, InboundFrame::Ping { .. } | InboundFrame::Pong { .. })
    }
}

/// A frame to send to the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutgoingMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl OutgoingMessage {
    /// Create a chat message for `to`
    pub fn message(to: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Message,
            to: to.into(),
            content: content.into(),
            media: Vec::new(),
            timestamp: 0,
            signature: None,
        }
    }

    /// Create a keepalive answer
    pub fn pong() -> Self {
        Self {
            kind: MessageKind::Pong,
            to: String::new(),
            content: String::new(),
            media: Vec::new(),
            timestamp: 0,
            signature: None,
        }
    }

    /// Attach media references
    pub fn with_media(mut self, media: Vec<String>) -> Self {
        self.media = media;
        self
    }

    /// Decode an outgoing frame (used when verifying signed bytes)
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| ChannelError::MalformedPayload(e.to_string()))
    }

    /// Canonical bytes covered by the signature
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let unsigned = OutgoingMessage {
            signature: None,
            ..self.clone()
        };
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Serialized frame, signature included
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
