//! Bus-facing message types
//!
//! The channel hands [`ChannelEvent`]s to the message bus and consumes
//! [`OutboundMessage`]s from it. Neither type knows which transport is active.

use crate::frame::DeliveryStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Inbound message pushed to the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Unique message ID
    pub id: String,
    /// Channel name ("whatsapp")
    pub channel: String,
    /// Bridge-assigned message ID
    pub channel_message_id: Option<String>,
    /// Sender identifier
    pub sender_id: String,
    /// Sender display name
    pub sender_name: Option<String>,
    /// Chat/conversation ID
    pub chat_id: String,
    /// Sanitized message content
    pub content: String,
    /// Validated media references
    pub media: Vec<String>,
    /// Seconds since epoch
    pub timestamp: i64,
    /// Transport metadata (message id, sender name, ...)
    pub metadata: HashMap<String, String>,
}

impl InboundMessage {
    /// Create a new inbound message
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            channel_message_id: None,
            sender_id: sender_id.to_string(),
            sender_name: None,
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            media: Vec::new(),
            timestamp: chrono::Utc::now().timestamp(),
            metadata: HashMap::new(),
        }
    }

    /// Set sender name
    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    /// Set media references
    pub fn with_media(mut self, media: Vec<String>) -> Self {
        self.media = media;
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Outbound message pulled from the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Target channel
    pub channel: String,
    /// Destination identifier
    pub chat_id: String,
    /// Message content
    pub content: String,
    /// Media references
    #[serde(default)]
    pub media: Vec<String>,
}

impl OutboundMessage {
    /// Create a new outbound message
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            media: Vec::new(),
        }
    }

    /// Add a media reference
    pub fn with_media(mut self, path: impl Into<String>) -> Self {
        self.media.push(path.into());
        self
    }
}

/// Pre-approved business API template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMessage {
    /// Template name
    pub name: String,
    /// Language code (e.g. "en_US")
    pub language: String,
    /// Header/body/button components
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<TemplateComponent>,
}

impl TemplateMessage {
    pub fn new(name: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            language: language.into(),
            components: Vec::new(),
        }
    }

    /// Add a component
    pub fn with_component(mut self, component: TemplateComponent) -> Self {
        self.components.push(component);
        self
    }
}

/// Template component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateComponent {
    /// Component type ("header", "body", "button")
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<TemplateParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl TemplateComponent {
    /// Body component with positional text parameters
    pub fn body<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: "body".to_string(),
            parameters: params.into_iter().map(TemplateParameter::text).collect(),
            text: None,
        }
    }
}

/// Template parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateParameter {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl TemplateParameter {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(value.into()),
        }
    }
}

/// Events from the channel to the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// New message received
    Message(InboundMessage),
    /// Delivery status for a previously sent message
    DeliveryStatus {
        channel: String,
        message_id: String,
        status: DeliveryStatus,
    },
    /// Channel connected
    Connected { channel: String },
    /// Established connection lost
    Disconnected { channel: String, reason: String },
    /// Reconnection attempt scheduled
    Reconnecting {
        channel: String,
        attempt: u32,
        delay: Duration,
    },
    /// Retry policy exhausted; the channel stays degraded until restarted
    ReconnectExhausted { channel: String, attempts: u32 },
    /// Error reported by the bridge
    Error { channel: String, error: String },
}
