//! # a3s-whatsapp
//!
//! WhatsApp messaging channel for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-whatsapp` connects the A3S message bus to WhatsApp through one of two
//! transports, selected by configuration:
//!
//! - **bridge**: a persistent WebSocket to a WhatsApp bridge, with
//!   HMAC-SHA256 signed frames, keepalive, and bounded automatic reconnection
//! - **business_api**: the WhatsApp Business (Graph) HTTP API
//!
//! Every inbound frame passes through [`MessageValidator`] before anything
//! else sees it. Validation failures discard the single frame; they never
//! tear down the connection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_whatsapp::{BridgeConfig, ChannelAdapter, OutboundMessage, WhatsAppChannel, WhatsAppConfig};
//!
//! # async fn example() -> a3s_whatsapp::Result<()> {
//! let mut bridge = BridgeConfig::new("wss://bridge.example.com/ws");
//! bridge.hmac_key = Some("WHATSAPP_BRIDGE_HMAC_KEY".into());
//!
//! let channel = WhatsAppChannel::new(WhatsAppConfig {
//!     bridge: Some(bridge),
//!     ..Default::default()
//! })?;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//! channel.start(tx).await?;
//!
//! channel
//!     .send_message(OutboundMessage::new("whatsapp", "+15550001", "Hello!"))
//!     .await?;
//!
//! while let Some(event) = rx.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **WhatsAppChannel**: the [`ChannelAdapter`] the bus talks to
//! - **ConnectionManager**: owns the bridge socket, keepalive, and reconnection
//! - **MessageValidator**: decode, sanitize, and sign/verify frames
//! - **RetryPolicy**: exponential backoff for reconnection
//! - **BusinessApiClient**: stateless Graph API sender

pub mod business;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod message;
pub mod retry;
pub mod validator;

// Re-export core types
pub use business::{BusinessApiClient, MediaKind};
pub use channel::{ChannelAdapter, WhatsAppChannel, CHANNEL_NAME};
pub use config::{BridgeConfig, BusinessApiConfig, TimeoutConfig, WhatsAppConfig};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, InboundSink};
pub use error::{ChannelError, Result};
pub use frame::{
    BridgeError, ChatMessage, DeliveryStatus, InboundFrame, MessageKind, OutgoingMessage,
    RawFrame, StatusUpdate,
};
pub use message::{
    ChannelEvent, InboundMessage, OutboundMessage, TemplateComponent, TemplateMessage,
    TemplateParameter,
};
pub use retry::{RetryConfig, RetryPolicy};
pub use validator::MessageValidator;
