//! WhatsApp channel facade
//!
//! The only type the message bus talks to. One of two transport strategies
//! is chosen at construction from [`WhatsAppConfig`]:
//!
//! - **Bridge**: persistent WebSocket through [`ConnectionManager`], frames
//!   signed and verified by [`MessageValidator`].
//! - **Business API**: stateless HTTP through [`BusinessApiClient`].

use crate::business::{BusinessApiClient, MediaKind};
use crate::config::{resolve_credential, BridgeConfig, WhatsAppConfig};
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState, InboundSink};
use crate::error::{ChannelError, Result};
use crate::frame::{ChatMessage, InboundFrame, OutgoingMessage};
use crate::message::{ChannelEvent, InboundMessage, OutboundMessage, TemplateMessage};
use crate::validator::MessageValidator;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Channel name used on every bus record
pub const CHANNEL_NAME: &str = "whatsapp";

/// Characters of message content shown in logs
const LOG_PREVIEW_CHARS: usize = 50;

/// Trait for channel adapters
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Get the channel name
    fn name(&self) -> &str;

    /// Start the channel, publishing events to `event_tx`
    async fn start(&self, event_tx: mpsc::Sender<ChannelEvent>) -> Result<()>;

    /// Stop the channel
    async fn stop(&self) -> Result<()>;

    /// Send a message, returning its message ID
    async fn send_message(&self, message: OutboundMessage) -> Result<String>;

    /// Check if the channel can currently send
    fn is_connected(&self) -> bool;
}

fn preview(content: &str) -> String {
    if content.chars().count() <= LOG_PREVIEW_CHARS {
        return content.to_string();
    }
    let mut short: String = content.chars().take(LOG_PREVIEW_CHARS).collect();
    short.push_str("...");
    short
}

/// Turns validated frames and lifecycle transitions into bus events
struct EventForwarder {
    allow_from: Arc<HashSet<String>>,
    event_tx: RwLock<Option<mpsc::Sender<ChannelEvent>>>,
}

impl EventForwarder {
    fn new(allow_from: Arc<HashSet<String>>) -> Self {
        Self {
            allow_from,
            event_tx: RwLock::new(None),
        }
    }

    async fn emit(&self, event: ChannelEvent) {
        if let Some(tx) = self.event_tx.read().await.as_ref() {
            if tx.send(event).await.is_err() {
                tracing::debug!(channel = CHANNEL_NAME, "Event receiver dropped");
            }
        }
    }

    fn to_inbound(msg: ChatMessage) -> InboundMessage {
        let mut inbound = InboundMessage::new(CHANNEL_NAME, &msg.sender, &msg.chat, &msg.content)
            .with_media(msg.media);
        if let Some(id) = msg.id {
            inbound = inbound.with_metadata("message_id", id.clone());
            inbound.channel_message_id = Some(id);
        }
        if let Some(name) = msg.sender_name {
            inbound = inbound
                .with_metadata("sender_name", name.clone())
                .with_sender_name(name);
        }
        if msg.timestamp > 0 {
            inbound.timestamp = msg.timestamp;
        }
        inbound
    }
}

#[async_trait]
impl InboundSink for EventForwarder {
    async fn deliver(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Message(msg) => {
                if !is_allowed(&self.allow_from, &msg.sender) {
                    tracing::debug!(
                        channel = CHANNEL_NAME,
                        sender = %msg.sender,
                        "WhatsApp sender not in allowlist, ignoring"
                    );
                    return;
                }
                tracing::debug!(
                    channel = CHANNEL_NAME,
                    sender = %msg.sender,
                    content = %preview(&msg.content),
                    media = msg.media.len(),
                    "WhatsApp message received"
                );
                self.emit(ChannelEvent::Message(Self::to_inbound(msg))).await;
            }
            InboundFrame::Status(update) => {
                tracing::debug!(
                    channel = CHANNEL_NAME,
                    message_id = %update.id,
                    status = %update.status,
                    "WhatsApp delivery status"
                );
                self.emit(ChannelEvent::DeliveryStatus {
                    channel: CHANNEL_NAME.to_string(),
                    message_id: update.id,
                    status: update.status,
                })
                .await;
            }
            InboundFrame::Error(err) => {
                tracing::warn!(channel = CHANNEL_NAME, error = %err.text, "WhatsApp bridge error");
                self.emit(ChannelEvent::Error {
                    channel: CHANNEL_NAME.to_string(),
                    error: err.text,
                })
                .await;
            }
            InboundFrame::Ping { .. } | InboundFrame::Pong { .. } => {}
        }
    }

    async fn notify(&self, event: ConnectionEvent) {
        let channel = CHANNEL_NAME.to_string();
        let event = match event {
            ConnectionEvent::Connected => ChannelEvent::Connected { channel },
            ConnectionEvent::Disconnected { reason } => {
                ChannelEvent::Disconnected { channel, reason }
            }
            ConnectionEvent::Reconnecting { attempt, delay } => ChannelEvent::Reconnecting {
                channel,
                attempt,
                delay,
            },
            ConnectionEvent::ReconnectExhausted { attempts } => {
                ChannelEvent::ReconnectExhausted { channel, attempts }
            }
        };
        self.emit(event).await;
    }
}

fn is_allowed(allow_from: &HashSet<String>, sender_id: &str) -> bool {
    allow_from.is_empty() || allow_from.contains(sender_id)
}

/// Transport strategy, fixed at construction
enum Transport {
    Bridge {
        manager: ConnectionManager,
        validator: Arc<MessageValidator>,
    },
    BusinessApi {
        client: BusinessApiClient,
        status: AtomicU8,
    },
}

/// WhatsApp channel adapter
pub struct WhatsAppChannel {
    transport: Transport,
    allow_from: Arc<HashSet<String>>,
    forwarder: Arc<EventForwarder>,
}

impl WhatsAppChannel {
    /// Validate `config` and build the selected transport; no I/O happens here
    pub fn new(config: WhatsAppConfig) -> Result<Self> {
        config.validate()?;

        let allow_from: Arc<HashSet<String>> = Arc::new(config.allow_from.into_iter().collect());
        let forwarder = Arc::new(EventForwarder::new(allow_from.clone()));

        let transport = match (config.bridge, config.business_api) {
            (Some(bridge), None) => {
                let validator = Arc::new(Self::build_validator(&bridge)?);
                let manager = ConnectionManager::new(&bridge, validator.clone(), forwarder.clone())?;
                tracing::info!(
                    channel = CHANNEL_NAME,
                    signed = validator.is_signing(),
                    "WhatsApp channel using bridge transport"
                );
                Transport::Bridge { manager, validator }
            }
            (None, Some(api)) => {
                let client = BusinessApiClient::new(&api)?;
                tracing::info!(
                    channel = CHANNEL_NAME,
                    phone_number_id = %client.phone_number_id(),
                    "WhatsApp channel using business API transport"
                );
                Transport::BusinessApi {
                    client,
                    status: AtomicU8::new(ConnectionState::Idle as u8),
                }
            }
            // validate() rules out both and neither
            _ => {
                return Err(ChannelError::Config(
                    "whatsapp: exactly one transport must be configured".into(),
                ))
            }
        };

        Ok(Self {
            transport,
            allow_from,
            forwarder,
        })
    }

    fn build_validator(bridge: &BridgeConfig) -> Result<MessageValidator> {
        let key = bridge
            .hmac_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(resolve_credential)
            .transpose()?;
        let validator = match key {
            Some(key) => MessageValidator::new(key.as_bytes())?,
            None => MessageValidator::unsigned(),
        };
        Ok(validator.with_media_extensions(&bridge.media_extensions))
    }

    /// True when the allow-list is empty or contains `sender_id`
    pub fn is_allowed(&self, sender_id: &str) -> bool {
        is_allowed(&self.allow_from, sender_id)
    }

    /// Current lifecycle state of the active transport
    pub fn state(&self) -> ConnectionState {
        match &self.transport {
            Transport::Bridge { manager, .. } => manager.state(),
            Transport::BusinessApi { status, .. } => {
                ConnectionState::from_u8(status.load(Ordering::SeqCst))
            }
        }
    }

    /// Reconnection attempts consumed since the last successful handshake
    pub async fn retry_attempts(&self) -> u32 {
        match &self.transport {
            Transport::Bridge { manager, .. } => manager.retry_attempts().await,
            Transport::BusinessApi { .. } => 0,
        }
    }

    /// Send a pre-approved template (business API only)
    pub async fn send_template(&self, to: &str, template: &TemplateMessage) -> Result<String> {
        match &self.transport {
            Transport::BusinessApi { client, .. } => {
                tracing::debug!(
                    channel = CHANNEL_NAME,
                    to,
                    template = %template.name,
                    "Sending WhatsApp template"
                );
                client.send_template(to, template).await
            }
            Transport::Bridge { .. } => Err(ChannelError::Unsupported(
                "templates require the business API transport".into(),
            )),
        }
    }

    async fn send_via_bridge(
        manager: &ConnectionManager,
        validator: &MessageValidator,
        message: OutboundMessage,
    ) -> Result<String> {
        if !manager.is_connected() {
            return Err(ChannelError::NotConnected);
        }

        let mut frame =
            OutgoingMessage::message(message.chat_id, message.content).with_media(message.media);
        validator.validate_outgoing(&mut frame)?;
        let payload = String::from_utf8(frame.to_bytes()?)
            .map_err(|e| ChannelError::WriteFailed(e.to_string()))?;

        tracing::debug!(
            channel = CHANNEL_NAME,
            to = %frame.to,
            content = %preview(&frame.content),
            "Sending WhatsApp message via bridge"
        );
        manager.send(payload).await?;

        // The bridge does not acknowledge sends with an ID
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn send_via_api(client: &BusinessApiClient, message: OutboundMessage) -> Result<String> {
        tracing::debug!(
            channel = CHANNEL_NAME,
            to = %message.chat_id,
            content = %preview(&message.content),
            media = message.media.len(),
            "Sending WhatsApp message via business API"
        );

        if message.media.is_empty() {
            return client.send_text(&message.chat_id, &message.content).await;
        }

        let mut last_id = String::new();
        for (i, link) in message.media.iter().enumerate() {
            let caption = (i == 0).then_some(message.content.as_str());
            last_id = client
                .send_media(&message.chat_id, MediaKind::from_path(link), link, caption)
                .await?;
        }
        Ok(last_id)
    }
}

#[async_trait]
impl ChannelAdapter for WhatsAppChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn start(&self, event_tx: mpsc::Sender<ChannelEvent>) -> Result<()> {
        *self.forwarder.event_tx.write().await = Some(event_tx);

        match &self.transport {
            Transport::Bridge { manager, .. } => manager.connect().await,
            Transport::BusinessApi { client, status } => {
                status.store(ConnectionState::Connecting as u8, Ordering::SeqCst);
                if let Err(e) = client.validate_credentials().await {
                    status.store(ConnectionState::Idle as u8, Ordering::SeqCst);
                    tracing::error!(
                        channel = CHANNEL_NAME,
                        error = %e,
                        "WhatsApp business API credentials rejected"
                    );
                    return Err(e);
                }
                status.store(ConnectionState::Connected as u8, Ordering::SeqCst);
                tracing::info!(channel = CHANNEL_NAME, "WhatsApp business API ready");
                self.forwarder
                    .emit(ChannelEvent::Connected {
                        channel: CHANNEL_NAME.to_string(),
                    })
                    .await;
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        match &self.transport {
            Transport::Bridge { manager, .. } => manager.stop().await?,
            Transport::BusinessApi { status, .. } => {
                status.store(ConnectionState::Stopped as u8, Ordering::SeqCst);
            }
        }

        self.forwarder
            .emit(ChannelEvent::Disconnected {
                channel: CHANNEL_NAME.to_string(),
                reason: "Channel stopped".to_string(),
            })
            .await;
        *self.forwarder.event_tx.write().await = None;
        tracing::info!(channel = CHANNEL_NAME, "WhatsApp channel stopped");
        Ok(())
    }

    async fn send_message(&self, message: OutboundMessage) -> Result<String> {
        match &self.transport {
            Transport::Bridge { manager, validator } => {
                Self::send_via_bridge(manager, validator, message).await
            }
            Transport::BusinessApi { client, .. } => Self::send_via_api(client, message).await,
        }
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}
