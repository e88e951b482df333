//! Bridge connection manager
//!
//! Owns exactly one live WebSocket to the bridge. The link (state, writer
//! half, generation counter) lives behind a single `RwLock`; every state
//! change happens under that lock. Each successful handshake starts a new
//! generation with its own read and keepalive tasks and its own stop signal,
//! so loops from a dead connection can never touch its replacement.
//!
//! Lifecycle:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Degraded -> Reconnecting -> Connected
//!                                        \-> (retries exhausted) stays Degraded
//! any -> Stopped (explicit stop only)
//! ```
//!
//! An initial [`connect`](ConnectionManager::connect) failure is returned to
//! the caller. Only established connections that later fail enter the
//! automatic reconnection path.

use crate::config::{resolve_credential, BridgeConfig, TimeoutConfig};
use crate::error::{ChannelError, Result};
use crate::frame::{InboundFrame, OutgoingMessage};
use crate::retry::RetryPolicy;
use crate::validator::MessageValidator;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Response;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Maximum accepted skew of the bridge's echoed handshake timestamp
pub const MAX_HANDSHAKE_SKEW_SECS: i64 = 300;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Never connected
    Idle = 0,
    /// Initial handshake in progress
    Connecting = 1,
    /// Live connection, sends accepted
    Connected = 2,
    /// Established connection lost; reconnection pending or exhausted
    Degraded = 3,
    /// Automatic reconnection handshake in progress
    Reconnecting = 4,
    /// Explicitly shut down
    Stopped = 5,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Degraded,
            4 => ConnectionState::Reconnecting,
            _ => ConnectionState::Stopped,
        }
    }
}

/// Lifecycle notifications emitted by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed (initial or reconnect)
    Connected,
    /// Established connection lost
    Disconnected { reason: String },
    /// Reconnection attempt scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Retry policy exhausted; stays degraded until restarted
    ReconnectExhausted { attempts: u32 },
}

/// Receiver of validated inbound frames
///
/// Keepalive frames are answered by the manager and never delivered.
#[async_trait]
pub trait InboundSink: Send + Sync {
    /// Deliver a validated data frame, in wire order
    async fn deliver(&self, frame: InboundFrame);

    /// Observe a lifecycle transition
    async fn notify(&self, _event: ConnectionEvent) {}
}

/// Bridge URL with any `token` query parameter promoted out of it
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Endpoint {
    pub(crate) url: String,
    pub(crate) token: Option<String>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Endpoint {
    /// Check the scheme and strip the token from the query string.
    ///
    /// An explicitly configured token wins over one embedded in the URL.
    pub(crate) fn parse(raw: &str, allow_insecure: bool, token: Option<String>) -> Result<Self> {
        let mut url = Url::parse(raw)
            .map_err(|e| ChannelError::Config(format!("whatsapp: invalid bridge url: {}", e)))?;

        match url.scheme() {
            "wss" => {}
            "ws" if allow_insecure => {
                tracing::warn!("Using plaintext ws:// bridge transport; local testing only");
            }
            "ws" => {
                return Err(ChannelError::InsecureTransport(
                    "ws:// requires allow_insecure; use wss://".to_string(),
                ))
            }
            other => {
                return Err(ChannelError::InsecureTransport(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        }

        let mut url_token = None;
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter_map(|(k, v)| {
                if k == "token" {
                    url_token = Some(v.into_owned());
                    None
                } else {
                    Some((k.into_owned(), v.into_owned()))
                }
            })
            .collect();

        if retained.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(retained);
        }

        Ok(Self {
            url: url.to_string(),
            token: token.or(url_token).filter(|t| !t.is_empty()),
        })
    }
}

/// Check the bridge echoed our nonce and a fresh timestamp
pub(crate) fn verify_handshake_echo(response: &Response, nonce: &str, now: i64) -> Result<()> {
    let headers = response.headers();
    let echoed = headers
        .get("x-nonce")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ChannelError::HandshakeFailed("bridge did not echo X-Nonce".into()))?;
    if !bool::from(echoed.as_bytes().ct_eq(nonce.as_bytes())) {
        return Err(ChannelError::HandshakeFailed("X-Nonce mismatch".into()));
    }

    let timestamp = headers
        .get("x-timestamp")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| {
            ChannelError::HandshakeFailed("bridge did not return a valid X-Timestamp".into())
        })?;
    if (now - timestamp).abs() > MAX_HANDSHAKE_SKEW_SECS {
        return Err(ChannelError::HandshakeFailed(format!(
            "X-Timestamp skew of {}s exceeds {}s",
            (now - timestamp).abs(),
            MAX_HANDSHAKE_SKEW_SECS
        )));
    }
    Ok(())
}

struct Link {
    state: ConnectionState,
    writer: Option<WsWriter>,
    generation: u64,
    stop_tx: Option<watch::Sender<bool>>,
}

struct Inner {
    endpoint: Endpoint,
    timeouts: TimeoutConfig,
    verify_echo: bool,
    validator: Arc<MessageValidator>,
    sink: Arc<dyn InboundSink>,
    link: RwLock<Link>,
    /// Lock-free snapshot of `link.state`, written only under the link lock
    published: AtomicU8,
    retry: Mutex<RetryPolicy>,
    reconnect: Notify,
    shutdown: watch::Sender<bool>,
    supervising: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Owner of the bridge connection
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Build a manager for `config`; no I/O happens until [`connect`](Self::connect)
    pub fn new(
        config: &BridgeConfig,
        validator: Arc<MessageValidator>,
        sink: Arc<dyn InboundSink>,
    ) -> Result<Self> {
        let token = config
            .auth_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(resolve_credential)
            .transpose()?;
        let endpoint = Endpoint::parse(&config.url, config.allow_insecure, token)?;
        if !config.verify_handshake_echo {
            tracing::warn!("Bridge handshake echo verification disabled");
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                timeouts: config.timeouts,
                verify_echo: config.verify_handshake_echo,
                validator,
                sink,
                link: RwLock::new(Link {
                    state: ConnectionState::Idle,
                    writer: None,
                    generation: 0,
                    stop_tx: None,
                }),
                published: AtomicU8::new(ConnectionState::Idle as u8),
                retry: Mutex::new(RetryPolicy::from_config(&config.retry)),
                reconnect: Notify::new(),
                shutdown,
                supervising: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.published.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnection attempts consumed since the last successful handshake
    pub async fn retry_attempts(&self) -> u32 {
        self.inner.retry.lock().await.attempts()
    }

    /// Open the connection and start its read and keepalive loops.
    ///
    /// Valid from `Idle` and `Degraded` (manual restart). A failure restores
    /// the previous state and is not retried automatically.
    pub async fn connect(&self) -> Result<()> {
        let previous = {
            let mut link = self.inner.link.write().await;
            match link.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Idle | ConnectionState::Degraded => {
                    let previous = link.state;
                    self.inner.set_state(&mut link, ConnectionState::Connecting);
                    previous
                }
                other => return Err(ChannelError::InvalidState(other)),
            }
        };

        tracing::info!(url = %self.inner.endpoint.url, "Connecting to WhatsApp bridge");

        let (writer, reader) = match self.inner.open().await {
            Ok(halves) => halves,
            Err(e) => {
                let mut link = self.inner.link.write().await;
                if link.state == ConnectionState::Connecting {
                    self.inner.set_state(&mut link, previous);
                }
                tracing::error!(error = %e, "WhatsApp bridge connection failed");
                return Err(e);
            }
        };

        self.inner.retry.lock().await.reset();
        self.inner.install(writer, reader).await?;
        self.ensure_supervisor().await;
        self.inner.sink.notify(ConnectionEvent::Connected).await;
        Ok(())
    }

    /// Write one serialized frame.
    ///
    /// Fails fast with `NotConnected` unless connected. A write failure
    /// degrades the connection, schedules reconnection, and is returned.
    pub async fn send(&self, payload: String) -> Result<()> {
        self.inner.write(None, Message::Text(payload)).await
    }

    /// Stop all loops, close the socket, and enter `Stopped`. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let writer = {
            let mut link = self.inner.link.write().await;
            if link.state == ConnectionState::Stopped {
                return Ok(());
            }
            self.inner.set_state(&mut link, ConnectionState::Stopped);
            if let Some(stop) = link.stop_tx.take() {
                let _ = stop.send(true);
            }
            link.writer.take()
        };
        let _ = self.inner.shutdown.send(true);

        let close_timeout = self.inner.timeouts.close();
        let deadline = Instant::now() + close_timeout;
        let handles = std::mem::take(&mut *self.inner.tasks.lock().await);
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                tracing::warn!("Connection task did not exit in time, aborting");
                handle.abort();
            }
        }

        if let Some(mut writer) = writer {
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "channel stopped".into(),
            }));
            match tokio::time::timeout(close_timeout, writer.send(close)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Close frame not delivered"),
                Err(_) => tracing::debug!("Close frame timed out"),
            }
            let _ = tokio::time::timeout(close_timeout, writer.close()).await;
        }

        tracing::info!("WhatsApp bridge connection stopped");
        Ok(())
    }

    async fn ensure_supervisor(&self) {
        if self.inner.supervising.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(supervise(self.inner.clone()));
        self.inner.track(handle).await;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut link) = self.inner.link.try_write() {
            if let Some(stop) = link.stop_tx.take() {
                let _ = stop.send(true);
            }
        }
        let _ = self.inner.shutdown.send(true);
    }
}

impl Inner {
    fn set_state(&self, link: &mut Link, state: ConnectionState) {
        if link.state != state {
            tracing::debug!(from = ?link.state, to = ?state, "Connection state transition");
        }
        link.state = state;
        self.published.store(state as u8, Ordering::SeqCst);
    }

    async fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Perform the WebSocket handshake and split the stream
    async fn open(&self) -> Result<(WsWriter, WsReader)> {
        let mut request = self
            .endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::HandshakeFailed(e.to_string()))?;

        let nonce = hex::encode(rand::random::<[u8; 16]>());
        let timestamp = chrono::Utc::now().timestamp();
        let headers = request.headers_mut();
        headers.insert("X-Nonce", header_value(&nonce)?);
        headers.insert("X-Timestamp", header_value(&timestamp.to_string())?);
        if let Some(token) = &self.endpoint.token {
            headers.insert("Authorization", header_value(&format!("Bearer {}", token))?);
        }

        let handshake = self.timeouts.handshake();
        let (stream, response) = match tokio::time::timeout(handshake, connect_async(request)).await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(ChannelError::HandshakeFailed(e.to_string())),
            Err(_) => {
                return Err(ChannelError::HandshakeFailed(format!(
                    "timed out after {}s",
                    handshake.as_secs()
                )))
            }
        };

        if self.verify_echo {
            verify_handshake_echo(&response, &nonce, chrono::Utc::now().timestamp())?;
        }

        Ok(stream.split())
    }

    /// Swap a fresh connection in and spawn its loops
    async fn install(self: &Arc<Self>, writer: WsWriter, reader: WsReader) -> Result<()> {
        let (generation, stop_rx) = {
            let mut link = self.link.write().await;
            if link.state == ConnectionState::Stopped {
                return Err(ChannelError::InvalidState(ConnectionState::Stopped));
            }
            let (stop_tx, stop_rx) = watch::channel(false);
            if let Some(old) = link.stop_tx.replace(stop_tx) {
                let _ = old.send(true);
            }
            link.generation += 1;
            link.writer = Some(writer);
            self.set_state(&mut link, ConnectionState::Connected);
            (link.generation, stop_rx)
        };

        tracing::info!(generation, "WhatsApp bridge connected");

        let listen = tokio::spawn(listen(self.clone(), generation, reader, stop_rx.clone()));
        let keepalive = tokio::spawn(keepalive(self.clone(), generation, stop_rx));
        self.track(listen).await;
        self.track(keepalive).await;
        Ok(())
    }

    /// Serialized write through the live handle.
    ///
    /// `generation` pins the write to one connection (keepalive); `None`
    /// accepts whichever connection is live.
    async fn write(&self, generation: Option<u64>, message: Message) -> Result<()> {
        let mut link = self.link.write().await;
        if link.state != ConnectionState::Connected
            || generation.is_some_and(|g| g != link.generation)
        {
            return Err(ChannelError::NotConnected);
        }
        let current = link.generation;
        let writer = link.writer.as_mut().ok_or(ChannelError::NotConnected)?;

        let err = match tokio::time::timeout(self.timeouts.write(), writer.send(message)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => ChannelError::WriteFailed(e.to_string()),
            Err(_) => ChannelError::WriteFailed(format!(
                "write deadline of {}s exceeded",
                self.timeouts.write().as_secs()
            )),
        };

        let degraded = self.degrade_locked(&mut link, current, &err.to_string());
        drop(link);
        if degraded {
            self.after_degrade(err.to_string()).await;
        }
        Err(err)
    }

    async fn degrade(&self, generation: u64, reason: String) {
        let degraded = {
            let mut link = self.link.write().await;
            self.degrade_locked(&mut link, generation, &reason)
        };
        if degraded {
            self.after_degrade(reason).await;
        }
    }

    /// Drop the live handle of `generation`; false if it is already gone
    fn degrade_locked(&self, link: &mut Link, generation: u64, reason: &str) -> bool {
        if link.state != ConnectionState::Connected || link.generation != generation {
            return false;
        }
        self.set_state(link, ConnectionState::Degraded);
        if let Some(stop) = link.stop_tx.take() {
            let _ = stop.send(true);
        }
        link.writer = None;
        tracing::warn!(generation, reason, "WhatsApp bridge connection degraded");
        true
    }

    async fn after_degrade(&self, reason: String) {
        self.sink
            .notify(ConnectionEvent::Disconnected { reason })
            .await;
        self.reconnect.notify_one();
    }

    async fn handle_data(&self, data: &[u8], deadline: &mut Instant) {
        let frame = match self.validator.validate_incoming(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding invalid bridge frame");
                return;
            }
        };

        match frame {
            InboundFrame::Ping { .. } => {
                *deadline = Instant::now() + self.timeouts.read();
                if let Err(e) = self.send_pong().await {
                    tracing::warn!(error = %e, "Failed to answer bridge ping");
                }
            }
            InboundFrame::Pong { .. } => {
                *deadline = Instant::now() + self.timeouts.read();
                tracing::trace!("Bridge pong received");
            }
            frame => self.sink.deliver(frame).await,
        }
    }

    async fn send_pong(&self) -> Result<()> {
        let mut pong = OutgoingMessage::pong();
        self.validator.validate_outgoing(&mut pong)?;
        let payload = String::from_utf8(pong.to_bytes()?)
            .map_err(|e| ChannelError::WriteFailed(e.to_string()))?;
        self.write(None, Message::Text(payload)).await
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ChannelError::HandshakeFailed(e.to_string()))
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Single reader for one connection generation
async fn listen(
    inner: Arc<Inner>,
    generation: u64,
    mut reader: WsReader,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut deadline = Instant::now() + inner.timeouts.read();

    loop {
        let next = tokio::select! {
            _ = stopped(&mut stop_rx) => break,
            next = tokio::time::timeout_at(deadline, reader.next()) => next,
        };

        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                let err = ChannelError::ReadFailed(e.to_string());
                inner.degrade(generation, err.to_string()).await;
                break;
            }
            Ok(None) => {
                inner
                    .degrade(generation, "connection closed by bridge".to_string())
                    .await;
                break;
            }
            Err(_) => {
                let err = ChannelError::ReadFailed(format!(
                    "no keepalive within {}s",
                    inner.timeouts.read().as_secs()
                ));
                inner.degrade(generation, err.to_string()).await;
                break;
            }
        };

        match message {
            Message::Text(text) => inner.handle_data(text.as_bytes(), &mut deadline).await,
            Message::Binary(data) => inner.handle_data(&data, &mut deadline).await,
            Message::Ping(_) | Message::Pong(_) => {
                deadline = Instant::now() + inner.timeouts.read();
            }
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| format!("bridge closed connection: {} {}", f.code, f.reason))
                    .unwrap_or_else(|| "bridge closed connection".to_string());
                inner.degrade(generation, reason).await;
                break;
            }
            Message::Frame(_) => {}
        }
    }

    tracing::debug!(generation, "Bridge read loop exited");
}

/// Transport-level pings for one connection generation
async fn keepalive(inner: Arc<Inner>, generation: u64, mut stop_rx: watch::Receiver<bool>) {
    let period = inner.timeouts.ping_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = stopped(&mut stop_rx) => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = inner.write(Some(generation), Message::Ping(Vec::new())).await {
            tracing::debug!(generation, error = %e, "Keepalive stopped");
            break;
        }
    }
}

/// Reconnection supervisor: one per manager, woken on each degrade
async fn supervise(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = inner.reconnect.notified() => {}
        }
        reconnect(&inner, &mut shutdown).await;
    }
    tracing::debug!("Reconnection supervisor exited");
}

async fn reconnect(inner: &Arc<Inner>, shutdown: &mut watch::Receiver<bool>) {
    loop {
        let (delay, attempt) = {
            let mut retry = inner.retry.lock().await;
            let delay = retry.next_delay();
            (delay, retry.attempts())
        };

        if delay.is_zero() {
            tracing::error!(
                attempts = attempt,
                "WhatsApp bridge reconnection attempts exhausted; staying degraded"
            );
            inner
                .sink
                .notify(ConnectionEvent::ReconnectExhausted { attempts: attempt })
                .await;
            return;
        }

        tracing::info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling bridge reconnection"
        );
        inner
            .sink
            .notify(ConnectionEvent::Reconnecting { attempt, delay })
            .await;

        tokio::select! {
            _ = stopped(shutdown) => return,
            _ = tokio::time::sleep(delay) => {}
        }

        {
            let mut link = inner.link.write().await;
            if link.state != ConnectionState::Degraded {
                // Manual restart or stop took over
                return;
            }
            inner.set_state(&mut link, ConnectionState::Reconnecting);
        }

        match inner.open().await {
            Ok((writer, reader)) => {
                inner.retry.lock().await.reset();
                if inner.install(writer, reader).await.is_err() {
                    return;
                }
                inner.sink.notify(ConnectionEvent::Connected).await;
                return;
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "Bridge reconnection failed");
                let mut link = inner.link.write().await;
                if link.state != ConnectionState::Reconnecting {
                    return;
                }
                inner.set_state(&mut link, ConnectionState::Degraded);
            }
        }
    }
}
