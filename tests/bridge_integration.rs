//! Bridge transport integration tests
//!
//! Runs the channel against an in-process WebSocket bridge. Covers the
//! handshake headers, signed inbound delivery, ping/pong, outbound signing,
//! graceful stop, read deadlines, write failures, and the bounded reconnection
//! scenario.

use a3s_whatsapp::{
    BridgeConfig, ChannelAdapter, ChannelError, ChannelEvent, ConnectionState, MessageKind,
    MessageValidator, OutboundMessage, RawFrame, WhatsAppChannel, WhatsAppConfig,
};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

const KEY: &str = "integration-hmac-key";
const WAIT: Duration = Duration::from_secs(5);

type BridgeSocket = WebSocketStream<TcpStream>;

#[derive(Debug, Clone)]
struct Handshake {
    path: String,
    authorization: Option<String>,
    nonce: Option<String>,
    timestamp: Option<String>,
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    (listener, url)
}

/// Complete the server side of the handshake, echoing freshness headers when `echo`
async fn handshake(stream: TcpStream, echo: bool) -> (BridgeSocket, Handshake) {
    let captured = Arc::new(Mutex::new(None));
    let slot = captured.clone();
    let callback = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        *slot.lock().unwrap() = Some(Handshake {
            path: req.uri().to_string(),
            authorization: header("authorization"),
            nonce: header("x-nonce"),
            timestamp: header("x-timestamp"),
        });
        if echo {
            if let Some(nonce) = req.headers().get("x-nonce") {
                resp.headers_mut().insert("X-Nonce", nonce.clone());
            }
            resp.headers_mut().insert(
                "X-Timestamp",
                chrono::Utc::now().timestamp().to_string().parse().unwrap(),
            );
        }
        Ok(resp)
    };

    let ws = accept_hdr_async(stream, callback).await.unwrap();
    let handshake = captured.lock().unwrap().take().unwrap();
    (ws, handshake)
}

/// Accept one connection and complete its handshake
async fn accept_one(listener: &TcpListener) -> (BridgeSocket, Handshake) {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("no connection")
        .unwrap();
    handshake(stream, true).await
}

fn bridge_config(url: &str) -> BridgeConfig {
    let mut bridge = BridgeConfig::new(url);
    bridge.hmac_key = Some(KEY.into());
    bridge.allow_insecure = true;
    bridge.timeouts.handshake_secs = 2;
    bridge.timeouts.close_secs = 1;
    bridge
}

fn channel(bridge: BridgeConfig, allow_from: &[&str]) -> WhatsAppChannel {
    WhatsAppChannel::new(WhatsAppConfig {
        bridge: Some(bridge),
        business_api: None,
        allow_from: allow_from.iter().map(|s| s.to_string()).collect(),
    })
    .unwrap()
}

/// Serialize `frame` with a signature computed by a peer holding `KEY`
fn signed(mut frame: serde_json::Value) -> Message {
    let validator = MessageValidator::new(KEY).unwrap();
    let raw = RawFrame::decode(frame.to_string().as_bytes()).unwrap();
    let signature = validator.sign(&raw.canonical_bytes().unwrap()).unwrap();
    frame["signature"] = serde_json::Value::String(signature);
    Message::Text(frame.to_string())
}

async fn next_text(ws: &mut BridgeSocket) -> String {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("bridge stream ended: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

async fn wait_for<F>(rx: &mut mpsc::Receiver<ChannelEvent>, pred: F) -> ChannelEvent
where
    F: Fn(&ChannelEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ─── Handshake ───────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_promotes_token_and_adds_freshness_headers() {
    let (listener, url) = bind().await;
    let channel = channel(
        bridge_config(&format!("{}?token=secret-token", url)),
        &[],
    );
    let (tx, _rx) = mpsc::channel(16);

    let (started, (_ws, handshake)) = tokio::join!(channel.start(tx), accept_one(&listener));
    started.unwrap();

    assert_eq!(handshake.path, "/ws");
    assert_eq!(handshake.authorization.as_deref(), Some("Bearer secret-token"));
    let nonce = handshake.nonce.unwrap();
    assert_eq!(nonce.len(), 32);
    assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    let sent_at: i64 = handshake.timestamp.unwrap().parse().unwrap();
    assert!((chrono::Utc::now().timestamp() - sent_at).abs() < 10);

    assert_eq!(channel.state(), ConnectionState::Connected);
    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_handshake_without_echo_is_rejected() {
    let (listener, url) = bind().await;
    let channel = channel(bridge_config(&url), &[]);
    let (tx, _rx) = mpsc::channel(16);

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = handshake(stream, false).await;
    });

    let err = channel.start(tx).await.unwrap_err();
    assert!(matches!(err, ChannelError::HandshakeFailed(_)), "{err}");
    assert_eq!(channel.state(), ConnectionState::Idle);
    assert_eq!(channel.retry_attempts().await, 0);
    server.await.unwrap();
}

#[tokio::test]
async fn test_plaintext_requires_opt_in() {
    let mut bridge = bridge_config("ws://127.0.0.1:1/ws");
    bridge.allow_insecure = false;
    let result = WhatsAppChannel::new(WhatsAppConfig {
        bridge: Some(bridge),
        ..Default::default()
    });
    assert!(matches!(result, Err(ChannelError::InsecureTransport(_))));
}

// ─── Inbound ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_inbound_messages_are_validated_and_filtered() {
    let (listener, url) = bind().await;
    let channel = channel(bridge_config(&url), &["+15550001"]);
    let (tx, mut rx) = mpsc::channel(16);

    let (started, (mut ws, _)) = tokio::join!(channel.start(tx), accept_one(&listener));
    started.unwrap();

    // Tampered signature: discarded, connection survives
    let mut tampered = serde_json::json!({
        "type": "message", "from": "+15550001", "content": "forged"
    });
    tampered["signature"] = serde_json::Value::String("00".repeat(32));
    ws.send(Message::Text(tampered.to_string())).await.unwrap();

    // Malformed and unknown-field frames: discarded
    ws.send(Message::Text("not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"message","from":"+1","content":"x","extra":1}"#.into()))
        .await
        .unwrap();

    // Valid but from a sender outside the allow-list
    ws.send(signed(serde_json::json!({
        "type": "message", "from": "+15550002", "content": "blocked"
    })))
    .await
    .unwrap();

    ws.send(signed(serde_json::json!({
        "type": "message",
        "id": "wamid.42",
        "from": "+15550001",
        "content": "  Hello\u{0007} there\t",
        "media": ["photos/cat.jpg"],
        "from_name": "Ana",
        "timestamp": 1_700_000_000
    })))
    .await
    .unwrap();

    let event = wait_for(&mut rx, |e| matches!(e, ChannelEvent::Message(_))).await;
    let ChannelEvent::Message(msg) = event else {
        unreachable!()
    };
    assert_eq!(msg.channel, "whatsapp");
    assert_eq!(msg.sender_id, "+15550001");
    assert_eq!(msg.chat_id, "+15550001");
    assert_eq!(msg.content, "Hello there");
    assert_eq!(msg.media, vec!["photos/cat.jpg".to_string()]);
    assert_eq!(msg.channel_message_id.as_deref(), Some("wamid.42"));
    assert_eq!(msg.sender_name.as_deref(), Some("Ana"));
    assert_eq!(msg.timestamp, 1_700_000_000);

    ws.send(signed(serde_json::json!({
        "type": "status", "id": "wamid.42", "status": "delivered"
    })))
    .await
    .unwrap();
    let event = wait_for(&mut rx, |e| matches!(e, ChannelEvent::DeliveryStatus { .. })).await;
    assert!(matches!(
        event,
        ChannelEvent::DeliveryStatus { ref message_id, .. } if message_id == "wamid.42"
    ));

    assert!(channel.is_connected());
    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_ping_is_answered_with_one_signed_pong() {
    let (listener, url) = bind().await;
    let channel = channel(bridge_config(&url), &[]);
    let (tx, _rx) = mpsc::channel(16);

    let (started, (mut ws, _)) = tokio::join!(channel.start(tx), accept_one(&listener));
    started.unwrap();

    ws.send(Message::Text(r#"{"type":"ping","timestamp":1700000000}"#.into()))
        .await
        .unwrap();

    let pong = next_text(&mut ws).await;
    let verifier = MessageValidator::new(KEY).unwrap();
    let pong = verifier.verify_outgoing(pong.as_bytes()).unwrap();
    assert_eq!(pong.kind, MessageKind::Pong);
    assert!(pong.timestamp > 0);
    assert!(pong.signature.is_some());

    let extra = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(extra.is_err(), "unexpected second reply: {:?}", extra);

    channel.stop().await.unwrap();
}

// ─── Outbound & stop ─────────────────────────────────────────────

#[tokio::test]
async fn test_send_signs_and_stop_closes_gracefully() {
    let (listener, url) = bind().await;
    let channel = channel(bridge_config(&url), &[]);
    let (tx, _rx) = mpsc::channel(16);

    let before = channel
        .send_message(OutboundMessage::new("whatsapp", "+15550001", "early"))
        .await
        .unwrap_err();
    assert!(matches!(before, ChannelError::NotConnected));

    let (started, (mut ws, _)) = tokio::join!(channel.start(tx), accept_one(&listener));
    started.unwrap();

    channel
        .send_message(
            OutboundMessage::new("whatsapp", "+15550001", "  Hi\u{0001} there ")
                .with_media("docs/report.pdf"),
        )
        .await
        .unwrap();

    let sent = next_text(&mut ws).await;
    let verifier = MessageValidator::new(KEY).unwrap();
    let frame = verifier.verify_outgoing(sent.as_bytes()).unwrap();
    assert_eq!(frame.kind, MessageKind::Message);
    assert_eq!(frame.to, "+15550001");
    assert_eq!(frame.content, "Hi there");
    assert_eq!(frame.media, vec!["docs/report.pdf".to_string()]);

    let mut tampered: serde_json::Value = serde_json::from_str(&sent).unwrap();
    tampered["content"] = "Hi there!".into();
    assert!(matches!(
        verifier.verify_outgoing(tampered.to_string().as_bytes()),
        Err(ChannelError::SignatureMismatch)
    ));

    let unsafe_media = channel
        .send_message(
            OutboundMessage::new("whatsapp", "+15550001", "x").with_media("../../etc/passwd.png"),
        )
        .await
        .unwrap_err();
    assert!(matches!(unsafe_media, ChannelError::UnsafeMediaPath { .. }));

    channel.stop().await.unwrap();
    let close = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {:?}", other),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(close.map(|f| f.code), Some(CloseCode::Normal));

    channel.stop().await.unwrap();
    assert_eq!(channel.state(), ConnectionState::Stopped);
    let after = channel
        .send_message(OutboundMessage::new("whatsapp", "+15550001", "late"))
        .await
        .unwrap_err();
    assert!(matches!(after, ChannelError::NotConnected));
}

// ─── Failure & reconnection ──────────────────────────────────────

/// Bridge that accepts the first handshake and closes it at once, then drops
/// every later connection until `hold` is set.
fn spawn_flaky_bridge(listener: TcpListener) -> (Arc<AtomicUsize>, Arc<AtomicBool>) {
    let accepted = Arc::new(AtomicUsize::new(0));
    let hold = Arc::new(AtomicBool::new(false));
    let (count, holding) = (accepted.clone(), hold.clone());

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let n = count.fetch_add(1, Ordering::SeqCst);
            if holding.load(Ordering::SeqCst) {
                tokio::spawn(async move {
                    let (mut ws, _) = handshake(stream, true).await;
                    while let Some(Ok(_)) = ws.next().await {}
                });
            } else if n == 0 {
                let (mut ws, _) = handshake(stream, true).await;
                let _ = ws.close(None).await;
            } else {
                drop(stream);
            }
        }
    });

    (accepted, hold)
}

#[tokio::test]
async fn test_reconnect_exhausts_then_manual_restart_resets() {
    let (listener, url) = bind().await;
    let (accepted, hold) = spawn_flaky_bridge(listener);

    let mut bridge = bridge_config(&url);
    bridge.retry.initial_delay_ms = 10;
    bridge.retry.max_delay_ms = 80;
    let channel = channel(bridge, &[]);
    let (tx, mut rx) = mpsc::channel(64);

    channel.start(tx).await.unwrap();

    let mut disconnects = 0;
    let mut scheduled = Vec::new();
    let exhausted = tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await.expect("event channel closed") {
                ChannelEvent::Disconnected { .. } => disconnects += 1,
                ChannelEvent::Reconnecting { attempt, delay, .. } => {
                    scheduled.push((attempt, delay))
                }
                ChannelEvent::ReconnectExhausted { attempts, .. } => return attempts,
                _ => {}
            }
        }
    })
    .await
    .expect("retries never exhausted");

    assert_eq!(exhausted, 5);
    assert_eq!(disconnects, 1);
    assert_eq!(
        scheduled.iter().map(|(a, _)| *a).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    assert!(scheduled.windows(2).all(|w| w[0].1 <= w[1].1));
    assert!(scheduled[0].1 < scheduled[4].1);
    assert_eq!(accepted.load(Ordering::SeqCst), 6);

    assert_eq!(channel.state(), ConnectionState::Degraded);
    let err = channel
        .send_message(OutboundMessage::new("whatsapp", "+15550001", "queued?"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::NotConnected));

    // Manual restart against a healthy bridge
    hold.store(true, Ordering::SeqCst);
    let (tx, mut rx) = mpsc::channel(64);
    channel.start(tx).await.unwrap();
    wait_for(&mut rx, |e| matches!(e, ChannelEvent::Connected { .. })).await;

    assert_eq!(channel.state(), ConnectionState::Connected);
    assert_eq!(channel.retry_attempts().await, 0);
    channel
        .send_message(OutboundMessage::new("whatsapp", "+15550001", "back"))
        .await
        .unwrap();

    channel.stop().await.unwrap();
}

#[tokio::test]
async fn test_silent_bridge_hits_read_deadline_and_reconnects() {
    let (listener, url) = bind().await;
    let (_accepted, hold) = spawn_flaky_bridge(listener);
    hold.store(true, Ordering::SeqCst);

    let mut bridge = bridge_config(&url);
    bridge.timeouts.read_secs = 1;
    bridge.retry.initial_delay_ms = 10;
    let channel = channel(bridge, &[]);
    let (tx, mut rx) = mpsc::channel(64);

    channel.start(tx).await.unwrap();

    let event = wait_for(&mut rx, |e| matches!(e, ChannelEvent::Disconnected { .. })).await;
    let ChannelEvent::Disconnected { reason, .. } = event else {
        unreachable!()
    };
    assert!(reason.contains("keepalive"), "{reason}");

    wait_for(&mut rx, |e| matches!(e, ChannelEvent::Connected { .. })).await;
    assert_eq!(channel.retry_attempts().await, 0);

    channel.stop().await.unwrap();
    assert_eq!(channel.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_send_write_failure_degrades_and_schedules_reconnect() {
    let (listener, url) = bind().await;
    // Complete the handshake, then never read so the socket buffers fill up
    tokio::spawn(async move {
        let (_ws, _) = accept_one(&listener).await;
        std::future::pending::<()>().await;
    });

    let mut bridge = bridge_config(&url);
    bridge.timeouts.write_secs = 1;
    bridge.retry.initial_delay_ms = 60_000;
    bridge.retry.max_delay_ms = 60_000;
    let channel = channel(bridge, &[]);
    let (tx, mut rx) = mpsc::channel(64);

    channel.start(tx).await.unwrap();
    wait_for(&mut rx, |e| matches!(e, ChannelEvent::Connected { .. })).await;

    let content = "x".repeat(4000);
    let (sent, err) = tokio::time::timeout(Duration::from_secs(30), async {
        let mut sent = 0usize;
        loop {
            match channel
                .send_message(OutboundMessage::new("whatsapp", "+15550001", &content))
                .await
            {
                Ok(_) => sent += 1,
                Err(e) => return (sent, e),
            }
        }
    })
    .await
    .expect("bridge socket never stopped accepting writes");

    assert!(sent > 0);
    assert!(matches!(err, ChannelError::WriteFailed(_)), "{err}");
    assert_eq!(channel.state(), ConnectionState::Degraded);

    let event = wait_for(&mut rx, |e| matches!(e, ChannelEvent::Disconnected { .. })).await;
    let ChannelEvent::Disconnected { reason, .. } = event else {
        unreachable!()
    };
    assert!(reason.contains("Write failed"), "{reason}");

    let event = wait_for(&mut rx, |e| matches!(e, ChannelEvent::Reconnecting { .. })).await;
    let ChannelEvent::Reconnecting { attempt, delay, .. } = event else {
        unreachable!()
    };
    assert_eq!(attempt, 1);
    assert_eq!(delay, Duration::from_secs(60));

    // Still waiting out the backoff; sends fail fast
    assert_eq!(channel.state(), ConnectionState::Degraded);
    let err = channel
        .send_message(OutboundMessage::new("whatsapp", "+15550001", "hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::NotConnected));

    channel.stop().await.unwrap();
    assert_eq!(channel.state(), ConnectionState::Stopped);
    channel.stop().await.unwrap();
    assert_eq!(channel.state(), ConnectionState::Stopped);
}
