//! Rust client for the buggyd tracking protocol.
//!
//! ```ignore
//! let client = BuggyClient::connect("ws://localhost:8000", token).await;
//! client.send_location(7, 40.44, -79.94, None).await?;
//! ```
//!
//! A background tokio task owns the WebSocket, authenticates with the
//! credential cookie on the handshake, and reconnects with exponential
//! backoff + jitter. API methods never block on I/O — frames go
//! through a bounded channel to the task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════
// Public types
// ═══════════════════════════════════════════════════════════════

/// Connection settings for [`BuggyClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server endpoint, e.g. `ws://host:8000` or `https://host`.
    pub server_url: String,
    /// Bearer token, sent as a cookie on the handshake.
    pub token: String,
    /// Cookie name the server expects the token in.
    pub cookie_name: String,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            cookie_name: "buggy_auth".into(),
        }
    }
}

/// Frames the server pushes to us.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    LocationUpdate {
        buggy_id: i64,
        latitude: f64,
        longitude: f64,
        direction: Option<f64>,
        driver_name: String,
        timestamp: DateTime<Utc>,
    },
    SubscriptionConfirmed {
        buggy_ids: Vec<i64>,
    },
}

#[derive(Debug)]
pub enum ClientError {
    /// Channel closed (background task died).
    ChannelClosed,
    /// Outbound queue full while disconnected.
    Busy,
    /// Serialization error.
    Serialize(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "background task stopped"),
            Self::Busy => write!(f, "outbound queue full"),
            Self::Serialize(e) => write!(f, "serialize error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

// ═══════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════

/// Handle to the background connection task.
pub struct BuggyClient {
    tx: mpsc::Sender<Outbound>,
    updates: broadcast::Sender<ServerEvent>,
    connected: Arc<AtomicBool>,
}

/// Message sent from API methods to the background task.
enum Outbound {
    Frame(String),
    /// Subscribe frames are remembered so the interest list is
    /// re-declared after a reconnect.
    Subscribe(Vec<i64>),
    Shutdown,
}

impl BuggyClient {
    /// Connect with the default cookie name. The connection is
    /// established (and re-established) in the background; use
    /// [`is_connected`](Self::is_connected) to observe it.
    pub async fn connect(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::connect_with(ClientConfig::new(server_url, token)).await
    }

    /// Connect with explicit settings.
    pub async fn connect_with(config: ClientConfig) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<Outbound>(256);
        let (updates, _) = broadcast::channel(1024);

        let bg_connected = Arc::clone(&connected);
        let bg_updates = updates.clone();
        tokio::spawn(async move {
            ws_task(config, rx, bg_updates, bg_connected).await;
        });

        Self {
            tx,
            updates,
            connected,
        }
    }

    /// Whether the WebSocket is currently connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Stream of parsed server frames (broadcasts and acks). Each call
    /// returns an independent receiver; a receiver that falls behind
    /// loses the oldest frames, matching the perishable nature of
    /// position data.
    pub fn updates(&self) -> broadcast::Receiver<ServerEvent> {
        self.updates.subscribe()
    }

    /// Push a position report (driver role).
    pub async fn send_location(
        &self,
        buggy_id: i64,
        latitude: f64,
        longitude: f64,
        direction: Option<f64>,
    ) -> Result<(), ClientError> {
        let frame = WireLocationUpdate {
            r#type: "location_update",
            buggy_id,
            latitude,
            longitude,
            direction,
        };
        let json =
            serde_json::to_string(&frame).map_err(|e| ClientError::Serialize(e.to_string()))?;
        self.enqueue(Outbound::Frame(json))
    }

    /// Declare interest in a set of buggies (viewer role). The server
    /// acknowledges with the same list; broadcasts are not filtered.
    pub async fn subscribe(&self, buggy_ids: Vec<i64>) -> Result<(), ClientError> {
        self.enqueue(Outbound::Subscribe(buggy_ids))
    }

    /// Close the connection and stop the background task.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Outbound::Shutdown).await;
        // Give the background task a moment to send the close frame.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    fn enqueue(&self, msg: Outbound) -> Result<(), ClientError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientError::Busy,
            mpsc::error::TrySendError::Closed(_) => ClientError::ChannelClosed,
        })
    }
}

// ═══════════════════════════════════════════════════════════════
// Wire frames
// ═══════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct WireLocationUpdate {
    r#type: &'static str,
    buggy_id: i64,
    latitude: f64,
    longitude: f64,
    direction: Option<f64>,
}

#[derive(Serialize)]
struct WireSubscribe {
    r#type: &'static str,
    buggy_ids: Vec<i64>,
}

/// Convert a server endpoint to the ws:// tracking URL.
/// Handles: ws://, wss://, http://, https://
fn normalize_ws_url(ep: &str) -> String {
    let url = ep.replace("https://", "wss://").replace("http://", "ws://");
    if !url.contains("/ws/") {
        format!("{}/ws/location/updates", url.trim_end_matches('/'))
    } else {
        url
    }
}

// ═══════════════════════════════════════════════════════════════
// Background WebSocket task
// ═══════════════════════════════════════════════════════════════

/// Owns the socket: connects with the cookie credential, pumps frames
/// both ways, reconnects on loss.
async fn ws_task(
    config: ClientConfig,
    mut rx: mpsc::Receiver<Outbound>,
    updates: broadcast::Sender<ServerEvent>,
    connected: Arc<AtomicBool>,
) {
    let ws_url = normalize_ws_url(&config.server_url);
    let cookie = format!("{}={}", config.cookie_name, config.token);
    let mut attempt: u32 = 0;
    let mut subscription: Option<Vec<i64>> = None;

    loop {
        // ── Connect ─────────────────────────────────────────
        let request = match ws_url.as_str().into_client_request() {
            Ok(mut req) => match cookie.parse() {
                Ok(value) => {
                    req.headers_mut().insert(COOKIE, value);
                    req
                }
                Err(e) => {
                    warn!("cookie header invalid: {e}");
                    return;
                }
            },
            Err(e) => {
                warn!(url = %ws_url, "invalid server url: {e}");
                return;
            }
        };

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _)) => {
                info!(url = %ws_url, "WebSocket connected");
                attempt = 0;
                stream
            }
            Err(e) => {
                warn!(url = %ws_url, attempt, "WebSocket connect failed: {e}");
                connected.store(false, Ordering::Relaxed);
                backoff_sleep(attempt).await;
                attempt = attempt.saturating_add(1);
                continue;
            }
        };

        use futures::{SinkExt, StreamExt};
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        connected.store(true, Ordering::Relaxed);

        // Re-declare interest after a reconnect.
        if let Some(ids) = &subscription {
            let frame = WireSubscribe {
                r#type: "subscribe",
                buggy_ids: ids.clone(),
            };
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = ws_tx.send(Message::Text(json.into())).await;
            }
        }

        // ── Message loop ────────────────────────────────────
        loop {
            tokio::select! {
                // Outbound frames from API methods.
                msg = rx.recv() => {
                    match msg {
                        Some(Outbound::Frame(json)) => {
                            if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
                                warn!("send error: {e}");
                                break; // reconnect
                            }
                        }
                        Some(Outbound::Subscribe(ids)) => {
                            let frame = WireSubscribe {
                                r#type: "subscribe",
                                buggy_ids: ids.clone(),
                            };
                            subscription = Some(ids);
                            match serde_json::to_string(&frame) {
                                Ok(json) => {
                                    if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
                                        warn!("send error: {e}");
                                        break; // reconnect
                                    }
                                }
                                Err(e) => warn!("subscribe serialize error: {e}"),
                            }
                        }
                        Some(Outbound::Shutdown) => {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            connected.store(false, Ordering::Relaxed);
                            return;
                        }
                        None => {
                            // Client dropped.
                            connected.store(false, Ordering::Relaxed);
                            return;
                        }
                    }
                }
                // Inbound frames from the server.
                frame = ws_rx.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerEvent>(&text) {
                                // No receivers is fine — send() just fails.
                                Ok(event) => { let _ = updates.send(event); }
                                Err(e) => debug!("unrecognized server frame: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("server closed connection");
                            break; // reconnect
                        }
                        Some(Ok(_)) => {} // ping/pong/binary
                        Some(Err(e)) => {
                            warn!("ws recv error: {e}");
                            break; // reconnect
                        }
                        None => {
                            info!("ws stream ended");
                            break; // reconnect
                        }
                    }
                }
            }
        }

        // Connection lost — loop back to reconnect.
        connected.store(false, Ordering::Relaxed);
        backoff_sleep(attempt).await;
        attempt = attempt.saturating_add(1);
    }
}

/// Exponential backoff with jitter.
/// delay = min(100ms × 2^attempt, 30s) + random(0, delay × 0.5)
async fn backoff_sleep(attempt: u32) {
    let base_ms = 100u64.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped_ms = base_ms.min(30_000);
    let jitter_ms = (rand::random::<f64>() * capped_ms as f64 * 0.5) as u64;
    let total = Duration::from_millis(capped_ms + jitter_ms);
    debug!(ms = total.as_millis(), attempt, "backoff sleep");
    tokio::time::sleep(total).await;
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ws_url() {
        assert_eq!(
            normalize_ws_url("ws://localhost:8000/ws/location/updates"),
            "ws://localhost:8000/ws/location/updates"
        );
        assert_eq!(
            normalize_ws_url("http://localhost:8000"),
            "ws://localhost:8000/ws/location/updates"
        );
        assert_eq!(
            normalize_ws_url("https://buggy.campus.edu/"),
            "wss://buggy.campus.edu/ws/location/updates"
        );
    }

    #[test]
    fn test_location_update_wire_shape() {
        let frame = WireLocationUpdate {
            r#type: "location_update",
            buggy_id: 7,
            latitude: 1.0,
            longitude: 2.0,
            direction: None,
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "location_update");
        assert_eq!(json["buggy_id"], 7);
        assert!(json["direction"].is_null());
    }

    #[test]
    fn test_parse_server_broadcast() {
        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"location_update","buggy_id":7,"latitude":1.0,"longitude":2.0,"direction":null,"driver_name":"A","timestamp":"2026-08-29T12:00:00Z"}"#,
        )
        .unwrap();
        match event {
            ServerEvent::LocationUpdate {
                buggy_id,
                driver_name,
                ..
            } => {
                assert_eq!(buggy_id, 7);
                assert_eq!(driver_name, "A");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_parse_subscription_ack() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"subscription_confirmed","buggy_ids":[1,2,3]}"#)
                .unwrap();
        assert!(matches!(
            event,
            ServerEvent::SubscriptionConfirmed { buggy_ids } if buggy_ids == vec![1, 2, 3]
        ));
    }

    #[tokio::test]
    async fn test_client_queues_while_disconnected() {
        // No server listening — frames queue, nothing blocks or panics.
        let client = BuggyClient::connect("ws://127.0.0.1:1", "tok").await;
        assert!(!client.is_connected());
        client.send_location(7, 1.0, 2.0, Some(90.0)).await.unwrap();
        client.subscribe(vec![7]).await.unwrap();
        client.shutdown().await;
    }
}
