//! Group Registry — channel-keyed fan-out for live connections.
//!
//! A channel is a named broadcast group. Each member is a connection id
//! plus the sending half of that connection's outbound queue. DashMap
//! serializes membership changes and sends per channel; operations on
//! different channels do not block each other.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::ServerFrame;

/// Outbound queue handle for one connection. Frames are pre-serialized
/// so fan-out serializes once, not per member.
pub type ConnSender = mpsc::Sender<String>;

#[derive(Clone, Default)]
pub struct Registry {
    channels: Arc<DashMap<String, HashMap<Uuid, ConnSender>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a channel. Joining twice replaces the sender.
    pub fn join(&self, channel: &str, conn_id: Uuid, tx: ConnSender) {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn_id, tx);
        debug!(channel, conn_id = %conn_id, "channel join");
    }

    /// Remove a connection from one channel. No-op if absent.
    pub fn leave(&self, channel: &str, conn_id: Uuid) {
        if let Some(mut members) = self.channels.get_mut(channel) {
            members.remove(&conn_id);
        }
        self.channels.remove_if(channel, |_, m| m.is_empty());
    }

    /// Remove a connection from every channel. Idempotent.
    pub fn leave_all(&self, conn_id: Uuid) {
        for mut entry in self.channels.iter_mut() {
            entry.value_mut().remove(&conn_id);
        }
        self.channels.retain(|_, m| !m.is_empty());
    }

    /// Deliver a frame to every member of a channel. A member whose
    /// queue is full or closed is dropped from all channels
    /// asynchronously; delivery to the rest continues.
    pub fn send(&self, channel: &str, frame: &ServerFrame) {
        let json = match serde_json::to_string(frame) {
            Ok(j) => j,
            Err(e) => {
                warn!(channel, "frame serialize error: {e}");
                return;
            }
        };

        let mut dead: Vec<Uuid> = Vec::new();
        if let Some(mut members) = self.channels.get_mut(channel) {
            for (conn_id, tx) in members.iter() {
                if tx.try_send(json.clone()).is_err() {
                    dead.push(*conn_id);
                }
            }
            for conn_id in &dead {
                members.remove(conn_id);
            }
        }

        // A failed send means the peer is gone or hopelessly behind —
        // treat it as a disconnect and clear its other memberships off
        // the send path.
        for conn_id in dead {
            warn!(channel, conn_id = %conn_id, "send failed, evicting member");
            let registry = self.clone();
            tokio::spawn(async move {
                registry.leave_all(conn_id);
            });
        }
    }

    /// Number of members currently in a channel.
    pub fn member_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|m| m.len()).unwrap_or(0)
    }
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LocationBroadcast, SubscriptionAck};
    use chrono::Utc;

    fn update_frame(buggy_id: i64) -> ServerFrame {
        ServerFrame::LocationUpdate(LocationBroadcast {
            buggy_id,
            latitude: 1.0,
            longitude: 2.0,
            direction: None,
            driver_name: "A".into(),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn send_reaches_every_member() {
        let registry = Registry::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.join("broadcast:location", a, tx_a);
        registry.join("broadcast:location", b, tx_b);

        registry.send("broadcast:location", &update_frame(7));

        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        assert!(got_a.contains("\"buggy_id\":7"));
        assert_eq!(got_a, got_b);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let registry = Registry::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        registry.join("driver:1", Uuid::new_v4(), tx_a);
        registry.join("broadcast:location", Uuid::new_v4(), tx_b);

        registry.send("broadcast:location", &update_frame(1));

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn full_queue_member_is_evicted_without_blocking_others() {
        let registry = Registry::new();
        let (tx_slow, _rx_slow) = mpsc::channel(1);
        let (tx_ok, mut rx_ok) = mpsc::channel(8);
        let slow = Uuid::new_v4();
        let ok = Uuid::new_v4();
        registry.join("broadcast:location", slow, tx_slow.clone());
        registry.join("broadcast:location", ok, tx_ok);
        // Fill the slow member's queue.
        tx_slow.try_send("stale".into()).unwrap();

        registry.send("broadcast:location", &update_frame(1));
        registry.send("broadcast:location", &update_frame(2));

        // Healthy member saw both frames.
        assert!(rx_ok.recv().await.is_some());
        assert!(rx_ok.recv().await.is_some());
        // Slow member was dropped on the first failed send.
        assert_eq!(registry.member_count("broadcast:location"), 1);
    }

    #[tokio::test]
    async fn leave_all_clears_every_channel() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::channel(8);
        let conn = Uuid::new_v4();
        registry.join("broadcast:location", conn, tx.clone());
        registry.join("viewer:42", conn, tx);

        registry.leave_all(conn);

        assert_eq!(registry.member_count("broadcast:location"), 0);
        assert_eq!(registry.member_count("viewer:42"), 0);
        // Repeat is a no-op, not an error.
        registry.leave_all(conn);
    }

    #[tokio::test]
    async fn sending_to_empty_channel_is_a_noop() {
        let registry = Registry::new();
        registry.send("broadcast:location", &update_frame(1));
        registry.send(
            "viewer:1",
            &ServerFrame::SubscriptionConfirmed(SubscriptionAck { buggy_ids: vec![] }),
        );
    }
}
