//! Wire protocol types and the authenticated identity model.
//!
//! Covers: location_update and subscribe from clients, location_update
//! broadcasts and subscription_confirmed acks to clients, plus the
//! closed role enum and channel naming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════
// Client → Server frames
// ═══════════════════════════════════════════════════════════════

/// Top-level envelope from client.
/// The `type` field is used to dispatch.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    LocationUpdate(LocationUpdateMsg),
    Subscribe(SubscribeMsg),
}

/// Position report from a driver. `buggy_id`, `latitude` and `longitude`
/// are mandatory — a frame missing any of them fails to parse and is
/// dropped without a reply.
#[derive(Debug, Deserialize)]
pub struct LocationUpdateMsg {
    pub buggy_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// Heading in degrees, if the device reports one.
    #[serde(default)]
    pub direction: Option<f64>,
}

/// Interest declaration from a viewer. Advisory only — broadcasts are
/// not filtered by it.
#[derive(Debug, Deserialize)]
pub struct SubscribeMsg {
    pub buggy_ids: Vec<i64>,
}

// ═══════════════════════════════════════════════════════════════
// Server → Client frames
// ═══════════════════════════════════════════════════════════════

/// Top-level envelope to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    LocationUpdate(LocationBroadcast),
    SubscriptionConfirmed(SubscriptionAck),
}

/// Fanned out to every `broadcast:location` member on each accepted
/// update. Self-describing: carries the driver name and a server
/// timestamp so receivers can judge freshness.
#[derive(Debug, Clone, Serialize)]
pub struct LocationBroadcast {
    pub buggy_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub direction: Option<f64>,
    pub driver_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Echoes the subscribed ids back to the client.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionAck {
    pub buggy_ids: Vec<i64>,
}

// ═══════════════════════════════════════════════════════════════
// Identity
// ═══════════════════════════════════════════════════════════════

/// Closed role set. Matched exhaustively at the two decision points:
/// channel selection on connect and update authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Permitted to push location updates.
    Driver,
    /// Rider — receives broadcasts.
    Student,
    /// Any other authenticated principal. Unknown role strings from
    /// the store collapse here.
    Staff,
}

impl Role {
    pub fn parse(s: &str) -> Self {
        match s {
            "driver" => Self::Driver,
            "student" => Self::Student,
            _ => Self::Staff,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Driver => "driver",
            Self::Student => "student",
            Self::Staff => "staff",
        }
    }
}

/// Authenticated principal bound to one connection. Resolved once at
/// handshake time; trusted until disconnect.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: i64,
    pub username: String,
    pub role: Role,
}

// ═══════════════════════════════════════════════════════════════
// Channel naming
// ═══════════════════════════════════════════════════════════════

/// Shared channel every viewer joins; all accepted updates fan out here.
pub const BROADCAST_LOCATION: &str = "broadcast:location";

/// A driver's private channel.
pub fn driver_channel(user_id: i64) -> String {
    format!("driver:{user_id}")
}

/// A viewer's private channel, reserved for future point-to-point
/// messages.
pub fn viewer_channel(user_id: i64) -> String {
    format!("viewer:{user_id}")
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_location_update_frame() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"location_update","buggy_id":7,"latitude":1.0,"longitude":2.0,"direction":null}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::LocationUpdate(msg) => {
                assert_eq!(msg.buggy_id, 7);
                assert_eq!(msg.latitude, 1.0);
                assert_eq!(msg.longitude, 2.0);
                assert_eq!(msg.direction, None);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn missing_coordinates_fail_to_parse() {
        // The silent-drop path hinges on this parse failure.
        let res: Result<ClientFrame, _> =
            serde_json::from_str(r#"{"type":"location_update","buggy_id":7,"latitude":1.0}"#);
        assert!(res.is_err());
    }

    #[test]
    fn broadcast_frame_field_names_are_stable() {
        let frame = ServerFrame::LocationUpdate(LocationBroadcast {
            buggy_id: 7,
            latitude: 1.0,
            longitude: 2.0,
            direction: Some(90.0),
            driver_name: "A".into(),
            timestamp: Utc::now(),
        });
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "location_update");
        assert_eq!(json["buggy_id"], 7);
        assert_eq!(json["driver_name"], "A");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn subscription_ack_round_trips_ids() {
        let frame = ServerFrame::SubscriptionConfirmed(SubscriptionAck {
            buggy_ids: vec![1, 2, 3],
        });
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "subscription_confirmed");
        assert_eq!(json["buggy_ids"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn unknown_roles_collapse_to_staff() {
        assert_eq!(Role::parse("driver"), Role::Driver);
        assert_eq!(Role::parse("student"), Role::Student);
        assert_eq!(Role::parse("admin"), Role::Staff);
        assert_eq!(Role::parse(""), Role::Staff);
    }
}
