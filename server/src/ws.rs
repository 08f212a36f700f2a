//! WebSocket handler — the heart of buggyd.
//!
//! Flow per connection:
//! 1. Resolve the cookie credential; refuse the upgrade on failure
//! 2. Accept, join channels by role, start the writer task
//! 3. Enter message loop: location updates from drivers, subscribe
//!    acks for viewers, fan-out frames to the client
//! 4. On disconnect: leave all channels, clear the driver's live row

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::state::AppState;
use crate::types::*;

/// Outbound queue depth per connection. `try_send` failure past this
/// is treated as a dead peer.
const OUTBOUND_QUEUE: usize = 256;

/// Axum handler for GET /ws/location/updates.
///
/// The credential is checked before the upgrade: a bad, expired or
/// missing cookie yields 401 and the socket is never accepted.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let identity = match auth::authenticate(&state, &headers).await {
        Ok(identity) => identity,
        Err(e) => {
            info!("connection refused: {e}");
            return e.into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
        .into_response()
}

/// Per-connection lifecycle: join channels, pump frames, reap on close.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let conn_id = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

    // Group membership by role. Rebuilt from scratch on every connect,
    // never persisted.
    match identity.role {
        Role::Driver => {
            state.registry.join(&driver_channel(identity.id), conn_id, tx.clone());
        }
        Role::Student | Role::Staff => {
            state.registry.join(BROADCAST_LOCATION, conn_id, tx.clone());
            state.registry.join(&viewer_channel(identity.id), conn_id, tx.clone());
        }
    }

    info!(
        conn_id = %conn_id,
        user_id = identity.id,
        role = identity.role.as_str(),
        "connection open"
    );

    // Writer task: pumps queued frames into the socket. Ends when every
    // sender (registry memberships + the local handle) is gone.
    let writer = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Advisory interest list from subscribe frames. Kept per connection
    // only; broadcasts are not filtered by it.
    let mut subscribed: HashSet<i64> = HashSet::new();

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_frame(&text, &identity, &mut subscribed, &tx, &state).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) => { /* axum auto-pongs */ }
            Ok(_) => { /* binary frames ignored */ }
            Err(e) => {
                warn!(conn_id = %conn_id, "ws recv error: {e}");
                break;
            }
        }
    }

    // Reap before releasing connection resources.
    reap(conn_id, &identity, &state).await;
    drop(tx);
    let _ = writer.await;

    info!(conn_id = %conn_id, user_id = identity.id, "connection closed");
}

/// Dispatch one inbound frame. Malformed or unauthorized frames are
/// dropped without a reply — the sender learns nothing about why.
pub async fn handle_frame(
    text: &str,
    identity: &Identity,
    subscribed: &mut HashSet<i64>,
    tx: &mpsc::Sender<String>,
    state: &AppState,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!(user_id = identity.id, "unparseable frame dropped: {e}");
            return;
        }
    };

    match (frame, identity.role) {
        (ClientFrame::LocationUpdate(msg), Role::Driver) => {
            apply_location_update(msg, identity, state).await;
        }
        (ClientFrame::Subscribe(msg), Role::Student | Role::Staff) => {
            // Empty list: ignored, no ack.
            if msg.buggy_ids.is_empty() {
                return;
            }
            subscribed.clear();
            subscribed.extend(&msg.buggy_ids);
            let mut ids: Vec<i64> = subscribed.iter().copied().collect();
            ids.sort_unstable();
            let ack = ServerFrame::SubscriptionConfirmed(SubscriptionAck { buggy_ids: ids });
            if let Ok(json) = serde_json::to_string(&ack) {
                let _ = tx.try_send(json);
            }
        }
        (frame, role) => {
            debug!(
                user_id = identity.id,
                role = role.as_str(),
                "frame not allowed for role, dropped: {frame:?}"
            );
        }
    }
}

/// Validate and apply a driver's position report as one logical
/// operation: upsert the live row, append throttled history, broadcast.
///
/// Authorization failures drop silently. A store failure skips the
/// broadcast — unconfirmed state is never fanned out — and leaves the
/// connection open.
pub async fn apply_location_update(msg: LocationUpdateMsg, identity: &Identity, state: &AppState) {
    let buggy = match state.tracking.get_buggy(msg.buggy_id).await {
        Ok(Some(b)) => b,
        Ok(None) => {
            debug!(user_id = identity.id, buggy_id = msg.buggy_id, "unknown buggy, dropped");
            return;
        }
        Err(e) => {
            error!(buggy_id = msg.buggy_id, "buggy lookup failed: {e}");
            return;
        }
    };

    if buggy.assigned_driver != Some(identity.id) || !buggy.is_running {
        debug!(
            user_id = identity.id,
            buggy_id = msg.buggy_id,
            "unauthorized or stopped buggy, dropped"
        );
        return;
    }

    if let Err(e) = state
        .tracking
        .upsert_live_location(buggy.id, msg.latitude, msg.longitude, msg.direction)
        .await
    {
        error!(buggy_id = buggy.id, "live location upsert failed: {e}");
        return;
    }

    // Leaky bucket of one: keep the first update per window, skip the
    // rest. Live state and broadcast are unaffected by the skip.
    let now = Utc::now();
    match state
        .tracking
        .has_recent_history(buggy.id, now - state.config.history_window())
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            if let Err(e) = state
                .tracking
                .append_history(buggy.id, identity.id, msg.latitude, msg.longitude)
                .await
            {
                error!(buggy_id = buggy.id, "history append failed: {e}");
                return;
            }
        }
        Err(e) => {
            error!(buggy_id = buggy.id, "history window check failed: {e}");
            return;
        }
    }

    state.registry.send(
        BROADCAST_LOCATION,
        &ServerFrame::LocationUpdate(LocationBroadcast {
            buggy_id: buggy.id,
            latitude: msg.latitude,
            longitude: msg.longitude,
            direction: msg.direction,
            driver_name: identity.username.clone(),
            timestamp: now,
        }),
    );
}

/// Disconnect Reaper. Clears channel memberships and, for drivers, the
/// live rows of their assigned buggies. Best-effort: the connection is
/// already gone, so failures are logged and swallowed.
pub async fn reap(conn_id: Uuid, identity: &Identity, state: &AppState) {
    state.registry.leave_all(conn_id);

    if identity.role != Role::Driver {
        return;
    }

    match state.tracking.buggies_by_driver(identity.id).await {
        Ok(buggies) => {
            for buggy in buggies {
                if let Err(e) = state.tracking.delete_live_location(buggy.id).await {
                    warn!(buggy_id = buggy.id, "live location cleanup failed: {e}");
                } else {
                    debug!(buggy_id = buggy.id, "live location cleared on disconnect");
                }
            }
        }
        Err(e) => warn!(user_id = identity.id, "reaper buggy lookup failed: {e}"),
    }
}
