//! REST surface over the same store the tracking core writes to.
//!
//! Read endpoints for dashboards plus the driver's status toggle. All
//! routes require the cookie credential; errors come back as
//! `{"error": ...}` JSON.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::info;

use crate::auth;
use crate::error::TrackError;
use crate::state::AppState;
use crate::store::{Buggy, HistoryPoint, LiveLocationRow};
use crate::types::Role;

/// GET /api/tracking/live-location — current positions of running
/// buggies.
pub async fn live_location(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<LiveLocationRow>>, TrackError> {
    auth::authenticate(&state, &headers).await?;
    let rows = state.tracking.running_live_locations().await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub buggy_id: Option<i64>,
    pub since: Option<String>,
}

/// GET /api/tracking/location-history?buggy_id=...&since=1h — trail
/// points ascending by time. `since` accepts `<N><h|m|d>`, default 1h.
pub async fn location_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HistoryPoint>>, TrackError> {
    auth::authenticate(&state, &headers).await?;

    let buggy_id = params
        .buggy_id
        .ok_or_else(|| TrackError::BadRequest("buggy_id parameter is required".into()))?;
    let since = params.since.as_deref().unwrap_or("1h");
    let start = parse_since(since, Utc::now())?;

    let rows = state.tracking.history_since(buggy_id, start).await?;
    Ok(Json(rows))
}

/// GET /api/tracking/available-buggies — running buggies.
pub async fn available_buggies(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Buggy>>, TrackError> {
    auth::authenticate(&state, &headers).await?;
    let rows = state.tracking.running_buggies().await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub buggy_id: i64,
    pub is_running: bool,
}

/// POST /api/tracking/update-buggy-status — a driver starting or
/// stopping their shift. Stopping also clears the live row, keeping the
/// invariant that a live location exists only while the buggy is being
/// driven.
pub async fn update_buggy_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<StatusBody>,
) -> Result<Json<Buggy>, TrackError> {
    let identity = auth::authenticate(&state, &headers).await?;
    if identity.role != Role::Driver {
        return Err(TrackError::Forbidden("only drivers can update buggy status".into()));
    }

    let buggy = state
        .tracking
        .get_buggy(body.buggy_id)
        .await?
        .filter(|b| b.assigned_driver == Some(identity.id))
        .ok_or_else(|| TrackError::NotFound("buggy not found or not assigned to you".into()))?;

    let updated = state
        .tracking
        .set_running(buggy.id, body.is_running)
        .await?
        .ok_or_else(|| TrackError::NotFound("buggy not found or not assigned to you".into()))?;

    if !body.is_running {
        state.tracking.delete_live_location(buggy.id).await?;
    }

    info!(
        buggy_id = buggy.id,
        user_id = identity.id,
        is_running = body.is_running,
        "buggy status updated"
    );
    Ok(Json(updated))
}

/// GET /api/tracking/assigned-buggy — the calling driver's buggy.
pub async fn assigned_buggy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Buggy>, TrackError> {
    let identity = auth::authenticate(&state, &headers).await?;
    if identity.role != Role::Driver {
        return Err(TrackError::Forbidden("only drivers have an assigned buggy".into()));
    }

    let buggy = state
        .tracking
        .buggies_by_driver(identity.id)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| TrackError::NotFound("no buggy assigned".into()))?;
    Ok(Json(buggy))
}

/// Parse a `<number><unit>` range like `1h`, `30m`, `2d` into the
/// timestamp that far before `now`.
fn parse_since(since: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, TrackError> {
    let invalid = || {
        TrackError::BadRequest(
            "invalid 'since' parameter format, use {number}{unit} where unit is h, m, or d".into(),
        )
    };

    // Split on the last character, not the last byte — the parameter
    // is attacker-controlled and may be multibyte UTF-8.
    let (value, unit) = match since.char_indices().last() {
        Some((idx, unit)) if idx > 0 => (&since[..idx], unit),
        _ => return Err(invalid()),
    };
    let value: i64 = value.parse().map_err(|_| invalid())?;
    if value < 0 {
        return Err(invalid());
    }
    let delta = match unit {
        'h' | 'H' => Duration::try_hours(value),
        'm' | 'M' => Duration::try_minutes(value),
        'd' | 'D' => Duration::try_days(value),
        _ => None,
    }
    .ok_or_else(invalid)?;
    now.checked_sub_signed(delta).ok_or_else(invalid)
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hour_minute_day_ranges() {
        let now = Utc::now();
        assert_eq!(parse_since("1h", now).unwrap(), now - Duration::hours(1));
        assert_eq!(parse_since("30m", now).unwrap(), now - Duration::minutes(30));
        assert_eq!(parse_since("2d", now).unwrap(), now - Duration::days(2));
        assert_eq!(parse_since("1D", now).unwrap(), now - Duration::days(1));
    }

    #[test]
    fn rejects_garbage_ranges() {
        let now = Utc::now();
        assert!(parse_since("", now).is_err());
        assert!(parse_since("h", now).is_err());
        assert!(parse_since("12", now).is_err());
        assert!(parse_since("1w", now).is_err());
        assert!(parse_since("-1h", now).is_err());
        assert!(parse_since("x1h", now).is_err());
    }

    #[test]
    fn rejects_multibyte_ranges_without_panicking() {
        // A byte-index split would panic on these mid-char boundaries.
        let now = Utc::now();
        assert!(parse_since("é", now).is_err());
        assert!(parse_since("1é", now).is_err());
        assert!(parse_since("日h", now).is_err());
    }

    #[test]
    fn rejects_overflowing_ranges_without_panicking() {
        let now = Utc::now();
        // Overflows chrono's Duration.
        assert!(parse_since("9999999999999h", now).is_err());
        // Fits in a Duration but walks off the datetime range.
        assert!(parse_since("9999999999h", now).is_err());
    }
}
