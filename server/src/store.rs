//! Store seam — the interfaces the tracking core needs from the
//! relational store and the token store, plus the Postgres
//! implementation of both.
//!
//! Uses sqlx with runtime-checked queries to avoid needing a live DB
//! at compile time. Tests implement the traits over in-memory maps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::error::TrackError;
use crate::types::{Identity, Role};

// ═══════════════════════════════════════════════════════════════
// Rows
// ═══════════════════════════════════════════════════════════════

/// A vehicle. `assigned_driver` never leaves the server.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Buggy {
    pub id: i64,
    pub number_plate: String,
    pub capacity: i32,
    #[serde(skip_serializing)]
    pub assigned_driver: Option<i64>,
    pub is_running: bool,
}

/// Current position of one running buggy, joined with its driver for
/// the read surface.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LiveLocationRow {
    pub buggy_number: String,
    pub latitude: f64,
    pub longitude: f64,
    pub direction: Option<f64>,
    pub driver_name: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// One retained point on a buggy's trail.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HistoryPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

/// Result of a token lookup — everything the resolver needs to accept
/// or reject the credential.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub user_id: i64,
    pub username: String,
    pub role: Role,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.user_id,
            username: self.username.clone(),
            role: self.role,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Traits
// ═══════════════════════════════════════════════════════════════

/// Vehicle, live-location and history access.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    async fn get_buggy(&self, id: i64) -> Result<Option<Buggy>, TrackError>;

    /// Buggies currently assigned to a driver — normally at most one.
    async fn buggies_by_driver(&self, driver_id: i64) -> Result<Vec<Buggy>, TrackError>;

    /// One row per buggy; overwrites on conflict.
    async fn upsert_live_location(
        &self,
        buggy_id: i64,
        latitude: f64,
        longitude: f64,
        direction: Option<f64>,
    ) -> Result<(), TrackError>;

    /// Whether any history row for the buggy is newer than `since`.
    async fn has_recent_history(
        &self,
        buggy_id: i64,
        since: DateTime<Utc>,
    ) -> Result<bool, TrackError>;

    async fn append_history(
        &self,
        buggy_id: i64,
        driver_id: i64,
        latitude: f64,
        longitude: f64,
    ) -> Result<(), TrackError>;

    /// Idempotent — deleting an absent row is a no-op.
    async fn delete_live_location(&self, buggy_id: i64) -> Result<(), TrackError>;

    /// Live positions of buggies with `is_running = true`.
    async fn running_live_locations(&self) -> Result<Vec<LiveLocationRow>, TrackError>;

    /// Trail points for one buggy since a timestamp, ascending.
    async fn history_since(
        &self,
        buggy_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistoryPoint>, TrackError>;

    async fn running_buggies(&self) -> Result<Vec<Buggy>, TrackError>;

    /// Toggle the running flag; returns the updated row, or None if the
    /// buggy does not exist.
    async fn set_running(&self, buggy_id: i64, running: bool) -> Result<Option<Buggy>, TrackError>;
}

/// Token table access. Rows are written by the external credential
/// service; the resolver only reads and deletes.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn lookup_token(&self, key: &str) -> Result<Option<TokenRecord>, TrackError>;

    async fn delete_token(&self, key: &str) -> Result<(), TrackError>;
}

// ═══════════════════════════════════════════════════════════════
// Postgres implementation
// ═══════════════════════════════════════════════════════════════

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrackingStore for PgStore {
    async fn get_buggy(&self, id: i64) -> Result<Option<Buggy>, TrackError> {
        let row: Option<Buggy> = sqlx::query_as(
            r#"
            SELECT id, number_plate, capacity, assigned_driver, is_running
            FROM buggies WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn buggies_by_driver(&self, driver_id: i64) -> Result<Vec<Buggy>, TrackError> {
        let rows: Vec<Buggy> = sqlx::query_as(
            r#"
            SELECT id, number_plate, capacity, assigned_driver, is_running
            FROM buggies WHERE assigned_driver = $1
            "#,
        )
        .bind(driver_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn upsert_live_location(
        &self,
        buggy_id: i64,
        latitude: f64,
        longitude: f64,
        direction: Option<f64>,
    ) -> Result<(), TrackError> {
        sqlx::query(
            r#"
            INSERT INTO buggy_locations (buggy_id, latitude, longitude, direction, last_updated)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (buggy_id) DO UPDATE SET
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                direction = EXCLUDED.direction,
                last_updated = NOW()
            "#,
        )
        .bind(buggy_id)
        .bind(latitude)
        .bind(longitude)
        .bind(direction)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_recent_history(
        &self,
        buggy_id: i64,
        since: DateTime<Utc>,
    ) -> Result<bool, TrackError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM location_history
                WHERE buggy_id = $1 AND recorded_at > $2
            )
            "#,
        )
        .bind(buggy_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn append_history(
        &self,
        buggy_id: i64,
        driver_id: i64,
        latitude: f64,
        longitude: f64,
    ) -> Result<(), TrackError> {
        sqlx::query(
            r#"
            INSERT INTO location_history (buggy_id, driver_id, latitude, longitude)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(buggy_id)
        .bind(driver_id)
        .bind(latitude)
        .bind(longitude)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_live_location(&self, buggy_id: i64) -> Result<(), TrackError> {
        sqlx::query("DELETE FROM buggy_locations WHERE buggy_id = $1")
            .bind(buggy_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn running_live_locations(&self) -> Result<Vec<LiveLocationRow>, TrackError> {
        let rows: Vec<LiveLocationRow> = sqlx::query_as(
            r#"
            SELECT b.number_plate AS buggy_number,
                   l.latitude, l.longitude, l.direction,
                   u.username AS driver_name,
                   l.last_updated
            FROM buggy_locations l
            JOIN buggies b ON b.id = l.buggy_id
            LEFT JOIN users u ON u.id = b.assigned_driver
            WHERE b.is_running = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn history_since(
        &self,
        buggy_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistoryPoint>, TrackError> {
        let rows: Vec<HistoryPoint> = sqlx::query_as(
            r#"
            SELECT latitude, longitude, recorded_at AS timestamp
            FROM location_history
            WHERE buggy_id = $1 AND recorded_at >= $2
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(buggy_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn running_buggies(&self) -> Result<Vec<Buggy>, TrackError> {
        let rows: Vec<Buggy> = sqlx::query_as(
            r#"
            SELECT id, number_plate, capacity, assigned_driver, is_running
            FROM buggies WHERE is_running = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn set_running(&self, buggy_id: i64, running: bool) -> Result<Option<Buggy>, TrackError> {
        let row: Option<Buggy> = sqlx::query_as(
            r#"
            UPDATE buggies SET is_running = $2
            WHERE id = $1
            RETURNING id, number_plate, capacity, assigned_driver, is_running
            "#,
        )
        .bind(buggy_id)
        .bind(running)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

/// Raw row shape for the token join; role arrives as text.
#[derive(sqlx::FromRow)]
struct TokenRow {
    user_id: i64,
    username: String,
    role: String,
    is_active: bool,
    created_at: DateTime<Utc>,
}

#[async_trait]
impl TokenStore for PgStore {
    async fn lookup_token(&self, key: &str) -> Result<Option<TokenRecord>, TrackError> {
        let row: Option<TokenRow> = sqlx::query_as(
            r#"
            SELECT u.id AS user_id, u.username, u.role, u.is_active, t.created_at
            FROM auth_tokens t
            JOIN users u ON u.id = t.user_id
            WHERE t.key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| TokenRecord {
            user_id: r.user_id,
            username: r.username,
            role: Role::parse(&r.role),
            is_active: r.is_active,
            created_at: r.created_at,
        }))
    }

    async fn delete_token(&self, key: &str) -> Result<(), TrackError> {
        sqlx::query("DELETE FROM auth_tokens WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
