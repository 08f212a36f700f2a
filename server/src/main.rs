//! buggyd — campus shuttle tracking server.
//!
//! WebSocket tracking core + REST read surface over Postgres.

use axum::routing::{get, post};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use buggyd::{api, config, state, ws};

#[tokio::main]
async fn main() {
    // Load .env if present (local dev).
    let _ = dotenvy::dotenv();

    let config = config::Config::from_env();

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(true)
        .init();

    info!("buggyd starting");
    info!(listen = %config.listen_addr, cookie = %config.auth_cookie_name);

    // ── Postgres ────────────────────────────────────────────
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to Postgres");

    // Run migration.
    info!("running migrations");
    sqlx::query(include_str!("../migrations/001_init.sql"))
        .execute(&pool)
        .await
        .unwrap_or_else(|e| {
            // Migration may fail if tables exist — that's fine on restart.
            info!("migration note (may already exist): {e}");
            Default::default()
        });

    info!("database ready");

    // ── Shared state ────────────────────────────────────────
    let state = state::AppState::new(pool, config.clone());

    // ── Routes ──────────────────────────────────────────────
    let app = Router::new()
        // WebSocket tracking endpoint.
        .route("/ws/location/updates", get(ws::ws_handler))
        // REST read surface.
        .route("/api/tracking/live-location", get(api::live_location))
        .route("/api/tracking/location-history", get(api::location_history))
        .route("/api/tracking/available-buggies", get(api::available_buggies))
        .route("/api/tracking/update-buggy-status", post(api::update_buggy_status))
        .route("/api/tracking/assigned-buggy", get(api::assigned_buggy))
        // Health check (useful for K8s liveness probes).
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        // Browser dashboards ride on cookies from another origin.
        .layer(CorsLayer::permissive())
        .with_state(state);

    // ── Bind & serve ────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind");

    info!(addr = %config.listen_addr, "buggyd listening");

    axum::serve(listener, app)
        .await
        .expect("server error");
}

/// Liveness probe.
async fn healthz() -> &'static str {
    "ok"
}
