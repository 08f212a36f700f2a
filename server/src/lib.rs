//! buggyd — real-time campus shuttle tracking.
//!
//! Drivers push position updates over a persistent WebSocket; viewers
//! receive them as they happen via group fan-out. A throttled trail is
//! retained for history queries. Library form so the handler paths can
//! be exercised from integration tests.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod registry;
pub mod state;
pub mod store;
pub mod types;
pub mod ws;
