//! Shared server state — stores, group registry, config.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::registry::Registry;
use crate::store::{PgStore, TokenStore, TrackingStore};

/// Shared state accessible from all handlers.
pub struct AppState {
    pub tracking: Arc<dyn TrackingStore>,
    pub tokens: Arc<dyn TokenStore>,
    /// Channel membership and fan-out for live connections.
    pub registry: Registry,
    pub config: Config,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Arc<Self> {
        let store = Arc::new(PgStore::new(pool));
        Self::with_stores(store.clone(), store, config)
    }

    /// Build state over explicit store implementations. Production uses
    /// `PgStore` for both; tests substitute in-memory doubles.
    pub fn with_stores(
        tracking: Arc<dyn TrackingStore>,
        tokens: Arc<dyn TokenStore>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracking,
            tokens,
            registry: Registry::new(),
            config,
        })
    }
}
