//! Cashback loyalty ledger: geofenced purchases, redemptions, and the
//! metrics computed from them.

mod api;
pub mod config;
pub mod error;
pub mod geofence;
pub mod ledger;
pub mod metrics;
mod responses;
pub mod segment;
pub mod store;
pub mod types;

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
pub use api::{AppState, init_router};
pub use config::Config;
pub use error::LedgerError;
pub use geofence::GeofenceValidator;
pub use ledger::Ledger;
pub use metrics::MetricsAggregator;
use sqlx::{PgPool, postgres::PgPoolOptions};
use store::{LedgerStore, MemoryStore, PgStore};
use tracing::info;

/// Initializes the database pool.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}

/// Wires the ledger and metrics pipeline over the configured store.
pub async fn init_state(config: Config) -> Result<AppState> {
    let store: Arc<dyn LedgerStore> = match &config.database_url {
        Some(url) => {
            info!("using postgres store");
            Arc::new(PgStore::new(
                init_pool(url, config.database_max_connections).await?,
            ))
        }
        None => {
            info!("DATABASE_URL not set, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(state_with_store(config, store))
}

pub fn state_with_store(config: Config, store: Arc<dyn LedgerStore>) -> AppState {
    let ledger = Ledger::new(
        Arc::clone(&store),
        GeofenceValidator::default(),
        config.cashback_rate,
    );
    AppState {
        ledger: Arc::new(ledger),
        metrics: Arc::new(MetricsAggregator::new(store)),
        config,
    }
}
