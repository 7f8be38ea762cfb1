//! Persistence layer: PostgreSQL ledger and stores, plus the shared Redis
//! handle.
//!
//! The PostgreSQL types implement the same traits as the in-memory
//! backends ([`crate::ledger::Ledger`], [`crate::idempotency::IdempotencyStore`],
//! [`crate::retry::DeadLetterStore`], [`crate::worker::content::ContentStore`]),
//! so `main` picks one or the other from configuration.

pub mod models;
pub mod postgres;
pub mod redis;
pub mod stores;

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::GatewayConfig;
use crate::error::GatewayError;

pub use postgres::PostgresLedger;
pub use redis::RedisHandle;
pub use stores::{PostgresContentStore, PostgresDeadLetterStore, PostgresIdempotencyStore};

/// Opens the PostgreSQL pool described by the configuration.
///
/// # Errors
///
/// Returns [`GatewayError::PersistenceError`] if no connection can be made.
pub async fn connect(config: &GatewayConfig) -> Result<PgPool, GatewayError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .min_connections(config.database_min_connections)
        .acquire_timeout(Duration::from_secs(config.database_connect_timeout_secs))
        .connect(&config.database_url)
        .await
        .map_err(|e| GatewayError::PersistenceError(e.to_string()))?;
    tracing::info!(
        max_connections = config.database_max_connections,
        "database pool ready"
    );
    Ok(pool)
}

/// Applies the bundled schema migrations.
///
/// # Errors
///
/// Returns [`GatewayError::PersistenceError`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), GatewayError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| GatewayError::PersistenceError(format!("migration failed: {e}")))?;
    tracing::info!("database migrations applied");
    Ok(())
}
