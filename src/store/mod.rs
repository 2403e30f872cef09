//! Postgres persistence.
//!
//! The database is the only durable shared state in the service; every
//! concurrency invariant is expressed as a row lock or a unique constraint
//! here rather than as in-process synchronization. One [`PgStore`] wraps
//! the pool and implements the per-subsystem traits (`LedgerOps`,
//! `PaymentStore`, …) that the rest of the crate depends on.

pub mod account;
pub mod apikey;
pub mod deposit;
pub mod ledger;
pub mod payment;
pub mod usage;
pub mod webhook;

use sqlx::postgres::{PgPool, PgPoolOptions};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Whether an error is the unique-constraint idempotency signal rather
/// than a real failure.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects the pool and applies embedded migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip liveness probe for the readiness endpoint.
    pub async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
