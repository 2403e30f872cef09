//! Usage log: append-only record of successful billed calls.
//!
//! Writes are best-effort and never block the response path; billing
//! correctness rests on the ledger and payment transactions, not on this
//! table. Reads feed the account usage endpoints.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{PgStore, StoreError};
use crate::money::Money;

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub account_id: Option<Uuid>,
    pub route: String,
    pub request_id: Uuid,
    pub price: Money,
    pub latency_ms: i64,
    pub decision: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UsageLogRow {
    pub id: Uuid,
    pub account_id: Option<Uuid>,
    pub route: String,
    pub request_id: Uuid,
    pub price: Money,
    pub latency_ms: i64,
    pub decision: String,
    pub created_at: DateTime<Utc>,
}

/// One aggregate bucket: a (day, route) pair.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UsageBucket {
    pub day: NaiveDate,
    pub route: String,
    pub calls: i64,
    pub total_price: i64,
    pub avg_latency_ms: f64,
}

#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<(), StoreError>;

    async fn recent(&self, account_id: Uuid, limit: i64) -> Result<Vec<UsageLogRow>, StoreError>;

    /// Per-day, per-route aggregates over the trailing `days`.
    async fn stats(&self, account_id: Uuid, days: i64) -> Result<Vec<UsageBucket>, StoreError>;
}

#[async_trait]
impl UsageRecorder for PgStore {
    async fn record(&self, record: UsageRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO usage_logs (id, account_id, route, request_id, price, latency_ms, decision) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(Uuid::new_v4())
        .bind(record.account_id)
        .bind(&record.route)
        .bind(record.request_id)
        .bind(record.price.micros())
        .bind(record.latency_ms)
        .bind(&record.decision)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn recent(&self, account_id: Uuid, limit: i64) -> Result<Vec<UsageLogRow>, StoreError> {
        let rows = sqlx::query_as::<_, UsageLogRow>(
            "SELECT * FROM usage_logs WHERE account_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    async fn stats(&self, account_id: Uuid, days: i64) -> Result<Vec<UsageBucket>, StoreError> {
        let rows = sqlx::query_as::<_, UsageBucket>(
            "SELECT date(created_at) AS day, route, \
                    count(*) AS calls, \
                    coalesce(sum(price), 0)::BIGINT AS total_price, \
                    coalesce(avg(latency_ms), 0)::DOUBLE PRECISION AS avg_latency_ms \
             FROM usage_logs \
             WHERE account_id = $1 AND created_at >= now() - ($2 || ' days')::interval \
             GROUP BY day, route \
             ORDER BY day DESC, route",
        )
        .bind(account_id)
        .bind(days.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
