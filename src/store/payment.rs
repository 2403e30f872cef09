//! Payment transaction rows: the durable half of the paid-request
//! pipeline.
//!
//! One row per billable unit of work, keyed by request id, with a unique
//! fingerprint collapsing every arrival of the same logical request onto
//! one row. The unique-insert is the concurrency gate: the winner drives
//! the pipeline, losers read the winner's row and either replay its stored
//! result or report the request as in flight.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{PgStore, StoreError, is_unique_violation};
use crate::money::Money;

/// Pipeline phase. Transitions are monotonic; `executed`, `settled`,
/// `pending_settle`, `failed` and `refunded` are the observable outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentPhase {
    Held,
    Verified,
    Executing,
    Executed,
    Settled,
    PendingSettle,
    Failed,
    Refunded,
}

impl PaymentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentPhase::Held => "held",
            PaymentPhase::Verified => "verified",
            PaymentPhase::Executing => "executing",
            PaymentPhase::Executed => "executed",
            PaymentPhase::Settled => "settled",
            PaymentPhase::PendingSettle => "pending_settle",
            PaymentPhase::Failed => "failed",
            PaymentPhase::Refunded => "refunded",
        }
    }

    /// Whether execution has committed: from here on the charge is never
    /// rescinded and arrivals replay the stored result.
    pub fn has_result(&self) -> bool {
        matches!(
            self,
            PaymentPhase::Executed | PaymentPhase::Settled | PaymentPhase::PendingSettle
        )
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentTransaction {
    pub request_id: Uuid,
    pub fingerprint: String,
    pub route: String,
    pub price: Money,
    pub payer: String,
    pub account_id: Option<Uuid>,
    pub phase: PaymentPhase,
    pub attempt_count: i32,
    pub verified_at: Option<DateTime<Utc>>,
    pub payment_payload: Option<Value>,
    pub result: Option<Value>,
    pub receipt: Option<Value>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentStoreError {
    #[error("payment transaction not found")]
    NotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for PaymentStoreError {
    fn from(err: sqlx::Error) -> Self {
        PaymentStoreError::Store(StoreError::Database(err))
    }
}

pub struct NewPaymentTransaction {
    pub request_id: Uuid,
    pub fingerprint: String,
    pub route: String,
    pub price: Money,
    pub payer: String,
    pub account_id: Option<Uuid>,
    /// Original header payload, kept for out-of-band settle retries.
    pub payment_payload: Option<Value>,
}

/// Result of the unique-insert race on the fingerprint.
#[derive(Debug)]
pub enum HoldOutcome {
    /// This arrival owns the pipeline for its fingerprint.
    Held(PaymentTransaction),
    /// Another arrival got there first; here is its row.
    Existing(PaymentTransaction),
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// ARRIVE → HELD. Inserting the fingerprint is the advisory lock: at
    /// most one row per fingerprint can ever exist.
    async fn hold(&self, new: NewPaymentTransaction) -> Result<HoldOutcome, PaymentStoreError>;

    async fn mark_verified(&self, request_id: Uuid) -> Result<(), PaymentStoreError>;

    async fn mark_executing(&self, request_id: Uuid) -> Result<(), PaymentStoreError>;

    /// Persists the execution result, entering `executed`. Must succeed
    /// before settlement; a failure here is treated as a failed execution.
    async fn store_result(&self, request_id: Uuid, result: &Value)
    -> Result<(), PaymentStoreError>;

    async fn mark_settled(&self, request_id: Uuid, receipt: &Value)
    -> Result<(), PaymentStoreError>;

    /// Parks the transaction for out-of-band settlement retry.
    async fn mark_pending_settle(
        &self,
        request_id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), PaymentStoreError>;

    async fn mark_failed(&self, request_id: Uuid) -> Result<(), PaymentStoreError>;

    async fn mark_refunded(&self, request_id: Uuid) -> Result<(), PaymentStoreError>;

    /// Pending-settle rows whose retry time has come, oldest first.
    async fn due_pending_settles(
        &self,
        limit: i64,
    ) -> Result<Vec<PaymentTransaction>, PaymentStoreError>;

    /// Bumps the attempt counter and reschedules a retry.
    async fn reschedule_settle(
        &self,
        request_id: Uuid,
        delay: ChronoDuration,
    ) -> Result<(), PaymentStoreError>;
}

impl PgStore {
    async fn set_phase(&self, request_id: Uuid, phase: PaymentPhase) -> Result<(), PaymentStoreError> {
        let updated = sqlx::query(
            "UPDATE payment_transactions SET phase = $1, updated_at = now() WHERE request_id = $2",
        )
        .bind(phase.as_str())
        .bind(request_id)
        .execute(self.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(PaymentStoreError::NotFound);
        }
        tracing::info!(%request_id, phase = phase.as_str(), "payment transaction phase");
        Ok(())
    }
}

#[async_trait]
impl PaymentStore for PgStore {
    async fn hold(&self, new: NewPaymentTransaction) -> Result<HoldOutcome, PaymentStoreError> {
        let inserted = sqlx::query_as::<_, PaymentTransaction>(
            "INSERT INTO payment_transactions \
             (request_id, fingerprint, route, price, payer, account_id, payment_payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
        )
        .bind(new.request_id)
        .bind(&new.fingerprint)
        .bind(&new.route)
        .bind(new.price.micros())
        .bind(&new.payer)
        .bind(new.account_id)
        .bind(&new.payment_payload)
        .fetch_one(self.pool())
        .await;
        match inserted {
            Ok(row) => {
                tracing::info!(request_id = %row.request_id, phase = "held", route = %row.route, "payment transaction phase");
                Ok(HoldOutcome::Held(row))
            }
            Err(err) if is_unique_violation(&err) => {
                let existing = sqlx::query_as::<_, PaymentTransaction>(
                    "SELECT * FROM payment_transactions \
                     WHERE fingerprint = $1 OR request_id = $2",
                )
                .bind(&new.fingerprint)
                .bind(new.request_id)
                .fetch_optional(self.pool())
                .await?
                .ok_or(PaymentStoreError::NotFound)?;
                Ok(HoldOutcome::Existing(existing))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn mark_verified(&self, request_id: Uuid) -> Result<(), PaymentStoreError> {
        let updated = sqlx::query(
            "UPDATE payment_transactions \
             SET phase = 'verified', verified_at = now(), updated_at = now() \
             WHERE request_id = $1",
        )
        .bind(request_id)
        .execute(self.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(PaymentStoreError::NotFound);
        }
        tracing::info!(%request_id, phase = "verified", "payment transaction phase");
        Ok(())
    }

    async fn mark_executing(&self, request_id: Uuid) -> Result<(), PaymentStoreError> {
        self.set_phase(request_id, PaymentPhase::Executing).await
    }

    async fn store_result(
        &self,
        request_id: Uuid,
        result: &Value,
    ) -> Result<(), PaymentStoreError> {
        let updated = sqlx::query(
            "UPDATE payment_transactions \
             SET phase = 'executed', result = $1, updated_at = now() \
             WHERE request_id = $2",
        )
        .bind(result)
        .bind(request_id)
        .execute(self.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(PaymentStoreError::NotFound);
        }
        tracing::info!(%request_id, phase = "executed", "payment transaction phase");
        Ok(())
    }

    async fn mark_settled(
        &self,
        request_id: Uuid,
        receipt: &Value,
    ) -> Result<(), PaymentStoreError> {
        let updated = sqlx::query(
            "UPDATE payment_transactions \
             SET phase = 'settled', receipt = $1, next_retry_at = NULL, updated_at = now() \
             WHERE request_id = $2",
        )
        .bind(receipt)
        .bind(request_id)
        .execute(self.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(PaymentStoreError::NotFound);
        }
        tracing::info!(%request_id, phase = "settled", "payment transaction phase");
        Ok(())
    }

    async fn mark_pending_settle(
        &self,
        request_id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), PaymentStoreError> {
        let updated = sqlx::query(
            "UPDATE payment_transactions \
             SET phase = 'pending_settle', next_retry_at = $1, updated_at = now() \
             WHERE request_id = $2",
        )
        .bind(next_retry_at)
        .bind(request_id)
        .execute(self.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(PaymentStoreError::NotFound);
        }
        tracing::info!(%request_id, phase = "pending_settle", "payment transaction phase");
        Ok(())
    }

    async fn mark_failed(&self, request_id: Uuid) -> Result<(), PaymentStoreError> {
        self.set_phase(request_id, PaymentPhase::Failed).await
    }

    async fn mark_refunded(&self, request_id: Uuid) -> Result<(), PaymentStoreError> {
        self.set_phase(request_id, PaymentPhase::Refunded).await
    }

    async fn due_pending_settles(
        &self,
        limit: i64,
    ) -> Result<Vec<PaymentTransaction>, PaymentStoreError> {
        let rows = sqlx::query_as::<_, PaymentTransaction>(
            "SELECT * FROM payment_transactions \
             WHERE phase = 'pending_settle' AND next_retry_at <= now() \
             ORDER BY next_retry_at ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    async fn reschedule_settle(
        &self,
        request_id: Uuid,
        delay: ChronoDuration,
    ) -> Result<(), PaymentStoreError> {
        let next = Utc::now() + delay;
        let updated = sqlx::query(
            "UPDATE payment_transactions \
             SET attempt_count = attempt_count + 1, next_retry_at = $1, updated_at = now() \
             WHERE request_id = $2",
        )
        .bind(next)
        .bind(request_id)
        .execute(self.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(PaymentStoreError::NotFound);
        }
        Ok(())
    }
}
