//! Deposit rows and their state machine.
//!
//! A deposit is a funding intent. It transitions exactly once out of
//! `pending`, and only under webhook authority: `complete` credits the
//! ledger with the net amount, `fail` does not touch the ledger. Both are
//! idempotent; re-invocation in a terminal state returns the current row
//! without side effects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::ledger::{EntryKind, LedgerError};
use super::{PgStore, StoreError};
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum DepositStatus {
    Pending,
    Completed,
    Failed,
}

impl DepositStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DepositStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Completed => "completed",
            DepositStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Deposit {
    pub id: Uuid,
    pub account_id: Uuid,
    pub provider: String,
    pub network: Option<String>,
    pub gross_amount: Money,
    pub fee_amount: Money,
    pub net_amount: Money,
    pub status: DepositStatus,
    pub provider_session_id: Option<String>,
    pub failure_reason: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum DepositError {
    #[error("deposit not found")]
    NotFound,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for DepositError {
    fn from(err: sqlx::Error) -> Self {
        DepositError::Store(StoreError::Database(err))
    }
}

pub struct NewDeposit {
    pub account_id: Uuid,
    pub provider: String,
    pub network: Option<String>,
    pub gross_amount: Money,
    pub fee_amount: Money,
    pub net_amount: Money,
    pub metadata: Value,
}

#[async_trait]
pub trait DepositOps: Send + Sync {
    async fn create_deposit(&self, new: NewDeposit) -> Result<Deposit, DepositError>;

    /// Late-binds the provider session id once the provider has one.
    async fn bind_provider_session(
        &self,
        deposit_id: Uuid,
        session_id: &str,
    ) -> Result<Deposit, DepositError>;

    async fn deposit(&self, deposit_id: Uuid) -> Result<Deposit, DepositError>;

    async fn deposit_by_session(&self, session_id: &str) -> Result<Deposit, DepositError>;

    async fn list_deposits(&self, account_id: Uuid, limit: i64)
    -> Result<Vec<Deposit>, DepositError>;

    /// pending → completed, crediting the ledger with the net amount. The
    /// `(account_id, "deposit:<id>")` uniqueness on ledger entries makes a
    /// double credit impossible even if two transitions race past the row
    /// lock somehow.
    async fn complete_deposit(&self, deposit_id: Uuid) -> Result<Deposit, DepositError>;

    /// pending → failed. Never touches the ledger.
    async fn fail_deposit(&self, deposit_id: Uuid, reason: &str) -> Result<Deposit, DepositError>;
}

#[async_trait]
impl DepositOps for PgStore {
    async fn create_deposit(&self, new: NewDeposit) -> Result<Deposit, DepositError> {
        let deposit = sqlx::query_as::<_, Deposit>(
            "INSERT INTO deposits \
             (id, account_id, provider, network, gross_amount, fee_amount, net_amount, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(new.account_id)
        .bind(&new.provider)
        .bind(&new.network)
        .bind(new.gross_amount.micros())
        .bind(new.fee_amount.micros())
        .bind(new.net_amount.micros())
        .bind(&new.metadata)
        .fetch_one(self.pool())
        .await?;
        Ok(deposit)
    }

    async fn bind_provider_session(
        &self,
        deposit_id: Uuid,
        session_id: &str,
    ) -> Result<Deposit, DepositError> {
        sqlx::query_as::<_, Deposit>(
            "UPDATE deposits SET provider_session_id = $1 WHERE id = $2 RETURNING *",
        )
        .bind(session_id)
        .bind(deposit_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or(DepositError::NotFound)
    }

    async fn deposit(&self, deposit_id: Uuid) -> Result<Deposit, DepositError> {
        sqlx::query_as::<_, Deposit>("SELECT * FROM deposits WHERE id = $1")
            .bind(deposit_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(DepositError::NotFound)
    }

    async fn deposit_by_session(&self, session_id: &str) -> Result<Deposit, DepositError> {
        sqlx::query_as::<_, Deposit>("SELECT * FROM deposits WHERE provider_session_id = $1")
            .bind(session_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(DepositError::NotFound)
    }

    async fn list_deposits(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Deposit>, DepositError> {
        let deposits = sqlx::query_as::<_, Deposit>(
            "SELECT * FROM deposits WHERE account_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(deposits)
    }

    async fn complete_deposit(&self, deposit_id: Uuid) -> Result<Deposit, DepositError> {
        // The credit and the status flip commit together: a crash between
        // them must not leave a completed deposit that never credited.
        let mut tx = self.pool().begin().await?;
        let deposit = sqlx::query_as::<_, Deposit>(
            "SELECT * FROM deposits WHERE id = $1 FOR UPDATE",
        )
        .bind(deposit_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(DepositError::NotFound)?;
        if deposit.status.is_terminal() {
            return Ok(deposit);
        }
        let balance: i64 = sqlx::query_scalar(
            "SELECT balance FROM accounts WHERE id = $1 FOR UPDATE",
        )
        .bind(deposit.account_id)
        .fetch_one(&mut *tx)
        .await?;
        let new_balance = Money::from_micros(balance)
            .and_then(|b| b.checked_add(deposit.net_amount))
            .map_err(LedgerError::Arithmetic)?;
        sqlx::query("UPDATE accounts SET balance = $1 WHERE id = $2")
            .bind(new_balance.micros())
            .bind(deposit.account_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO ledger_entries (id, account_id, amount, kind, ref) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(deposit.account_id)
        .bind(deposit.net_amount.micros())
        .bind(EntryKind::Deposit.as_str())
        .bind(format!("deposit:{deposit_id}"))
        .execute(&mut *tx)
        .await?;
        let completed = sqlx::query_as::<_, Deposit>(
            "UPDATE deposits SET status = 'completed', completed_at = now() \
             WHERE id = $1 RETURNING *",
        )
        .bind(deposit_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::info!(
            deposit_id = %deposit_id,
            account_id = %deposit.account_id,
            net = %deposit.net_amount,
            "deposit completed"
        );
        Ok(completed)
    }

    async fn fail_deposit(&self, deposit_id: Uuid, reason: &str) -> Result<Deposit, DepositError> {
        let mut tx = self.pool().begin().await?;
        let deposit =
            sqlx::query_as::<_, Deposit>("SELECT * FROM deposits WHERE id = $1 FOR UPDATE")
                .bind(deposit_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(DepositError::NotFound)?;
        if deposit.status.is_terminal() {
            return Ok(deposit);
        }
        let failed = sqlx::query_as::<_, Deposit>(
            "UPDATE deposits SET status = 'failed', failure_reason = $1, completed_at = now() \
             WHERE id = $2 RETURNING *",
        )
        .bind(reason)
        .bind(deposit_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::info!(deposit_id = %deposit_id, reason, "deposit failed");
        Ok(failed)
    }
}
