//! The balance ledger.
//!
//! Every balance mutation happens here and nowhere else, always inside a
//! transaction holding the account row lock, always journaled by a
//! `ledger_entries` row. The unique constraint on `(account_id, ref)` is
//! the single source of truth for "has this reference been applied": a
//! second attempt with the same ref is absorbed as an idempotent no-op
//! that reports the already-applied state.

use async_trait::async_trait;
use uuid::Uuid;

use super::{PgStore, StoreError, is_unique_violation};
use crate::money::Money;

/// Kinds of ledger entry. `charge` rows carry negative amounts, the other
/// two positive; Σ(amounts) per account equals the account balance at
/// every commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum EntryKind {
    Deposit,
    Charge,
    Refund,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Deposit => "deposit",
            EntryKind::Charge => "charge",
            EntryKind::Refund => "refund",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("unknown account")]
    UnknownAccount,
    #[error("balance arithmetic failed: {0}")]
    Arithmetic(#[from] crate::money::MoneyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Store(StoreError::Database(err))
    }
}

/// Outcome of a debit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    /// The balance was reduced and a charge entry journaled.
    Applied { new_balance: Money },
    /// The ref had already been charged; nothing changed.
    AlreadyApplied { balance: Money },
}

/// Outcome of a credit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Applied { new_balance: Money },
    AlreadyApplied { balance: Money },
}

#[async_trait]
pub trait LedgerOps: Send + Sync {
    /// Atomically debits `amount` if the balance covers it, journaling a
    /// charge entry under `reference`. Concurrent callers serialize on the
    /// account row lock; a duplicate reference cannot debit twice.
    async fn debit_if_sufficient(
        &self,
        account_id: Uuid,
        amount: Money,
        reference: &str,
    ) -> Result<DebitOutcome, LedgerError>;

    /// Credits `amount` under `reference`; replaying the same reference is
    /// a no-op that reports current state.
    async fn credit(
        &self,
        account_id: Uuid,
        amount: Money,
        reference: &str,
        kind: EntryKind,
    ) -> Result<CreditOutcome, LedgerError>;

    /// Inverse credit referencing an earlier charge.
    async fn refund(
        &self,
        account_id: Uuid,
        charge_reference: &str,
        amount: Money,
    ) -> Result<CreditOutcome, LedgerError>;

    async fn balance(&self, account_id: Uuid) -> Result<Money, LedgerError>;
}

impl PgStore {
    async fn locked_balance(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        account_id: Uuid,
    ) -> Result<Money, LedgerError> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(account_id)
                .fetch_optional(&mut **tx)
                .await?;
        let micros = balance.ok_or(LedgerError::UnknownAccount)?;
        Money::from_micros(micros).map_err(LedgerError::Arithmetic)
    }

    async fn current_balance(&self, account_id: Uuid) -> Result<Money, LedgerError> {
        let balance: Option<i64> = sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(self.pool())
            .await?;
        let micros = balance.ok_or(LedgerError::UnknownAccount)?;
        Money::from_micros(micros).map_err(LedgerError::Arithmetic)
    }

}

#[async_trait]
impl LedgerOps for PgStore {
    async fn debit_if_sufficient(
        &self,
        account_id: Uuid,
        amount: Money,
        reference: &str,
    ) -> Result<DebitOutcome, LedgerError> {
        let mut tx = self.pool().begin().await?;
        let balance = Self::locked_balance(&mut tx, account_id).await?;
        if balance < amount {
            return Err(LedgerError::InsufficientFunds);
        }
        let new_balance = balance.checked_sub(amount)?;
        sqlx::query("UPDATE accounts SET balance = $1 WHERE id = $2")
            .bind(new_balance.micros())
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        let inserted = sqlx::query(
            "INSERT INTO ledger_entries (id, account_id, amount, kind, ref) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(-amount.micros())
        .bind(EntryKind::Charge.as_str())
        .bind(reference)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {
                tx.commit().await?;
                tracing::debug!(%account_id, reference, amount = %amount, "ledger debit applied");
                Ok(DebitOutcome::Applied { new_balance })
            }
            Err(err) if is_unique_violation(&err) => {
                drop(tx);
                let balance = self.current_balance(account_id).await?;
                Ok(DebitOutcome::AlreadyApplied { balance })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn credit(
        &self,
        account_id: Uuid,
        amount: Money,
        reference: &str,
        kind: EntryKind,
    ) -> Result<CreditOutcome, LedgerError> {
        let mut tx = self.pool().begin().await?;
        let balance = Self::locked_balance(&mut tx, account_id).await?;
        let new_balance = balance.checked_add(amount)?;
        sqlx::query("UPDATE accounts SET balance = $1 WHERE id = $2")
            .bind(new_balance.micros())
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        let inserted = sqlx::query(
            "INSERT INTO ledger_entries (id, account_id, amount, kind, ref) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(amount.micros())
        .bind(kind.as_str())
        .bind(reference)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {
                tx.commit().await?;
                tracing::debug!(%account_id, reference, amount = %amount, kind = kind.as_str(), "ledger credit applied");
                Ok(CreditOutcome::Applied { new_balance })
            }
            Err(err) if is_unique_violation(&err) => {
                drop(tx);
                let balance = self.current_balance(account_id).await?;
                Ok(CreditOutcome::AlreadyApplied { balance })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn refund(
        &self,
        account_id: Uuid,
        charge_reference: &str,
        amount: Money,
    ) -> Result<CreditOutcome, LedgerError> {
        let reference = format!("refund:{charge_reference}");
        self.credit(account_id, amount, &reference, EntryKind::Refund)
            .await
    }

    async fn balance(&self, account_id: Uuid) -> Result<Money, LedgerError> {
        self.current_balance(account_id).await
    }
}
