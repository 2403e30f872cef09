//! Account rows.
//!
//! Balance mutation is the ledger's job; this module only creates, reads
//! and annotates accounts (status, wallets, login stamps).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use super::{PgStore, StoreError, is_unique_violation};
use crate::money::Money;
use crate::proto::Network;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Suspended,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub account_number: String,
    pub email: String,
    pub status: AccountStatus,
    pub balance: Money,
    /// Map of network name to wallet address.
    pub wallets: Value,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Wallet addresses keyed by parsed network; entries with unknown
    /// network names are skipped rather than failing the whole read.
    pub fn wallet_map(&self) -> HashMap<Network, String> {
        let Some(object) = self.wallets.as_object() else {
            return HashMap::new();
        };
        object
            .iter()
            .filter_map(|(network, address)| {
                let network = network.parse::<Network>().ok()?;
                let address = address.as_str()?.to_string();
                Some((network, address))
            })
            .collect()
    }

    /// Human-facing 16-digit number, grouped in fours.
    pub fn display_number(&self) -> String {
        self.account_number
            .as_bytes()
            .chunks(4)
            .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("-")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("account not found")]
    NotFound,
    #[error("email already registered")]
    DuplicateEmail,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for AccountError {
    fn from(err: sqlx::Error) -> Self {
        AccountError::Store(StoreError::Database(err))
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn create_account(
        &self,
        email: &str,
        account_number: &str,
    ) -> Result<Account, AccountError>;

    async fn account(&self, id: Uuid) -> Result<Account, AccountError>;

    /// Replaces the wallet map. Addresses are validated by the caller.
    async fn set_wallets(
        &self,
        id: Uuid,
        wallets: &HashMap<Network, String>,
    ) -> Result<Account, AccountError>;
}

#[async_trait]
impl AccountStore for PgStore {
    async fn create_account(
        &self,
        email: &str,
        account_number: &str,
    ) -> Result<Account, AccountError> {
        let created = sqlx::query_as::<_, Account>(
            "INSERT INTO accounts (id, account_number, email) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(account_number)
        .bind(email)
        .fetch_one(self.pool())
        .await;
        match created {
            Ok(account) => Ok(account),
            Err(err) if is_unique_violation(&err) => Err(AccountError::DuplicateEmail),
            Err(err) => Err(err.into()),
        }
    }

    async fn account(&self, id: Uuid) -> Result<Account, AccountError> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(AccountError::NotFound)
    }

    async fn set_wallets(
        &self,
        id: Uuid,
        wallets: &HashMap<Network, String>,
    ) -> Result<Account, AccountError> {
        let json: Value = wallets
            .iter()
            .map(|(network, address)| (network.to_string(), Value::String(address.clone())))
            .collect::<serde_json::Map<_, _>>()
            .into();
        sqlx::query_as::<_, Account>(
            "UPDATE accounts SET wallets = $1 WHERE id = $2 RETURNING *",
        )
        .bind(json)
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .ok_or(AccountError::NotFound)
    }
}
