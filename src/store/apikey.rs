//! API key rows.
//!
//! Secrets never touch the database: only the SHA-256 hex hash is stored,
//! plus a short prefix for log correlation. The per-account cap is
//! enforced under the account row lock so two concurrent mints cannot both
//! squeeze under the limit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{PgStore, StoreError};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub key_hash: String,
    pub key_prefix: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiKeyError {
    #[error("api key not found")]
    NotFound,
    #[error("active key limit reached")]
    CapReached,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for ApiKeyError {
    fn from(err: sqlx::Error) -> Self {
        ApiKeyError::Store(StoreError::Database(err))
    }
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRow>, ApiKeyError>;

    /// Inserts a new key if the account is under `cap` active keys,
    /// holding the account row lock across the count and the insert.
    async fn insert_key(
        &self,
        account_id: Uuid,
        key_hash: &str,
        key_prefix: &str,
        cap: i64,
    ) -> Result<ApiKeyRow, ApiKeyError>;

    async fn revoke_key(&self, account_id: Uuid, key_id: Uuid) -> Result<(), ApiKeyError>;

    /// Fire-and-forget usage stamp; callers spawn this off the request
    /// path.
    async fn touch_last_used(&self, key_id: Uuid) -> Result<(), ApiKeyError>;

    async fn list_keys(&self, account_id: Uuid) -> Result<Vec<ApiKeyRow>, ApiKeyError>;
}

#[async_trait]
impl ApiKeyStore for PgStore {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRow>, ApiKeyError> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT * FROM api_keys WHERE key_hash = $1 AND active AND revoked_at IS NULL",
        )
        .bind(key_hash)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    async fn insert_key(
        &self,
        account_id: Uuid,
        key_hash: &str,
        key_prefix: &str,
        cap: i64,
    ) -> Result<ApiKeyRow, ApiKeyError> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("SELECT id FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        let active: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM api_keys WHERE account_id = $1 AND active",
        )
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await?;
        if active >= cap {
            return Err(ApiKeyError::CapReached);
        }
        let row = sqlx::query_as::<_, ApiKeyRow>(
            "INSERT INTO api_keys (id, account_id, key_hash, key_prefix) \
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(key_hash)
        .bind(key_prefix)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn revoke_key(&self, account_id: Uuid, key_id: Uuid) -> Result<(), ApiKeyError> {
        let updated = sqlx::query(
            "UPDATE api_keys SET active = FALSE, revoked_at = now() \
             WHERE id = $1 AND account_id = $2 AND active",
        )
        .bind(key_id)
        .bind(account_id)
        .execute(self.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(ApiKeyError::NotFound);
        }
        Ok(())
    }

    async fn touch_last_used(&self, key_id: Uuid) -> Result<(), ApiKeyError> {
        sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE id = $1")
            .bind(key_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn list_keys(&self, account_id: Uuid) -> Result<Vec<ApiKeyRow>, ApiKeyError> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT * FROM api_keys WHERE account_id = $1 ORDER BY created_at DESC",
        )
        .bind(account_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
