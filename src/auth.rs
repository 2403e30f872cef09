//! API-key authentication.
//!
//! A presented secret maps to an account. Secrets look like
//! `sk_<64 hex chars>`; only their SHA-256 hex digest is stored, with the
//! first characters kept as a prefix for log lines. Resolution hashes the
//! presented secret, fetches by hash, and still compares digests in
//! constant time before trusting the row. Revoked keys never resolve.

use axum::http::HeaderMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::ApiError;
use crate::store::account::{Account, AccountError, AccountStore};
use crate::store::apikey::{ApiKeyError, ApiKeyRow, ApiKeyStore};

/// Characters of the secret retained as a loggable prefix.
const PREFIX_LEN: usize = 12;

/// A freshly minted secret with its storable derivatives. The secret
/// itself is shown to the caller once and never persisted.
pub struct MintedKey {
    pub secret: String,
    pub prefix: String,
    pub hash: String,
}

pub fn mint_secret() -> MintedKey {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    let secret = format!("sk_{}", hex::encode(bytes));
    MintedKey {
        prefix: secret[..PREFIX_LEN].to_string(),
        hash: hash_secret(&secret),
        secret,
    }
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Generates a 16-digit human-facing account number.
pub fn mint_account_number() -> String {
    let mut rng = rand::rng();
    (0..16)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

/// Pulls a presented secret out of `Authorization: Bearer …` or
/// `X-Api-Key`.
pub fn presented_secret(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("Authorization") {
        let value = value.to_str().ok()?;
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    headers
        .get("X-Api-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}

/// The authenticated caller: account plus the key that proved it.
#[derive(Clone)]
pub struct AuthContext {
    pub account: Account,
    pub key_id: Uuid,
}

pub struct AuthResolver {
    keys: Arc<dyn ApiKeyStore>,
    accounts: Arc<dyn AccountStore>,
}

impl AuthResolver {
    pub fn new(keys: Arc<dyn ApiKeyStore>, accounts: Arc<dyn AccountStore>) -> Self {
        Self { keys, accounts }
    }

    /// Resolves the request's credential, if any.
    ///
    /// `Ok(None)` means no credential was presented. Some routes accept
    /// that (header-paid scans); routes that require an account convert it
    /// to 401 themselves.
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<Option<AuthContext>, ApiError> {
        let Some(secret) = presented_secret(headers) else {
            return Ok(None);
        };
        let presented_hash = hash_secret(&secret);
        let row = self
            .keys
            .find_by_hash(&presented_hash)
            .await
            .map_err(internal)?;
        let Some(row) = row else {
            tracing::info!(prefix = secret_prefix(&secret), "unknown api key");
            return Err(ApiError::AuthRequired);
        };
        let hashes_match: bool = row
            .key_hash
            .as_bytes()
            .ct_eq(presented_hash.as_bytes())
            .into();
        if !hashes_match {
            return Err(ApiError::AuthRequired);
        }
        let account = self
            .accounts
            .account(row.account_id)
            .await
            .map_err(|err| match err {
                AccountError::NotFound => ApiError::AuthRequired,
                other => ApiError::Internal(other.to_string()),
            })?;
        if !account.is_active() {
            return Err(ApiError::Forbidden("account suspended".to_string()));
        }
        self.touch_async(&row);
        Ok(Some(AuthContext {
            account,
            key_id: row.id,
        }))
    }

    /// Requires an authenticated caller.
    pub async fn require(&self, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
        self.resolve(headers).await?.ok_or(ApiError::AuthRequired)
    }

    fn touch_async(&self, row: &ApiKeyRow) {
        let keys = Arc::clone(&self.keys);
        let key_id = row.id;
        tokio::spawn(async move {
            if let Err(err) = keys.touch_last_used(key_id).await {
                tracing::debug!(error = %err, "failed to touch api key last_used_at");
            }
        });
    }
}

fn secret_prefix(secret: &str) -> &str {
    &secret[..secret.len().min(PREFIX_LEN)]
}

fn internal(err: ApiKeyError) -> ApiError {
    ApiError::Internal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn minted_keys_are_well_formed() {
        let minted = mint_secret();
        assert!(minted.secret.starts_with("sk_"));
        assert_eq!(minted.secret.len(), 3 + 64);
        assert_eq!(minted.prefix.len(), PREFIX_LEN);
        assert_eq!(minted.hash, hash_secret(&minted.secret));
        assert_eq!(minted.hash.len(), 64);
    }

    #[test]
    fn minted_keys_are_unique() {
        let a = mint_secret();
        let b = mint_secret();
        assert_ne!(a.secret, b.secret);
    }

    #[test]
    fn account_numbers_are_sixteen_digits() {
        let number = mint_account_number();
        assert_eq!(number.len(), 16);
        assert!(number.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn extracts_bearer_and_api_key_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer sk_abc"));
        assert_eq!(presented_secret(&headers).as_deref(), Some("sk_abc"));

        let mut headers = HeaderMap::new();
        headers.insert("X-Api-Key", HeaderValue::from_static("sk_xyz"));
        assert_eq!(presented_secret(&headers).as_deref(), Some("sk_xyz"));

        assert_eq!(presented_secret(&HeaderMap::new()), None);
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(hash_secret("sk_test"), hash_secret("sk_test"));
        assert_ne!(hash_secret("sk_test"), hash_secret("sk_test2"));
    }
}
