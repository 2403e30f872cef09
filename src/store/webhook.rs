//! Exactly-once webhook event claims.
//!
//! Claiming is a primary-key insert: the winner processes the event,
//! everyone else observes a duplicate. A transient handler failure
//! releases the claim (deleting the row) so the provider's retry can win
//! it again; a permanent failure keeps the claim to suppress retry storms.

use async_trait::async_trait;

use super::{PgStore, StoreError, is_unique_violation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This handler owns the event.
    Claimed,
    /// Someone already claimed (and possibly finished) this event id.
    Duplicate,
}

#[async_trait]
pub trait WebhookClaims: Send + Sync {
    async fn claim_event(
        &self,
        provider_event_id: &str,
        event_type: &str,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Marks a claimed event fully processed.
    async fn finish_event(&self, provider_event_id: &str) -> Result<(), StoreError>;

    /// Releases a claim after a transient failure so provider retries can
    /// reprocess.
    async fn release_event(&self, provider_event_id: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl WebhookClaims for PgStore {
    async fn claim_event(
        &self,
        provider_event_id: &str,
        event_type: &str,
    ) -> Result<ClaimOutcome, StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO webhook_events (provider_event_id, event_type, outcome) \
             VALUES ($1, $2, 'processing')",
        )
        .bind(provider_event_id)
        .bind(event_type)
        .execute(self.pool())
        .await;
        match inserted {
            Ok(_) => Ok(ClaimOutcome::Claimed),
            Err(err) if is_unique_violation(&err) => Ok(ClaimOutcome::Duplicate),
            Err(err) => Err(err.into()),
        }
    }

    async fn finish_event(&self, provider_event_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE webhook_events SET outcome = 'done' WHERE provider_event_id = $1")
            .bind(provider_event_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn release_event(&self, provider_event_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM webhook_events WHERE provider_event_id = $1")
            .bind(provider_event_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
