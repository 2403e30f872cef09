//! Webhook intake.
//!
//! Provider events advance deposits; nothing a client sends directly can.
//! The intake verifies the provider signature over the raw body, claims
//! the event id exactly once, then dispatches by event type. Failure
//! semantics:
//!
//! - infrastructure failure → release the claim and answer 5xx, so the
//!   provider's retry can reprocess;
//! - client-class failure (malformed payload, unknown deposit) → keep the
//!   claim and answer 2xx, so the provider does not loop on a poisoned
//!   event.
//!
//! Events are not globally ordered and none of this relies on order: the
//! deposit state machine is terminal-once, so late or repeated events
//! converge.

use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::store::deposit::{DepositError, DepositOps};
use crate::store::webhook::{ClaimOutcome, WebhookClaims};
use crate::stripe;

/// Stripe event envelope, the parts this intake reads.
#[derive(Debug, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: SessionObject,
}

#[derive(Debug, Deserialize)]
struct SessionObject {
    id: String,
    #[serde(default)]
    metadata: SessionMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct SessionMetadata {
    deposit_id: Option<Uuid>,
}

/// What the HTTP layer should answer.
#[derive(Debug, PartialEq, Eq)]
pub enum Intake {
    Processed,
    Duplicate,
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("webhook secret not configured")]
    NotConfigured,
    #[error("signature rejected: {0}")]
    BadSignature(#[from] stripe::SignatureError),
    #[error("malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Transient; the claim has been released and the provider should
    /// retry.
    #[error("event processing failed: {0}")]
    Infrastructure(String),
}

pub struct WebhookIntake {
    claims: Arc<dyn WebhookClaims>,
    deposits: Arc<dyn DepositOps>,
    secret: Option<String>,
    tolerance_seconds: u64,
}

impl WebhookIntake {
    pub fn new(
        claims: Arc<dyn WebhookClaims>,
        deposits: Arc<dyn DepositOps>,
        secret: Option<String>,
        tolerance_seconds: u64,
    ) -> Self {
        Self {
            claims,
            deposits,
            secret,
            tolerance_seconds,
        }
    }

    pub async fn handle_stripe(
        &self,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> Result<Intake, IntakeError> {
        let secret = self.secret.as_deref().ok_or(IntakeError::NotConfigured)?;
        let header = signature_header.ok_or(stripe::SignatureError::Malformed)?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        stripe::verify_signature(secret, header, body, self.tolerance_seconds, now)?;

        let envelope: EventEnvelope = serde_json::from_slice(body)?;
        match self
            .claims
            .claim_event(&envelope.id, &envelope.event_type)
            .await
        {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(ClaimOutcome::Duplicate) => {
                tracing::info!(event_id = %envelope.id, "duplicate webhook event");
                return Ok(Intake::Duplicate);
            }
            Err(err) => return Err(IntakeError::Infrastructure(err.to_string())),
        }

        match self.dispatch(&envelope).await {
            Ok(intake) => {
                if let Err(err) = self.claims.finish_event(&envelope.id).await {
                    tracing::warn!(event_id = %envelope.id, error = %err, "failed to finish webhook claim");
                }
                Ok(intake)
            }
            Err(DispatchError::Client(reason)) => {
                // Keep the claim: retrying this event can never succeed.
                tracing::warn!(event_id = %envelope.id, reason, "webhook event unprocessable");
                if let Err(err) = self.claims.finish_event(&envelope.id).await {
                    tracing::warn!(event_id = %envelope.id, error = %err, "failed to finish webhook claim");
                }
                Ok(Intake::Ignored)
            }
            Err(DispatchError::Infrastructure(reason)) => {
                if let Err(err) = self.claims.release_event(&envelope.id).await {
                    tracing::error!(event_id = %envelope.id, error = %err, "failed to release webhook claim");
                }
                Err(IntakeError::Infrastructure(reason))
            }
        }
    }

    async fn dispatch(&self, envelope: &EventEnvelope) -> Result<Intake, DispatchError> {
        match envelope.event_type.as_str() {
            "checkout.session.completed" => {
                let deposit_id = self.locate_deposit(&envelope.data.object).await?;
                self.deposits
                    .complete_deposit(deposit_id)
                    .await
                    .map_err(DispatchError::from)?;
                Ok(Intake::Processed)
            }
            "checkout.session.expired" => {
                let deposit_id = self.locate_deposit(&envelope.data.object).await?;
                self.deposits
                    .fail_deposit(deposit_id, "session expired")
                    .await
                    .map_err(DispatchError::from)?;
                Ok(Intake::Processed)
            }
            other => {
                tracing::debug!(event_type = other, "ignoring webhook event type");
                Ok(Intake::Ignored)
            }
        }
    }

    async fn locate_deposit(&self, object: &SessionObject) -> Result<Uuid, DispatchError> {
        if let Some(deposit_id) = object.metadata.deposit_id {
            return Ok(deposit_id);
        }
        match self.deposits.deposit_by_session(&object.id).await {
            Ok(deposit) => Ok(deposit.id),
            Err(DepositError::NotFound) => Err(DispatchError::Client("unknown deposit reference")),
            Err(other) => Err(DispatchError::Infrastructure(other.to_string())),
        }
    }
}

enum DispatchError {
    Client(&'static str),
    Infrastructure(String),
}

impl From<DepositError> for DispatchError {
    fn from(err: DepositError) -> Self {
        match err {
            DepositError::NotFound => DispatchError::Client("unknown deposit reference"),
            other => DispatchError::Infrastructure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;
    use crate::store::StoreError;
    use crate::store::deposit::{Deposit, DepositStatus, NewDeposit};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const SECRET: &str = "whsec_intake_test";

    #[derive(Default)]
    struct MemClaims {
        claimed: Mutex<HashMap<String, &'static str>>,
    }

    #[async_trait]
    impl WebhookClaims for MemClaims {
        async fn claim_event(
            &self,
            provider_event_id: &str,
            _event_type: &str,
        ) -> Result<ClaimOutcome, StoreError> {
            let mut claimed = self.claimed.lock().unwrap();
            if claimed.contains_key(provider_event_id) {
                Ok(ClaimOutcome::Duplicate)
            } else {
                claimed.insert(provider_event_id.to_string(), "processing");
                Ok(ClaimOutcome::Claimed)
            }
        }

        async fn finish_event(&self, provider_event_id: &str) -> Result<(), StoreError> {
            self.claimed
                .lock()
                .unwrap()
                .insert(provider_event_id.to_string(), "done");
            Ok(())
        }

        async fn release_event(&self, provider_event_id: &str) -> Result<(), StoreError> {
            self.claimed.lock().unwrap().remove(provider_event_id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemDeposits {
        rows: Mutex<HashMap<Uuid, Deposit>>,
        completions: Mutex<Vec<Uuid>>,
    }

    impl MemDeposits {
        fn seed_pending(&self, session_id: &str) -> Uuid {
            let id = Uuid::new_v4();
            let deposit = Deposit {
                id,
                account_id: Uuid::new_v4(),
                provider: "stripe".into(),
                network: None,
                gross_amount: Money::parse("50").unwrap(),
                fee_amount: Money::parse("1.75").unwrap(),
                net_amount: Money::parse("48.25").unwrap(),
                status: DepositStatus::Pending,
                provider_session_id: Some(session_id.to_string()),
                failure_reason: None,
                metadata: json!({}),
                created_at: Utc::now(),
                completed_at: None,
            };
            self.rows.lock().unwrap().insert(id, deposit);
            id
        }
    }

    #[async_trait]
    impl DepositOps for MemDeposits {
        async fn create_deposit(&self, _new: NewDeposit) -> Result<Deposit, DepositError> {
            unimplemented!("not used by intake tests")
        }

        async fn bind_provider_session(
            &self,
            _deposit_id: Uuid,
            _session_id: &str,
        ) -> Result<Deposit, DepositError> {
            unimplemented!("not used by intake tests")
        }

        async fn deposit(&self, deposit_id: Uuid) -> Result<Deposit, DepositError> {
            self.rows
                .lock()
                .unwrap()
                .get(&deposit_id)
                .cloned()
                .ok_or(DepositError::NotFound)
        }

        async fn deposit_by_session(&self, session_id: &str) -> Result<Deposit, DepositError> {
            self.rows
                .lock()
                .unwrap()
                .values()
                .find(|d| d.provider_session_id.as_deref() == Some(session_id))
                .cloned()
                .ok_or(DepositError::NotFound)
        }

        async fn list_deposits(
            &self,
            _account_id: Uuid,
            _limit: i64,
        ) -> Result<Vec<Deposit>, DepositError> {
            Ok(Vec::new())
        }

        async fn complete_deposit(&self, deposit_id: Uuid) -> Result<Deposit, DepositError> {
            let mut rows = self.rows.lock().unwrap();
            let deposit = rows.get_mut(&deposit_id).ok_or(DepositError::NotFound)?;
            if deposit.status == DepositStatus::Pending {
                deposit.status = DepositStatus::Completed;
                self.completions.lock().unwrap().push(deposit_id);
            }
            Ok(deposit.clone())
        }

        async fn fail_deposit(
            &self,
            deposit_id: Uuid,
            reason: &str,
        ) -> Result<Deposit, DepositError> {
            let mut rows = self.rows.lock().unwrap();
            let deposit = rows.get_mut(&deposit_id).ok_or(DepositError::NotFound)?;
            if deposit.status == DepositStatus::Pending {
                deposit.status = DepositStatus::Failed;
                deposit.failure_reason = Some(reason.to_string());
            }
            Ok(deposit.clone())
        }
    }

    fn intake(deposits: Arc<MemDeposits>, claims: Arc<MemClaims>) -> WebhookIntake {
        WebhookIntake::new(claims, deposits, Some(SECRET.to_string()), 300)
    }

    fn signed(body: &serde_json::Value) -> (String, Vec<u8>) {
        let bytes = serde_json::to_vec(body).unwrap();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        (stripe::sign_payload(SECRET, &bytes, now), bytes)
    }

    fn completed_event(event_id: &str, session_id: &str) -> serde_json::Value {
        json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "data": { "object": { "id": session_id, "metadata": {} } }
        })
    }

    #[tokio::test]
    async fn completed_event_advances_deposit_once() {
        let deposits = Arc::new(MemDeposits::default());
        let claims = Arc::new(MemClaims::default());
        let deposit_id = deposits.seed_pending("cs_1");
        let intake = intake(Arc::clone(&deposits), Arc::clone(&claims));

        let (header, body) = signed(&completed_event("evt_1", "cs_1"));
        let first = intake.handle_stripe(Some(&header), &body).await.unwrap();
        assert_eq!(first, Intake::Processed);
        assert_eq!(
            deposits.deposit(deposit_id).await.unwrap().status,
            DepositStatus::Completed
        );

        // Same event id again: duplicate, no second completion.
        let second = intake.handle_stripe(Some(&header), &body).await.unwrap();
        assert_eq!(second, Intake::Duplicate);
        assert_eq!(deposits.completions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_event_fails_deposit_without_credit() {
        let deposits = Arc::new(MemDeposits::default());
        let claims = Arc::new(MemClaims::default());
        let deposit_id = deposits.seed_pending("cs_2");
        let intake = intake(Arc::clone(&deposits), claims);

        let (header, body) = signed(&json!({
            "id": "evt_2",
            "type": "checkout.session.expired",
            "created": 1_700_000_000,
            "data": { "object": { "id": "cs_2", "metadata": {} } }
        }));
        intake.handle_stripe(Some(&header), &body).await.unwrap();
        let deposit = deposits.deposit(deposit_id).await.unwrap();
        assert_eq!(deposit.status, DepositStatus::Failed);
        assert!(deposits.completions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_before_any_claim() {
        let deposits = Arc::new(MemDeposits::default());
        let claims = Arc::new(MemClaims::default());
        deposits.seed_pending("cs_3");
        let intake = intake(deposits, Arc::clone(&claims));

        let body = serde_json::to_vec(&completed_event("evt_3", "cs_3")).unwrap();
        let result = intake
            .handle_stripe(Some("t=1,v1=deadbeef"), &body)
            .await;
        assert!(matches!(result, Err(IntakeError::BadSignature(_))));
        assert!(claims.claimed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_deposit_keeps_claim_and_answers_ok() {
        let deposits = Arc::new(MemDeposits::default());
        let claims = Arc::new(MemClaims::default());
        let intake = intake(deposits, Arc::clone(&claims));

        let (header, body) = signed(&completed_event("evt_4", "cs_missing"));
        let outcome = intake.handle_stripe(Some(&header), &body).await.unwrap();
        assert_eq!(outcome, Intake::Ignored);
        // Claim is retained so the provider does not retry forever.
        assert_eq!(
            claims.claimed.lock().unwrap().get("evt_4"),
            Some(&"done")
        );
    }

    #[tokio::test]
    async fn unhandled_event_types_are_ignored() {
        let deposits = Arc::new(MemDeposits::default());
        let claims = Arc::new(MemClaims::default());
        let intake = intake(deposits, claims);

        let (header, body) = signed(&json!({
            "id": "evt_5",
            "type": "invoice.paid",
            "created": 1_700_000_000,
            "data": { "object": { "id": "in_1", "metadata": {} } }
        }));
        let outcome = intake.handle_stripe(Some(&header), &body).await.unwrap();
        assert_eq!(outcome, Intake::Ignored);
    }
}
