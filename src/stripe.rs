//! Stripe: checkout session creation and webhook signature verification.
//!
//! Deposits funded by card go through a Stripe Checkout Session whose id
//! is late-bound onto the deposit row. Completion and expiry arrive as
//! webhooks whose `Stripe-Signature` header is an HMAC-SHA256 over
//! `"{timestamp}.{raw_body}"` with the shared endpoint secret.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use std::time::Duration;
use uuid::Uuid;

use crate::money::Money;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

const API_BASE: &str = "https://api.stripe.com";

/// A provider-side funding session for a deposit.
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider not configured")]
    NotConfigured,
    #[error("HTTP error: {context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected provider response: {0}")]
    UnexpectedResponse(String),
}

/// Creates funding sessions with an external payment provider.
#[async_trait]
pub trait DepositProvider: Send + Sync {
    async fn create_checkout(
        &self,
        deposit_id: Uuid,
        gross: Money,
    ) -> Result<CheckoutSession, ProviderError>;
}

pub struct StripeClient {
    client: Client,
    secret_key: String,
    success_url: String,
    cancel_url: String,
}

impl StripeClient {
    pub fn new(secret_key: String, success_url: String, cancel_url: String) -> Self {
        Self {
            client: Client::new(),
            secret_key,
            success_url,
            cancel_url,
        }
    }
}

#[derive(serde::Deserialize)]
struct SessionResponse {
    id: String,
    url: Option<String>,
}

#[async_trait]
impl DepositProvider for StripeClient {
    async fn create_checkout(
        &self,
        deposit_id: Uuid,
        gross: Money,
    ) -> Result<CheckoutSession, ProviderError> {
        // Stripe amounts are integer cents; micro-units round down to the
        // cent, which the deposit fee schedule already absorbed.
        let cents = gross.micros() / 10_000;
        let deposit_id = deposit_id.to_string();
        let cents = cents.to_string();
        let form: Vec<(&str, &str)> = vec![
            ("mode", "payment"),
            ("success_url", &self.success_url),
            ("cancel_url", &self.cancel_url),
            ("line_items[0][quantity]", "1"),
            ("line_items[0][price_data][currency]", "usd"),
            (
                "line_items[0][price_data][product_data][name]",
                "Account balance top-up",
            ),
            ("line_items[0][price_data][unit_amount]", &cents),
            ("metadata[deposit_id]", &deposit_id),
        ];
        let response = self
            .client
            .post(format!("{API_BASE}/v1/checkout/sessions"))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&form)
            .timeout(Duration::from_secs(20))
            .send()
            .await
            .map_err(|e| ProviderError::Transport {
                context: "POST /v1/checkout/sessions",
                source: e,
            })?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::UnexpectedResponse(body));
        }
        let session: SessionResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::Transport {
                    context: "decode checkout session",
                    source: e,
                })?;
        Ok(CheckoutSession {
            id: session.id,
            url: session.url,
        })
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Stale,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies a `Stripe-Signature` header against the raw body.
///
/// `now` is injected so tests can pin the clock; production callers pass
/// the current unix time.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    tolerance_seconds: u64,
    now: u64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<u64> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if now.abs_diff(timestamp) > tolerance_seconds {
        return Err(SignatureError::Stale);
    }
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());
    let matched = signatures.iter().any(|candidate| {
        use subtle::ConstantTimeEq;
        candidate.as_bytes().ct_eq(expected.as_bytes()).into()
    });
    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Computes a signature header for a payload. Test scaffolding for the
/// webhook intake, and usable by local tooling that replays events.
pub fn sign_payload(secret: &str, body: &[u8], timestamp: u64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const BODY: &[u8] = br#"{"id":"evt_1","type":"checkout.session.completed"}"#;

    #[test]
    fn valid_signature_verifies() {
        let header = sign_payload(SECRET, BODY, 1_700_000_000);
        assert_eq!(
            verify_signature(SECRET, &header, BODY, 300, 1_700_000_010),
            Ok(())
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let header = sign_payload(SECRET, BODY, 1_700_000_000);
        assert_eq!(
            verify_signature(SECRET, &header, BODY, 300, 1_700_000_400),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn tampered_body_is_rejected() {
        let header = sign_payload(SECRET, BODY, 1_700_000_000);
        assert_eq!(
            verify_signature(SECRET, &header, b"{}", 300, 1_700_000_010),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let header = sign_payload("whsec_other", BODY, 1_700_000_000);
        assert_eq!(
            verify_signature(SECRET, &header, BODY, 300, 1_700_000_010),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn malformed_header_is_rejected() {
        assert_eq!(
            verify_signature(SECRET, "v1=abcdef", BODY, 300, 1_700_000_000),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature(SECRET, "t=1700000000", BODY, 300, 1_700_000_000),
            Err(SignatureError::Malformed)
        );
    }
}
