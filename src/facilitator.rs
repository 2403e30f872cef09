//! The external settlement facilitator.
//!
//! The facilitator is a remote HTTP service that verifies a proposed
//! payment payload (`POST /verify`) and later executes the on-chain
//! transfer (`POST /settle`). This gateway never touches a chain directly;
//! the [`Facilitator`] trait is the seam, and [`FacilitatorClient`] is the
//! production implementation over `reqwest`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use url::Url;

use crate::proto::{SettleRequest, SettleResponse, VerifyRequest, VerifyResponse};

/// Verification and settlement of in-band payments.
///
/// `verify` must be called before service is rendered, `settle` after.
/// Implementations are expected to be idempotent on `verify` and to treat
/// `settle` as at-most-once per payload nonce.
#[async_trait]
pub trait Facilitator: Send + Sync {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, FacilitatorError>;

    async fn settle(&self, request: &SettleRequest) -> Result<SettleResponse, FacilitatorError>;

    /// Cheap liveness probe for the health endpoint.
    async fn healthy(&self) -> bool;
}

/// Errors talking to the facilitator.
///
/// The split matters downstream: [`FacilitatorError::Transport`] and
/// [`FacilitatorError::Status`] with a 5xx are retryable from the client's
/// perspective, while a 4xx is terminal for the attempt.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorError {
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("HTTP error: {context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected HTTP status {status}: {context}: {body}")]
    Status {
        context: &'static str,
        status: StatusCode,
        body: String,
    },
}

impl FacilitatorError {
    /// Whether the caller may retry the same request later and hope for a
    /// different answer.
    pub fn is_retryable(&self) -> bool {
        match self {
            FacilitatorError::UrlParse { .. } => false,
            FacilitatorError::Transport { .. } => true,
            FacilitatorError::JsonDeserialization { .. } => true,
            FacilitatorError::Status { status, .. } => status.is_server_error(),
        }
    }
}

/// HTTP client for a remote facilitator.
///
/// Cheap to clone; shares a connection pool via `reqwest::Client`. Every
/// call carries one end-to-end deadline.
pub struct FacilitatorClient {
    base_url: Url,
    verify_url: Url,
    settle_url: Url,
    health_url: Url,
    client: Client,
    timeout: Duration,
    health: RwLock<Option<HealthProbe>>,
    health_ttl: Duration,
}

#[derive(Debug, Clone, Copy)]
struct HealthProbe {
    healthy: bool,
    observed_at: Instant,
}

impl FacilitatorClient {
    pub fn try_new(base_url: Url, timeout: Duration) -> Result<Self, FacilitatorError> {
        let verify_url = base_url
            .join("./verify")
            .map_err(|e| FacilitatorError::UrlParse {
                context: "failed to construct ./verify URL",
                source: e,
            })?;
        let settle_url = base_url
            .join("./settle")
            .map_err(|e| FacilitatorError::UrlParse {
                context: "failed to construct ./settle URL",
                source: e,
            })?;
        let health_url = base_url
            .join("./health")
            .map_err(|e| FacilitatorError::UrlParse {
                context: "failed to construct ./health URL",
                source: e,
            })?;
        Ok(Self {
            base_url,
            verify_url,
            settle_url,
            health_url,
            client: Client::new(),
            timeout,
            health: RwLock::new(None),
            health_ttl: Duration::from_secs(30),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn post_json<T, R>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
    ) -> Result<R, FacilitatorError>
    where
        T: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let http_response = self
            .client
            .post(url.clone())
            .json(payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| FacilitatorError::Transport { context, source: e })?;

        if http_response.status() == StatusCode::OK {
            http_response
                .json::<R>()
                .await
                .map_err(|e| FacilitatorError::JsonDeserialization { context, source: e })
        } else {
            let status = http_response.status();
            let body = http_response.text().await.unwrap_or_default();
            Err(FacilitatorError::Status {
                context,
                status,
                body,
            })
        }
    }

    /// Probes `GET /health`, caching the observation for the TTL. The cache
    /// is read-mostly: concurrent health checks read the guard without
    /// contention and only a stale observation takes the write lock.
    async fn probe_health(&self) -> bool {
        {
            let guard = self.health.read().expect("health cache lock");
            if let Some(probe) = *guard {
                if probe.observed_at.elapsed() < self.health_ttl {
                    return probe.healthy;
                }
            }
        }
        let healthy = match self
            .client
            .get(self.health_url.clone())
            .timeout(Duration::from_secs(3))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        };
        let mut guard = self.health.write().expect("health cache lock");
        *guard = Some(HealthProbe {
            healthy,
            observed_at: Instant::now(),
        });
        healthy
    }
}

#[async_trait]
impl Facilitator for FacilitatorClient {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, FacilitatorError> {
        let result = self
            .post_json(&self.verify_url, "POST /verify", request)
            .await;
        if let Err(err) = &result {
            tracing::warn!(error = %err, "facilitator verify call failed");
        }
        result
    }

    async fn settle(&self, request: &SettleRequest) -> Result<SettleResponse, FacilitatorError> {
        let result = self
            .post_json(&self.settle_url, "POST /settle", request)
            .await;
        if let Err(err) = &result {
            tracing::warn!(error = %err, "facilitator settle call failed");
        }
        result
    }

    async fn healthy(&self) -> bool {
        self.probe_health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;
    use crate::proto::{
        AtomicAmount, Network, PaymentNonce, PaymentOffer, PaymentPayload, Scheme, UnixTimestamp,
    };
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request_fixture() -> VerifyRequest {
        VerifyRequest {
            payment_payload: PaymentPayload {
                network: Network::BaseSepolia,
                scheme: Scheme::X402,
                payer: "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045".parse().unwrap(),
                receiver: "0x209693Bc6afc0C5328bA36FaF03C514EF312287C".parse().unwrap(),
                token_address: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".parse().unwrap(),
                amount: AtomicAmount(1_000),
                timestamp: UnixTimestamp(1_700_000_000),
                nonce: PaymentNonce([1u8; 32]),
                transaction: "AQID".to_string(),
            },
            requirements: PaymentOffer {
                scheme: Scheme::X402,
                network: Network::BaseSepolia,
                recipient: "0x209693Bc6afc0C5328bA36FaF03C514EF312287C".parse().unwrap(),
                amount: Money::parse("0.001").unwrap(),
                token_address: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".parse().unwrap(),
                currency: "USDC".to_string(),
            },
        }
    }

    fn client_for(server: &MockServer) -> FacilitatorClient {
        let url = Url::parse(&format!("{}/", server.uri())).unwrap();
        FacilitatorClient::try_new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn verify_parses_valid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "isValid": true,
                "payer": "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045"
            })))
            .mount(&server)
            .await;
        let client = client_for(&server);
        let response = client.verify(&request_fixture()).await.unwrap();
        assert!(response.is_valid);
    }

    #[tokio::test]
    async fn verify_rejection_carries_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "isValid": false,
                "invalidReason": "invalid_signature"
            })))
            .mount(&server)
            .await;
        let client = client_for(&server);
        let response = client.verify(&request_fixture()).await.unwrap();
        assert!(!response.is_valid);
        assert_eq!(response.invalid_reason.as_deref(), Some("invalid_signature"));
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let client = client_for(&server);
        let err = client.settle(&request_fixture()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn client_error_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad payload"))
            .mount(&server)
            .await;
        let client = client_for(&server);
        let err = client.settle(&request_fixture()).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
