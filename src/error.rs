//! User-visible error taxonomy.
//!
//! Sub-components return their own typed errors; the pipeline and handlers
//! convert everything into [`ApiError`] exactly once, and `IntoResponse`
//! here is the only place an error becomes HTTP. Bodies are always
//! `{error, request_id, code}` so clients can branch on `code` without
//! parsing prose.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use uuid::Uuid;

use crate::proto::PaymentChallenge;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    AuthRequired,
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Missing/invalid payment header or insufficient balance. Carries the
    /// challenge so the client learns exactly what to pay and where.
    #[error("payment required")]
    PaymentRequired(Box<PaymentChallenge>),
    /// The facilitator looked at the payment and said no.
    #[error("payment rejected: {reason}")]
    PaymentRejected {
        reason: String,
        challenge: Box<PaymentChallenge>,
    },
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict: {message}")]
    Conflict { message: String, code: &'static str },
    #[error("not found: {0}")]
    NotFound(String),
    /// Transient failure in a dependency after retries; the client may
    /// retry the whole request.
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn conflict(message: impl Into<String>, code: &'static str) -> Self {
        ApiError::Conflict {
            message: message.into(),
            code,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::PaymentRequired(_) | ApiError::PaymentRejected { .. } => {
                StatusCode::PAYMENT_REQUIRED
            }
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::PaymentRequired(_) => "payment_required",
            ApiError::PaymentRejected { .. } => "payment_rejected",
            ApiError::Validation(_) => "validation",
            ApiError::Conflict { code, .. } => code,
            ApiError::NotFound(_) => "not_found",
            ApiError::Upstream(_) => "upstream",
            ApiError::Internal(_) => "internal",
        }
    }

    /// Binds the request id so the emitted body can echo it.
    pub fn with_request_id(self, request_id: Uuid) -> RespondedError {
        RespondedError {
            error: self,
            request_id,
        }
    }
}

/// An [`ApiError`] paired with the request id it will answer.
#[derive(Debug)]
pub struct RespondedError {
    error: ApiError,
    request_id: Uuid,
}

impl IntoResponse for RespondedError {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let code = self.error.code();
        if status.is_server_error() {
            tracing::error!(request_id = %self.request_id, code, error = %self.error, "request failed");
        } else {
            tracing::info!(request_id = %self.request_id, code, error = %self.error, "request refused");
        }
        let body = match &self.error {
            // 402 responses carry the machine-readable challenge so the
            // client can construct a payment without a second round trip.
            ApiError::PaymentRequired(challenge) => json!({
                "error": self.error.to_string(),
                "request_id": self.request_id,
                "code": code,
                "accepts": challenge.accepts,
            }),
            ApiError::PaymentRejected { challenge, .. } => json!({
                "error": self.error.to_string(),
                "request_id": self.request_id,
                "code": code,
                "accepts": challenge.accepts,
            }),
            _ => json!({
                "error": self.error.to_string(),
                "request_id": self.request_id,
                "code": code,
            }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_statuses() {
        assert_eq!(ApiError::AuthRequired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::conflict("dup", "duplicate_registration").status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Upstream("scanner".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::Internal("oops".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn conflict_code_passes_through() {
        let err = ApiError::conflict("wallet already linked", "wallet_linked");
        assert_eq!(err.code(), "wallet_linked");
    }
}
