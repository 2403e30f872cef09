//! HTTP surface.
//!
//! Route registration and request/response binding only: every handler
//! resolves its inputs, calls into the service graph, and converts typed
//! errors into the taxonomy exactly once via [`RespondedError`]. Paid
//! routes delegate the whole lifecycle to the pipeline.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::auth::{self, AuthContext};
use crate::deposits::CreateDepositRequest;
use crate::error::{ApiError, RespondedError};
use crate::money::Money;
use crate::pipeline::{ScanRequestBody, ScanRoute};
use crate::proto::{ChainAddress, Network, PAYMENT_HEADER, PAYMENT_RESPONSE_HEADER};
use crate::request_id::RequestId;
use crate::services::Services;
use crate::store::account::AccountError;
use crate::store::apikey::ApiKeyError;
use crate::store::deposit::Deposit;
use crate::stripe::SIGNATURE_HEADER;
use crate::webhook::{Intake, IntakeError};

type Result<T> = std::result::Result<T, RespondedError>;

pub fn routes() -> Router<Arc<Services>> {
    Router::new()
        .route("/v1/scan/content", post(post_scan_content))
        .route("/v1/scan/output", post(post_scan_output))
        .route("/v1/register", post(post_register))
        .route("/v1/deposit", post(post_deposit))
        .route("/v1/deposits", get(get_deposits))
        .route("/v1/account", get(get_account))
        .route("/v1/account/usage", get(get_usage))
        .route("/v1/account/usage/stats", get(get_usage_stats))
        .route("/v1/account/balances", get(get_balances))
        .route("/v1/account/wallets", put(put_wallets))
        .route("/v1/account/api-keys", post(post_api_key).get(get_api_keys))
        .route("/v1/account/api-keys/{id}", delete(delete_api_key))
        .route("/webhooks/stripe", post(post_stripe_webhook))
        .route("/health", get(get_health))
        .route("/health/live", get(get_health_live))
        .route("/health/ready", get(get_health))
}

// ----------------------------------------------------------------------
// Paid scans
// ----------------------------------------------------------------------

#[instrument(skip_all, fields(request_id = %request_id.0))]
async fn post_scan_content(
    State(services): State<Arc<Services>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    scan(services, request_id, headers, body, ScanRoute::Content).await
}

#[instrument(skip_all, fields(request_id = %request_id.0))]
async fn post_scan_output(
    State(services): State<Arc<Services>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    scan(services, request_id, headers, body, ScanRoute::Output).await
}

async fn scan(
    services: Arc<Services>,
    request_id: RequestId,
    headers: HeaderMap,
    body: Bytes,
    route: ScanRoute,
) -> Result<Response> {
    let rid = request_id.0;
    let fail = |err: ApiError| err.with_request_id(rid);

    let body: ScanRequestBody = serde_json::from_slice(&body)
        .map_err(|err| fail(ApiError::Validation(format!("invalid body: {err}"))))?;
    let caller = services.auth.resolve(&headers).await.map_err(fail)?;
    let payment_header = headers.get(PAYMENT_HEADER).map(|value| value.as_bytes());

    let outcome = services
        .paygate
        .handle_scan(
            route,
            caller.as_ref().map(|ctx| ctx.account.id),
            rid,
            payment_header,
            body,
        )
        .await
        .map_err(fail)?;

    let mut response = (StatusCode::OK, Json(outcome.body)).into_response();
    if let Some(receipt) = outcome.receipt_header {
        if let Ok(value) = HeaderValue::from_str(&receipt) {
            response
                .headers_mut()
                .insert(PAYMENT_RESPONSE_HEADER, value);
        }
    }
    Ok(response)
}

// ----------------------------------------------------------------------
// Accounts and keys
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    account_id: Uuid,
    account_number: String,
    balance: Money,
    /// Shown exactly once; only its hash is stored.
    api_key: String,
}

#[instrument(skip_all)]
async fn post_register(
    State(services): State<Arc<Services>>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<RegisterRequest>,
) -> Result<Response> {
    let rid = request_id.0;
    let fail = |err: ApiError| err.with_request_id(rid);

    let email = body.email.trim().to_ascii_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(fail(ApiError::Validation("invalid email".into())));
    }
    let account = services
        .accounts
        .create_account(&email, &auth::mint_account_number())
        .await
        .map_err(|err| match err {
            AccountError::DuplicateEmail => fail(ApiError::conflict(
                "email already registered",
                "duplicate_registration",
            )),
            other => fail(ApiError::Internal(other.to_string())),
        })?;
    let minted = auth::mint_secret();
    services
        .api_keys
        .insert_key(account.id, &minted.hash, &minted.prefix, services.api_key_cap)
        .await
        .map_err(|err| fail(ApiError::Internal(err.to_string())))?;
    tracing::info!(account_id = %account.id, "account registered");

    let response = RegisterResponse {
        account_id: account.id,
        account_number: account.display_number(),
        balance: account.balance,
        api_key: minted.secret,
    };
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

#[derive(Debug, Serialize)]
struct AccountView {
    account_id: Uuid,
    account_number: String,
    email: String,
    status: &'static str,
    balance: Money,
    wallets: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[instrument(skip_all)]
async fn get_account(
    State(services): State<Arc<Services>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> Result<Response> {
    let ctx = require_auth(&services, &headers, request_id.0).await?;
    let account = ctx.account;
    let view = AccountView {
        account_id: account.id,
        account_number: account.display_number(),
        email: account.email.clone(),
        status: if account.is_active() { "active" } else { "suspended" },
        balance: account.balance,
        wallets: account.wallets.clone(),
        created_at: account.created_at,
    };
    Ok(Json(view).into_response())
}

#[derive(Debug, Serialize)]
struct ApiKeyView {
    id: Uuid,
    prefix: String,
    active: bool,
    created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_used_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
struct CreatedKeyResponse {
    key: ApiKeyView,
    /// Shown exactly once.
    api_key: String,
}

#[instrument(skip_all)]
async fn post_api_key(
    State(services): State<Arc<Services>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> Result<Response> {
    let rid = request_id.0;
    let ctx = require_auth(&services, &headers, rid).await?;
    let minted = auth::mint_secret();
    let row = services
        .api_keys
        .insert_key(
            ctx.account.id,
            &minted.hash,
            &minted.prefix,
            services.api_key_cap,
        )
        .await
        .map_err(|err| match err {
            ApiKeyError::CapReached => {
                ApiError::conflict("active key limit reached", "key_cap_reached")
                    .with_request_id(rid)
            }
            other => ApiError::Internal(other.to_string()).with_request_id(rid),
        })?;
    let response = CreatedKeyResponse {
        key: ApiKeyView {
            id: row.id,
            prefix: row.key_prefix,
            active: row.active,
            created_at: row.created_at,
            last_used_at: row.last_used_at,
        },
        api_key: minted.secret,
    };
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

#[instrument(skip_all)]
async fn get_api_keys(
    State(services): State<Arc<Services>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> Result<Response> {
    let rid = request_id.0;
    let ctx = require_auth(&services, &headers, rid).await?;
    let rows = services
        .api_keys
        .list_keys(ctx.account.id)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()).with_request_id(rid))?;
    let keys: Vec<ApiKeyView> = rows
        .into_iter()
        .map(|row| ApiKeyView {
            id: row.id,
            prefix: row.key_prefix,
            active: row.active,
            created_at: row.created_at,
            last_used_at: row.last_used_at,
        })
        .collect();
    Ok(Json(json!({ "keys": keys })).into_response())
}

#[instrument(skip_all)]
async fn delete_api_key(
    State(services): State<Arc<Services>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Path(key_id): Path<Uuid>,
) -> Result<Response> {
    let rid = request_id.0;
    let ctx = require_auth(&services, &headers, rid).await?;
    services
        .api_keys
        .revoke_key(ctx.account.id, key_id)
        .await
        .map_err(|err| match err {
            ApiKeyError::NotFound => {
                ApiError::NotFound("api key not found".into()).with_request_id(rid)
            }
            other => ApiError::Internal(other.to_string()).with_request_id(rid),
        })?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Deserialize)]
struct WalletsRequest {
    wallets: HashMap<String, String>,
}

#[instrument(skip_all)]
async fn put_wallets(
    State(services): State<Arc<Services>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<WalletsRequest>,
) -> Result<Response> {
    let rid = request_id.0;
    let fail = |err: ApiError| err.with_request_id(rid);
    let ctx = require_auth(&services, &headers, rid).await?;

    let mut wallets: HashMap<Network, String> = HashMap::new();
    for (network, address) in &body.wallets {
        let network: Network = network
            .parse()
            .map_err(|_| fail(ApiError::Validation(format!("unknown network: {network}"))))?;
        let address: ChainAddress = address
            .parse()
            .map_err(|_| fail(ApiError::Validation(format!("invalid address for {network}"))))?;
        wallets.insert(network, address.to_string());
    }
    let account = services
        .accounts
        .set_wallets(ctx.account.id, &wallets)
        .await
        .map_err(|err| fail(ApiError::Internal(err.to_string())))?;
    Ok(Json(json!({ "wallets": account.wallets })).into_response())
}

// ----------------------------------------------------------------------
// Deposits
// ----------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct DepositView {
    deposit_id: Uuid,
    provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<String>,
    gross_amount: Money,
    fee_amount: Money,
    net_amount: Money,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<Deposit> for DepositView {
    fn from(deposit: Deposit) -> Self {
        DepositView {
            deposit_id: deposit.id,
            provider: deposit.provider,
            network: deposit.network,
            gross_amount: deposit.gross_amount,
            fee_amount: deposit.fee_amount,
            net_amount: deposit.net_amount,
            status: deposit.status.as_str(),
            failure_reason: deposit.failure_reason,
            created_at: deposit.created_at,
            completed_at: deposit.completed_at,
        }
    }
}

#[instrument(skip_all)]
async fn post_deposit(
    State(services): State<Arc<Services>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<CreateDepositRequest>,
) -> Result<Response> {
    let rid = request_id.0;
    let ctx = require_auth(&services, &headers, rid).await?;
    let created = services
        .deposits
        .create(ctx.account.id, body)
        .await
        .map_err(|err| err.with_request_id(rid))?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

#[instrument(skip_all)]
async fn get_deposits(
    State(services): State<Arc<Services>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> Result<Response> {
    let rid = request_id.0;
    let ctx = require_auth(&services, &headers, rid).await?;
    let deposits = services
        .deposits
        .list(ctx.account.id, 100)
        .await
        .map_err(|err| err.with_request_id(rid))?;
    let views: Vec<DepositView> = deposits.into_iter().map(DepositView::from).collect();
    Ok(Json(json!({ "deposits": views })).into_response())
}

// ----------------------------------------------------------------------
// Usage and balances
// ----------------------------------------------------------------------

#[instrument(skip_all)]
async fn get_usage(
    State(services): State<Arc<Services>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> Result<Response> {
    let rid = request_id.0;
    let ctx = require_auth(&services, &headers, rid).await?;
    let rows = services
        .usage
        .recent(ctx.account.id, 100)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()).with_request_id(rid))?;
    Ok(Json(json!({ "usage": rows })).into_response())
}

#[instrument(skip_all)]
async fn get_usage_stats(
    State(services): State<Arc<Services>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> Result<Response> {
    let rid = request_id.0;
    let ctx = require_auth(&services, &headers, rid).await?;
    let buckets = services
        .usage
        .stats(ctx.account.id, 30)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()).with_request_id(rid))?;
    Ok(Json(json!({ "days": 30, "buckets": buckets })).into_response())
}

#[instrument(skip_all)]
async fn get_balances(
    State(services): State<Arc<Services>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> Result<Response> {
    let rid = request_id.0;
    let ctx = require_auth(&services, &headers, rid).await?;
    let wallets = ctx.account.wallet_map();
    let chains = services.balances.read_all(&wallets).await;
    Ok(Json(json!({
        "account_balance": ctx.account.balance,
        "chains": chains,
    }))
    .into_response())
}

// ----------------------------------------------------------------------
// Webhooks
// ----------------------------------------------------------------------

#[instrument(skip_all)]
async fn post_stripe_webhook(
    State(services): State<Arc<Services>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let rid = request_id.0;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    match services.webhooks.handle_stripe(signature, &body).await {
        Ok(Intake::Processed) | Ok(Intake::Ignored) => {
            Ok(Json(json!({ "received": true })).into_response())
        }
        Ok(Intake::Duplicate) => Ok(Json(json!({ "duplicate": true })).into_response()),
        Err(IntakeError::NotConfigured) => Err(ApiError::Upstream(
            "webhook intake is not configured".into(),
        )
        .with_request_id(rid)),
        Err(IntakeError::BadSignature(err)) => {
            Err(ApiError::Validation(err.to_string()).with_request_id(rid))
        }
        Err(IntakeError::Malformed(err)) => {
            Err(ApiError::Validation(err.to_string()).with_request_id(rid))
        }
        // 5xx so the provider retries; the claim has been released.
        Err(IntakeError::Infrastructure(reason)) => {
            Err(ApiError::Upstream(reason).with_request_id(rid))
        }
    }
}

// ----------------------------------------------------------------------
// Health
// ----------------------------------------------------------------------

#[instrument(skip_all)]
async fn get_health_live() -> Response {
    Json(json!({ "status": "live" })).into_response()
}

#[instrument(skip_all)]
async fn get_health(State(services): State<Arc<Services>>) -> Response {
    let database_ok = services.store.ping().await;
    let facilitator_ok = services.facilitator.healthy().await;
    let healthy = database_ok && facilitator_ok;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "dependencies": {
            "database": if database_ok { "ok" } else { "down" },
            "facilitator": if facilitator_ok { "ok" } else { "down" },
        }
    });
    (status, Json(body)).into_response()
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

async fn require_auth(
    services: &Services,
    headers: &HeaderMap,
    request_id: Uuid,
) -> Result<AuthContext> {
    services
        .auth
        .require(headers)
        .await
        .map_err(|err| err.with_request_id(request_id))
}
