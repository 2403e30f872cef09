//! Deposit creation and listing.
//!
//! Clients open a funding intent here; the state machine that completes or
//! fails it lives in the store and fires only under webhook authority.
//! For card funding the Stripe Checkout Session id is late-bound onto the
//! row once the provider allocates one.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::money::Money;
use crate::proto::Network;
use crate::store::deposit::{Deposit, DepositError, DepositOps, NewDeposit};
use crate::stripe::DepositProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepositKind {
    Stripe,
    DirectChain,
}

impl DepositKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositKind::Stripe => "stripe",
            DepositKind::DirectChain => "direct-chain",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateDepositRequest {
    pub amount: Money,
    pub provider: DepositKind,
    #[serde(default)]
    pub network: Option<Network>,
}

#[derive(Debug, Serialize)]
pub struct CreatedDeposit {
    pub deposit_id: Uuid,
    pub status: &'static str,
    pub gross_amount: Money,
    pub fee_amount: Money,
    pub net_amount: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
}

pub struct DepositService {
    deposits: Arc<dyn DepositOps>,
    provider: Option<Arc<dyn DepositProvider>>,
    fee_bps: u32,
}

impl DepositService {
    pub fn new(
        deposits: Arc<dyn DepositOps>,
        provider: Option<Arc<dyn DepositProvider>>,
        fee_bps: u32,
    ) -> Self {
        Self {
            deposits,
            provider,
            fee_bps,
        }
    }

    pub async fn create(
        &self,
        account_id: Uuid,
        request: CreateDepositRequest,
    ) -> Result<CreatedDeposit, ApiError> {
        if request.amount.is_zero() {
            return Err(ApiError::Validation("deposit amount must be positive".into()));
        }
        // Card deposits carry the processor fee; direct chain transfers
        // land whole.
        let fee = match request.provider {
            DepositKind::Stripe => request
                .amount
                .mul_bps(self.fee_bps)
                .map_err(|e| ApiError::Internal(e.to_string()))?,
            DepositKind::DirectChain => Money::ZERO,
        };
        let net = request
            .amount
            .checked_sub(fee)
            .map_err(|_| ApiError::Validation("deposit amount below the fee".into()))?;
        if net.is_zero() {
            return Err(ApiError::Validation("deposit amount below the fee".into()));
        }
        if request.provider == DepositKind::DirectChain && request.network.is_none() {
            return Err(ApiError::Validation(
                "direct-chain deposits require a network".into(),
            ));
        }

        let deposit = self
            .deposits
            .create_deposit(NewDeposit {
                account_id,
                provider: request.provider.as_str().to_string(),
                network: request.network.map(|n| n.to_string()),
                gross_amount: request.amount,
                fee_amount: fee,
                net_amount: net,
                metadata: json!({}),
            })
            .await
            .map_err(store_err)?;

        let checkout_url = match request.provider {
            DepositKind::Stripe => {
                let provider = self.provider.as_ref().ok_or_else(|| {
                    ApiError::Upstream("card deposits are not configured".into())
                })?;
                let session = provider
                    .create_checkout(deposit.id, deposit.gross_amount)
                    .await
                    .map_err(|e| ApiError::Upstream(e.to_string()))?;
                self.deposits
                    .bind_provider_session(deposit.id, &session.id)
                    .await
                    .map_err(store_err)?;
                session.url
            }
            DepositKind::DirectChain => None,
        };

        Ok(CreatedDeposit {
            deposit_id: deposit.id,
            status: "pending",
            gross_amount: deposit.gross_amount,
            fee_amount: deposit.fee_amount,
            net_amount: deposit.net_amount,
            checkout_url,
        })
    }

    pub async fn list(&self, account_id: Uuid, limit: i64) -> Result<Vec<Deposit>, ApiError> {
        self.deposits
            .list_deposits(account_id, limit)
            .await
            .map_err(store_err)
    }
}

fn store_err(err: DepositError) -> ApiError {
    match err {
        DepositError::NotFound => ApiError::NotFound("deposit not found".into()),
        other => ApiError::Internal(other.to_string()),
    }
}
