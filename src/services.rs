//! Top-down service wiring.
//!
//! Handlers, the pipeline and the auth middleware all refer to each other's
//! concerns; the cycle is broken by assembling everything once into a
//! single [`Services`] struct injected as Axum state. Handlers hold trait
//! objects, not concrete stores, so the pipeline tests swap in in-memory
//! fakes without touching HTTP.

use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use crate::auth::AuthResolver;
use crate::balances::BalanceReader;
use crate::config::{Config, PriceTable};
use crate::deposits::DepositService;
use crate::facilitator::{Facilitator, FacilitatorClient, FacilitatorError};
use crate::pipeline::{Paygate, SettleRetrier};
use crate::proto::Network;
use crate::scanner::{RuleScanner, Scanner};
use crate::store::PgStore;
use crate::store::account::AccountStore;
use crate::store::apikey::ApiKeyStore;
use crate::store::ledger::LedgerOps;
use crate::store::payment::PaymentStore;
use crate::store::usage::UsageRecorder;
use crate::stripe::{DepositProvider, StripeClient};
use crate::webhook::WebhookIntake;

pub struct Services {
    pub accounts: Arc<dyn AccountStore>,
    pub ledger: Arc<dyn LedgerOps>,
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub usage: Arc<dyn UsageRecorder>,
    pub facilitator: Arc<dyn Facilitator>,
    pub auth: AuthResolver,
    pub paygate: Paygate,
    pub deposits: DepositService,
    pub webhooks: WebhookIntake,
    pub balances: BalanceReader,
    pub store: PgStore,
    pub api_key_cap: i64,
}

impl Services {
    /// Builds the full production graph from configuration and a connected
    /// store.
    pub fn build(config: &Config, store: PgStore) -> Result<(Self, SettleRetrier), FacilitatorError> {
        let pricing = PriceTable::from_config(config);

        let facilitator: Arc<dyn Facilitator> = Arc::new(FacilitatorClient::try_new(
            config.facilitator_url.clone(),
            config.facilitator_timeout(),
        )?);

        let accounts: Arc<dyn AccountStore> = Arc::new(store.clone());
        let ledger: Arc<dyn LedgerOps> = Arc::new(store.clone());
        let api_keys: Arc<dyn ApiKeyStore> = Arc::new(store.clone());
        let payments: Arc<dyn PaymentStore> = Arc::new(store.clone());
        let usage: Arc<dyn UsageRecorder> = Arc::new(store.clone());
        let scanner: Arc<dyn Scanner> = Arc::new(RuleScanner);

        let auth = AuthResolver::new(Arc::clone(&api_keys), Arc::clone(&accounts));

        let paygate = Paygate::new(
            Arc::clone(&ledger),
            Arc::clone(&payments),
            Arc::clone(&facilitator),
            scanner,
            Arc::clone(&usage),
            pricing,
            config.payment_timestamp_tolerance_seconds,
            config.settle_retry_base_seconds as i64,
            config.max_scan_bytes,
        );

        let provider: Option<Arc<dyn DepositProvider>> =
            config.stripe_secret_key.as_ref().map(|secret| {
                Arc::new(StripeClient::new(
                    secret.clone(),
                    config.stripe_success_url.clone(),
                    config.stripe_cancel_url.clone(),
                )) as Arc<dyn DepositProvider>
            });
        let deposits = DepositService::new(
            Arc::new(store.clone()),
            provider,
            config.deposit_fee_bps,
        );

        let webhooks = WebhookIntake::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            config.stripe_webhook_secret.clone(),
            config.webhook_tolerance_seconds,
        );

        let mut rpc_urls: HashMap<Network, Url> = HashMap::new();
        if let Some(url) = &config.rpc_url_base {
            rpc_urls.insert(Network::Base, url.clone());
        }
        if let Some(url) = &config.rpc_url_solana {
            rpc_urls.insert(Network::Solana, url.clone());
        }
        let balances = BalanceReader::new(
            rpc_urls,
            config.token_addresses(),
            config.balance_read_timeout(),
        );

        let retrier = SettleRetrier::new(
            payments,
            Arc::clone(&facilitator),
            std::time::Duration::from_secs(config.settle_retry_interval_seconds),
            config.settle_retry_base_seconds as i64,
            config.settle_retry_cap_seconds as i64,
        );

        Ok((
            Self {
                accounts,
                ledger,
                api_keys,
                usage,
                facilitator,
                auth,
                paygate,
                deposits,
                webhooks,
                balances,
                store,
                api_key_cap: config.api_key_cap,
            },
            retrier,
        ))
    }
}
