//! Configuration for the scan gateway.
//!
//! Everything is environment-driven: the binary takes no positional
//! arguments, and every knob below maps to one env var. Missing required
//! values fail startup with a non-zero exit. `.env` files are honored via
//! `dotenvy` in `main`.

use clap::Parser;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use url::Url;

use crate::money::Money;
use crate::proto::{ChainAddress, Network};

/// Known USDC deployments per network, used when no override is provided.
fn default_token_address(network: Network) -> &'static str {
    match network {
        Network::Base => "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
        Network::BaseSepolia => "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
        Network::Solana => "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
        Network::SolanaDevnet => "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU",
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "scangate")]
#[command(about = "Paid scan gateway over HTTP 402 flows")]
pub struct Config {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 16)]
    pub db_max_connections: u32,

    /// Base URL of the remote x402 facilitator.
    #[arg(long, env = "FACILITATOR_URL")]
    pub facilitator_url: Url,

    /// End-to-end deadline for each facilitator call (verify or settle).
    #[arg(long, env = "FACILITATOR_TIMEOUT_SECONDS", default_value_t = 15)]
    pub facilitator_timeout_seconds: u64,

    #[arg(long, env = "STRIPE_SECRET_KEY")]
    pub stripe_secret_key: Option<String>,

    #[arg(long, env = "STRIPE_WEBHOOK_SECRET")]
    pub stripe_webhook_secret: Option<String>,

    #[arg(
        long,
        env = "STRIPE_SUCCESS_URL",
        default_value = "https://example.com/deposit/success"
    )]
    pub stripe_success_url: String,

    #[arg(
        long,
        env = "STRIPE_CANCEL_URL",
        default_value = "https://example.com/deposit/cancel"
    )]
    pub stripe_cancel_url: String,

    /// Receiving wallet per network. A network without a wallet is simply
    /// not offered in challenges.
    #[arg(long, env = "PAY_TO_BASE")]
    pub pay_to_base: Option<ChainAddress>,

    #[arg(long, env = "PAY_TO_BASE_SEPOLIA")]
    pub pay_to_base_sepolia: Option<ChainAddress>,

    #[arg(long, env = "PAY_TO_SOLANA")]
    pub pay_to_solana: Option<ChainAddress>,

    #[arg(long, env = "PAY_TO_SOLANA_DEVNET")]
    pub pay_to_solana_devnet: Option<ChainAddress>,

    /// JSON-RPC endpoints for wallet balance reads.
    #[arg(long, env = "RPC_URL_BASE")]
    pub rpc_url_base: Option<Url>,

    #[arg(long, env = "RPC_URL_SOLANA")]
    pub rpc_url_solana: Option<Url>,

    #[arg(long, env = "PRICE_SCAN_CONTENT", default_value = "0.001")]
    pub price_scan_content: Money,

    #[arg(long, env = "PRICE_SCAN_OUTPUT", default_value = "0.001")]
    pub price_scan_output: Money,

    /// Tolerance for payment header timestamps, either direction.
    #[arg(long, env = "PAYMENT_TIMESTAMP_TOLERANCE_SECONDS", default_value_t = 300)]
    pub payment_timestamp_tolerance_seconds: u64,

    /// Webhook events older than this are treated as replay and refused.
    #[arg(long, env = "WEBHOOK_TOLERANCE_SECONDS", default_value_t = 300)]
    pub webhook_tolerance_seconds: u64,

    #[arg(long, env = "SETTLE_RETRY_INTERVAL_SECONDS", default_value_t = 30)]
    pub settle_retry_interval_seconds: u64,

    /// First retry delay; doubles per attempt up to the cap.
    #[arg(long, env = "SETTLE_RETRY_BASE_SECONDS", default_value_t = 10)]
    pub settle_retry_base_seconds: u64,

    #[arg(long, env = "SETTLE_RETRY_CAP_SECONDS", default_value_t = 3600)]
    pub settle_retry_cap_seconds: u64,

    #[arg(long, env = "MAX_SCAN_BYTES", default_value_t = 262_144)]
    pub max_scan_bytes: usize,

    /// Active API keys allowed per account.
    #[arg(long, env = "API_KEY_CAP", default_value_t = 5)]
    pub api_key_cap: i64,

    /// Deposit fee in basis points applied to the gross amount.
    #[arg(long, env = "DEPOSIT_FEE_BPS", default_value_t = 350)]
    pub deposit_fee_bps: u32,

    /// Chain-balance fan-out deadline for `GET /v1/account/balances`.
    #[arg(long, env = "BALANCE_READ_TIMEOUT_SECONDS", default_value_t = 10)]
    pub balance_read_timeout_seconds: u64,

    /// Fraction of request traces exported when OTLP is enabled, 0.0–1.0.
    /// Paid traffic is low-volume; the default keeps every span.
    #[arg(long, env = "OTEL_TRACE_SAMPLE_RATIO", default_value_t = 1.0)]
    pub otel_trace_sample_ratio: f64,

    /// Metric push cadence when OTLP is enabled.
    #[arg(long, env = "OTEL_METRIC_INTERVAL_SECONDS", default_value_t = 60)]
    pub otel_metric_interval_seconds: u64,

    /// Deployment environment name stamped on exported telemetry.
    #[arg(long, env = "DEPLOYMENT_ENV", default_value = "develop")]
    pub deployment_env: String,
}

impl Config {
    pub fn load() -> Self {
        Config::parse()
    }

    pub fn facilitator_timeout(&self) -> Duration {
        Duration::from_secs(self.facilitator_timeout_seconds)
    }

    pub fn balance_read_timeout(&self) -> Duration {
        Duration::from_secs(self.balance_read_timeout_seconds)
    }

    /// Receiving wallets keyed by network, in challenge order.
    pub fn pay_to(&self) -> Vec<(Network, ChainAddress)> {
        let pairs = [
            (Network::Base, self.pay_to_base.clone()),
            (Network::BaseSepolia, self.pay_to_base_sepolia.clone()),
            (Network::Solana, self.pay_to_solana.clone()),
            (Network::SolanaDevnet, self.pay_to_solana_devnet.clone()),
        ];
        pairs
            .into_iter()
            .filter_map(|(network, wallet)| wallet.map(|w| (network, w)))
            .collect()
    }

    /// USDC token addresses per network the gateway is configured for.
    pub fn token_addresses(&self) -> HashMap<Network, ChainAddress> {
        self.pay_to()
            .into_iter()
            .map(|(network, _)| {
                let address = ChainAddress::parse(default_token_address(network))
                    .expect("known USDC deployments are valid addresses");
                (network, address)
            })
            .collect()
    }
}

/// Routes that cost money, and what they cost.
///
/// Built once at startup from [`Config`] and shared read-only; per-request
/// code never consults the environment.
#[derive(Debug, Clone)]
pub struct PriceTable {
    pub scan_content: Money,
    pub scan_output: Money,
    pub offers: Vec<(Network, ChainAddress, ChainAddress)>,
}

impl PriceTable {
    pub fn from_config(config: &Config) -> Self {
        let tokens = config.token_addresses();
        let offers = config
            .pay_to()
            .into_iter()
            .map(|(network, wallet)| {
                let token = tokens
                    .get(&network)
                    .expect("token address exists for each pay-to network")
                    .clone();
                (network, wallet, token)
            })
            .collect();
        Self {
            scan_content: config.price_scan_content,
            scan_output: config.price_scan_output,
            offers,
        }
    }
}
