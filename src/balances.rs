//! Wallet USDC balance reads.
//!
//! `GET /v1/account/balances` fans out one task per linked wallet chain
//! and joins them under a single deadline. A chain that fails or times out
//! contributes a per-chain error entry; it never fails the request.
//!
//! Reads are plain JSON-RPC: `eth_call` of `balanceOf(address)` on EVM
//! chains, `getTokenAccountsByOwner` on Solana. USDC carries six decimals
//! on every supported chain, so atomic token units are micro-units.

use futures_util::future::join_all;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use crate::money::Money;
use crate::proto::{ChainAddress, Network};

/// `balanceOf(address)` selector.
const BALANCE_OF_SELECTOR: &str = "70a08231";

#[derive(Debug, Clone, Serialize)]
pub struct ChainBalance {
    pub network: Network,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct BalanceReader {
    client: Client,
    rpc_urls: HashMap<Network, Url>,
    tokens: HashMap<Network, ChainAddress>,
    deadline: Duration,
}

impl BalanceReader {
    pub fn new(
        rpc_urls: HashMap<Network, Url>,
        tokens: HashMap<Network, ChainAddress>,
        deadline: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            rpc_urls,
            tokens,
            deadline,
        }
    }

    /// Reads every linked wallet concurrently. Output order follows input
    /// order.
    pub async fn read_all(&self, wallets: &HashMap<Network, String>) -> Vec<ChainBalance> {
        let reads = wallets.iter().map(|(network, address)| {
            let network = *network;
            let address = address.clone();
            async move {
                let result =
                    tokio::time::timeout(self.deadline, self.read_one(network, &address)).await;
                match result {
                    Ok(Ok(balance)) => ChainBalance {
                        network,
                        address,
                        balance: Some(balance),
                        error: None,
                    },
                    Ok(Err(reason)) => ChainBalance {
                        network,
                        address,
                        balance: None,
                        error: Some(reason),
                    },
                    Err(_) => ChainBalance {
                        network,
                        address,
                        balance: None,
                        error: Some("balance read timed out".to_string()),
                    },
                }
            }
        });
        join_all(reads).await
    }

    async fn read_one(&self, network: Network, address: &str) -> Result<Money, String> {
        let rpc_url = self
            .rpc_urls
            .get(&network)
            .ok_or_else(|| format!("no RPC endpoint configured for {network}"))?;
        let token = self
            .tokens
            .get(&network)
            .ok_or_else(|| format!("no USDC deployment known for {network}"))?;
        if network.is_evm() {
            self.read_evm(rpc_url, token, address).await
        } else {
            self.read_solana(rpc_url, token, address).await
        }
    }

    async fn read_evm(
        &self,
        rpc_url: &Url,
        token: &ChainAddress,
        address: &str,
    ) -> Result<Money, String> {
        let data = evm_balance_of_calldata(address)?;
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [{ "to": token.as_str(), "data": data }, "latest"]
        });
        let response = self.rpc_call(rpc_url, &request).await?;
        let result = response
            .get("result")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("eth_call error: {response}"))?;
        let micros = parse_evm_quantity(result)?;
        Money::from_micros(micros).map_err(|e| e.to_string())
    }

    async fn read_solana(
        &self,
        rpc_url: &Url,
        token: &ChainAddress,
        address: &str,
    ) -> Result<Money, String> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getTokenAccountsByOwner",
            "params": [
                address,
                { "mint": token.as_str() },
                { "encoding": "jsonParsed" }
            ]
        });
        let response = self.rpc_call(rpc_url, &request).await?;
        let accounts = response
            .pointer("/result/value")
            .and_then(Value::as_array)
            .ok_or_else(|| format!("getTokenAccountsByOwner error: {response}"))?;
        let mut total: i64 = 0;
        for account in accounts {
            let amount = account
                .pointer("/account/data/parsed/info/tokenAmount/amount")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            total = total.checked_add(amount).ok_or("balance overflow")?;
        }
        Money::from_micros(total).map_err(|e| e.to_string())
    }

    async fn rpc_call(&self, rpc_url: &Url, request: &Value) -> Result<Value, String> {
        let response = self
            .client
            .post(rpc_url.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| format!("rpc transport error: {e}"))?;
        response
            .json::<Value>()
            .await
            .map_err(|e| format!("rpc decode error: {e}"))
    }
}

/// ABI-encodes a `balanceOf(address)` call: 4-byte selector plus the
/// address left-padded to 32 bytes.
fn evm_balance_of_calldata(address: &str) -> Result<String, String> {
    let bare = address
        .strip_prefix("0x")
        .ok_or("EVM address must be 0x-prefixed")?;
    if bare.len() != 40 || !bare.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err("EVM address must be 20 hex bytes".to_string());
    }
    Ok(format!(
        "0x{BALANCE_OF_SELECTOR}{}{}",
        "0".repeat(24),
        bare.to_lowercase()
    ))
}

/// Parses a 0x-hex quantity from an `eth_call` result.
fn parse_evm_quantity(result: &str) -> Result<i64, String> {
    let bare = result.strip_prefix("0x").unwrap_or(result);
    let bare = bare.trim_start_matches('0');
    if bare.is_empty() {
        return Ok(0);
    }
    i64::from_str_radix(bare, 16).map_err(|_| format!("balance out of range: {result}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calldata_is_selector_plus_padded_address() {
        let data =
            evm_balance_of_calldata("0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045").unwrap();
        assert_eq!(data.len(), 2 + 8 + 64);
        assert!(data.starts_with("0x70a08231"));
        assert!(data.ends_with("d8da6bf26964af9d7eed9e03e53415d37aa96045"));
    }

    #[test]
    fn rejects_malformed_evm_address() {
        assert!(evm_balance_of_calldata("d8dA6BF26964aF9D7eEd9e03E53415D37aA96045").is_err());
        assert!(evm_balance_of_calldata("0x1234").is_err());
    }

    #[test]
    fn parses_eth_call_quantities() {
        assert_eq!(parse_evm_quantity("0x0").unwrap(), 0);
        assert_eq!(
            parse_evm_quantity(
                "0x00000000000000000000000000000000000000000000000000000000000f4240"
            )
            .unwrap(),
            1_000_000
        );
    }
}
