//! Wire types for the in-band payment protocol.
//!
//! A paid route challenges unpaid requests with HTTP 402 and a structured
//! body naming the price, recipient wallet and supported networks. The
//! client retries with an `X-Payment` header whose value is
//! `x402;<base64 JSON>` carrying a [`PaymentPayload`]: a prepared, signed
//! transaction plus the metadata the facilitator needs to verify and settle
//! it. After service is rendered, the settle receipt travels back in the
//! `X-Payment-Response` header as base64 JSON.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;
use std::time::{SystemTime, SystemTimeError};
use uuid::Uuid;

use crate::money::Money;

/// Name of the request header carrying the payment payload.
pub const PAYMENT_HEADER: &str = "X-Payment";

/// Name of the response header carrying the settle receipt.
pub const PAYMENT_RESPONSE_HEADER: &str = "X-Payment-Response";

/// Scheme tag inside the payment header value.
const HEADER_SCHEME_PREFIX: &str = "x402;";

/// Payment schemes. Only the x402 exact-amount scheme is spoken here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheme {
    #[serde(rename = "x402")]
    X402,
}

impl Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x402")
    }
}

/// Settlement networks this gateway accepts payments on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Network {
    Base,
    BaseSepolia,
    Solana,
    SolanaDevnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Base => "base",
            Network::BaseSepolia => "base-sepolia",
            Network::Solana => "solana",
            Network::SolanaDevnet => "solana-devnet",
        }
    }

    /// Chain family, which decides how wallet balances are read.
    pub fn is_evm(&self) -> bool {
        matches!(self, Network::Base | Network::BaseSepolia)
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown network: {0}")]
pub struct UnknownNetwork(String);

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base" => Ok(Network::Base),
            "base-sepolia" => Ok(Network::BaseSepolia),
            "solana" => Ok(Network::Solana),
            "solana-devnet" => Ok(Network::SolanaDevnet),
            other => Err(UnknownNetwork(other.to_string())),
        }
    }
}

/// A wallet or token address on any supported chain.
///
/// EVM addresses are 0x-prefixed 40-hex-char strings; Solana addresses are
/// base58. Validation here is shape-only; the facilitator is authoritative
/// for whether an address exists on chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainAddress(String);

static EVM_ADDRESS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("invalid EVM address regex"));
static SOLANA_ADDRESS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").expect("invalid base58 regex"));

#[derive(Debug, thiserror::Error)]
#[error("address is neither 0x-hex nor base58: {0:?}")]
pub struct ChainAddressError(String);

impl ChainAddress {
    pub fn parse(input: &str) -> Result<Self, ChainAddressError> {
        if EVM_ADDRESS_REGEX.is_match(input) || SOLANA_ADDRESS_REGEX.is_match(input) {
            Ok(ChainAddress(input.to_string()))
        } else {
            Err(ChainAddressError(input.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChainAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChainAddress {
    type Err = ChainAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainAddress::parse(s)
    }
}

impl Serialize for ChainAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ChainAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChainAddress::parse(&s).map_err(Error::custom)
    }
}

/// A 32-byte random nonce, 0x-prefixed hex, exactly 64 hex characters.
///
/// One nonce funds at most one execution: it is the replay fingerprint for
/// header-paid requests, and the facilitator independently rejects nonce
/// reuse on chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PaymentNonce(pub [u8; 32]);

static NONCE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("invalid nonce regex"));

impl PaymentNonce {
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PaymentNonce {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if !NONCE_REGEX.is_match(&s) {
            return Err(Error::custom(
                "invalid nonce: must be 0x-prefixed and 64 hex chars",
            ));
        }
        let bytes = hex::decode(&s[2..]).map_err(|_| Error::custom("invalid hex in nonce"))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::custom("nonce must be exactly 32 bytes"))?;
        Ok(PaymentNonce(array))
    }
}

impl Serialize for PaymentNonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Seconds since the Unix epoch, carried as a JSON number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnixTimestamp(pub u64);

impl UnixTimestamp {
    pub fn try_now() -> Result<Self, SystemTimeError> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_secs();
        Ok(Self(now))
    }

    /// Whether `self` is within `tolerance_seconds` of `now`, in either
    /// direction. Clock skew between client and server is expected; replay
    /// of an old header is not.
    pub fn within_tolerance(&self, now: UnixTimestamp, tolerance_seconds: u64) -> bool {
        now.0.abs_diff(self.0) <= tolerance_seconds
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An amount of micro-units carried as a decimal string on the wire.
///
/// The header amount is denominated in micro-USDC, so `"1000"` pays for a
/// 0.001 USDC route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicAmount(pub u64);

const MAX_ATOMIC_DIGITS: usize = 18;

impl<'de> Deserialize<'de> for AtomicAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.len() > MAX_ATOMIC_DIGITS {
            return Err(Error::custom(format!(
                "amount too long (max {MAX_ATOMIC_DIGITS} digits)"
            )));
        }
        let value = s
            .parse::<u64>()
            .map_err(|_| Error::custom("amount is not a non-negative integer"))?;
        Ok(AtomicAmount(value))
    }
}

impl Serialize for AtomicAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl From<Money> for AtomicAmount {
    fn from(money: Money) -> Self {
        AtomicAmount(money.micros() as u64)
    }
}

/// The decoded `X-Payment` header body.
///
/// `transaction` is a provider-specific prepared-and-signed transaction;
/// this gateway never inspects it, only relays it to the facilitator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub network: Network,
    pub scheme: Scheme,
    pub payer: ChainAddress,
    pub receiver: ChainAddress,
    pub token_address: ChainAddress,
    pub amount: AtomicAmount,
    pub timestamp: UnixTimestamp,
    pub nonce: PaymentNonce,
    pub transaction: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentHeaderError {
    #[error("header value is not `x402;<base64>`")]
    MissingSchemeTag,
    #[error("invalid base64 in payment header")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid payment payload JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl PaymentPayload {
    /// Parses a raw `X-Payment` header value.
    pub fn from_header(value: &[u8]) -> Result<Self, PaymentHeaderError> {
        let value = std::str::from_utf8(value).map_err(|_| PaymentHeaderError::MissingSchemeTag)?;
        let encoded = value
            .strip_prefix(HEADER_SCHEME_PREFIX)
            .ok_or(PaymentHeaderError::MissingSchemeTag)?;
        let raw = BASE64.decode(encoded.as_bytes())?;
        let payload = serde_json::from_slice(&raw)?;
        Ok(payload)
    }

    /// Encodes this payload into an `X-Payment` header value. Used by tests
    /// and by clients built against this crate.
    pub fn to_header(&self) -> String {
        let json = serde_json::to_vec(self).expect("payment payload serializes");
        format!("{HEADER_SCHEME_PREFIX}{}", BASE64.encode(&json))
    }
}

/// One entry in the 402 challenge: a way the route can be paid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOffer {
    pub scheme: Scheme,
    pub network: Network,
    pub recipient: ChainAddress,
    pub amount: Money,
    pub token_address: ChainAddress,
    pub currency: String,
}

/// Body of the 402 challenge response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentChallenge {
    pub accepts: Vec<PaymentOffer>,
    pub request_id: Uuid,
}

/// What the facilitator is asked to check before service is rendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub payment_payload: PaymentPayload,
    pub requirements: PaymentOffer,
}

/// Facilitator verdict on a proposed payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<ChainAddress>,
}

/// Settle call payload. Same shape as verify: the facilitator
/// re-validates before broadcasting.
pub type SettleRequest = VerifyRequest;

/// Facilitator settlement outcome, surfaced to the client as the
/// `X-Payment-Response` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    pub network: Network,
}

impl SettleResponse {
    /// Encodes the receipt as a base64 JSON header value.
    pub fn to_header(&self) -> String {
        let json = serde_json::to_vec(self).expect("settle response serializes");
        BASE64.encode(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> PaymentPayload {
        PaymentPayload {
            network: Network::BaseSepolia,
            scheme: Scheme::X402,
            payer: ChainAddress::parse("0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045").unwrap(),
            receiver: ChainAddress::parse("0x209693Bc6afc0C5328bA36FaF03C514EF312287C").unwrap(),
            token_address: ChainAddress::parse("0x036CbD53842c5426634e7929541eC2318f3dCF7e")
                .unwrap(),
            amount: AtomicAmount(1_000),
            timestamp: UnixTimestamp(1_700_000_000),
            nonce: PaymentNonce([7u8; 32]),
            transaction: "AQIDBA==".to_string(),
        }
    }

    #[test]
    fn header_round_trip() {
        let payload = sample_payload();
        let header = payload.to_header();
        assert!(header.starts_with("x402;"));
        let parsed = PaymentPayload::from_header(header.as_bytes()).unwrap();
        assert_eq!(parsed.network, Network::BaseSepolia);
        assert_eq!(parsed.amount, AtomicAmount(1_000));
        assert_eq!(parsed.nonce, payload.nonce);
        assert_eq!(parsed.payer.as_str(), payload.payer.as_str());
    }

    #[test]
    fn header_requires_scheme_tag() {
        let payload = sample_payload();
        let json = serde_json::to_vec(&payload).unwrap();
        let bare = BASE64.encode(&json);
        assert!(matches!(
            PaymentPayload::from_header(bare.as_bytes()),
            Err(PaymentHeaderError::MissingSchemeTag)
        ));
    }

    #[test]
    fn payload_wire_form_is_camel_case() {
        let json = serde_json::to_value(sample_payload()).unwrap();
        assert!(json.get("tokenAddress").is_some());
        assert_eq!(json["amount"], "1000");
        assert_eq!(json["scheme"], "x402");
        assert_eq!(json["network"], "base-sepolia");
        assert_eq!(
            json["nonce"].as_str().unwrap(),
            format!("0x{}", "07".repeat(32))
        );
    }

    #[test]
    fn nonce_rejects_malformed_hex() {
        let err: Result<PaymentNonce, _> = serde_json::from_str("\"0x1234\"");
        assert!(err.is_err());
        let err: Result<PaymentNonce, _> =
            serde_json::from_str(&format!("\"{}\"", "zz".repeat(33)));
        assert!(err.is_err());
    }

    #[test]
    fn timestamp_tolerance_is_symmetric() {
        let now = UnixTimestamp(1_000);
        assert!(UnixTimestamp(940).within_tolerance(now, 60));
        assert!(UnixTimestamp(1_060).within_tolerance(now, 60));
        assert!(!UnixTimestamp(939).within_tolerance(now, 60));
        assert!(!UnixTimestamp(1_061).within_tolerance(now, 60));
    }

    #[test]
    fn challenge_names_price_and_recipient() {
        let challenge = PaymentChallenge {
            accepts: vec![PaymentOffer {
                scheme: Scheme::X402,
                network: Network::Base,
                recipient: ChainAddress::parse("0x209693Bc6afc0C5328bA36FaF03C514EF312287C")
                    .unwrap(),
                amount: Money::parse("0.001").unwrap(),
                token_address: ChainAddress::parse(
                    "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
                )
                .unwrap(),
                currency: "USDC".to_string(),
            }],
            request_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&challenge).unwrap();
        assert_eq!(json["accepts"][0]["amount"], "0.001000");
        assert_eq!(json["accepts"][0]["currency"], "USDC");
        assert!(json.get("request_id").is_some());
    }

    #[test]
    fn settle_receipt_header_is_base64_json() {
        let settle = SettleResponse {
            success: true,
            error_reason: None,
            receipt_id: Some("rcpt_123".to_string()),
            transaction: Some("0xabc".to_string()),
            network: Network::Base,
        };
        let header = settle.to_header();
        let decoded = BASE64.decode(header.as_bytes()).unwrap();
        let parsed: SettleResponse = serde_json::from_slice(&decoded).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.receipt_id.as_deref(), Some("rcpt_123"));
    }
}
