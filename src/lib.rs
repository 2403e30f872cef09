//! Paid scan gateway.
//!
//! An HTTP API that sells per-request access to scan operations
//! (prompt-injection and credential-leak detection) and charges callers in
//! USDC, either through an in-band x402 payment header settled by an
//! external facilitator or against a pre-funded account balance held in an
//! internal ledger.
//!
//! # Modules
//!
//! - [`auth`] — API-key resolution: presented secret → account.
//! - [`balances`] — per-chain wallet USDC balance reads over JSON-RPC.
//! - [`config`] — environment-driven configuration and the route price table.
//! - [`deposits`] — deposit creation; funding intents completed by webhooks.
//! - [`error`] — the user-visible error taxonomy, mapped to HTTP once.
//! - [`facilitator`] — the remote verify/settle service client.
//! - [`handlers`] — route registration and request/response binding.
//! - [`money`] — fixed-point USDC micro-unit arithmetic.
//! - [`pipeline`] — the paid-request pipeline: hold → verify → execute →
//!   record → settle, with exactly-once delivery and replay.
//! - [`proto`] — wire types for the payment header, 402 challenge and
//!   settle receipt.
//! - [`request_id`] — `X-Request-Id` middleware.
//! - [`scanner`] — the scan engine seam and the rule-table engine.
//! - [`services`] — top-down wiring of the service graph.
//! - [`shutdown`] — signal handling that drains background workers.
//! - [`store`] — Postgres persistence: ledger, deposits, payment
//!   transactions, webhook claims, API keys, usage.
//! - [`stripe`] — Stripe checkout sessions and webhook signatures.
//! - [`telemetry`] — tracing and OpenTelemetry initialization.
//! - [`webhook`] — provider webhook intake with exactly-once claims.

pub mod auth;
pub mod balances;
pub mod config;
pub mod deposits;
pub mod error;
pub mod facilitator;
pub mod handlers;
pub mod money;
pub mod pipeline;
pub mod proto;
pub mod request_id;
pub mod scanner;
pub mod services;
pub mod shutdown;
pub mod store;
pub mod stripe;
pub mod telemetry;
pub mod webhook;
