//! The paid-request pipeline.
//!
//! Converts a bare POST into a charged, executed, recorded and settled
//! unit of work. The contract, in order of importance:
//!
//! 1. **No free service**: the scanner never runs unless a facilitator
//!    verification or a committed balance debit covers the exact price.
//! 2. **No double charge**: a payload nonce or a (account, request id)
//!    pair funds execution exactly once; later arrivals replay the stored
//!    result.
//! 3. **No silent success loss**: once execution commits, failures keep
//!    the charge and surface the result (or park settlement for retry),
//!    never a charged-but-unknown outcome.
//!
//! Phases: `held → verified → executing → executed → settled`, with
//! `pending_settle`, `failed` and `refunded` exits. The unique insert on
//! the fingerprint column is the only lock; every arrival for the same
//! logical request lands on one row.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PriceTable;
use crate::error::ApiError;
use crate::facilitator::Facilitator;
use crate::money::Money;
use crate::proto::{
    PaymentChallenge, PaymentOffer, PaymentPayload, Scheme, SettleRequest, SettleResponse,
    UnixTimestamp, VerifyRequest,
};
use crate::scanner::{ScanMode, Scanner};
use crate::store::ledger::{DebitOutcome, LedgerError, LedgerOps};
use crate::store::payment::{
    HoldOutcome, NewPaymentTransaction, PaymentStore, PaymentTransaction,
};
use crate::store::usage::{UsageRecord, UsageRecorder};

/// A non-terminal row whose last update is older than this is considered
/// abandoned (a crashed worker) and may be taken over by a new arrival
/// with the same fingerprint.
const STALE_TAKEOVER_SECONDS: i64 = 60;

/// The paid routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRoute {
    Content,
    Output,
}

impl ScanRoute {
    pub fn path(&self) -> &'static str {
        match self {
            ScanRoute::Content => "/v1/scan/content",
            ScanRoute::Output => "/v1/scan/output",
        }
    }

    pub fn mode(&self) -> ScanMode {
        match self {
            ScanRoute::Content => ScanMode::Content,
            ScanRoute::Output => ScanMode::Output,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScanRequestBody {
    pub text: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// A successful trip through the pipeline.
#[derive(Debug)]
pub struct PaidOutcome {
    pub request_id: Uuid,
    /// Response body, byte-identical across replays of one fingerprint.
    pub body: Value,
    /// Base64 settle receipt for the `X-Payment-Response` header; absent
    /// on the balance path and while settlement is pending.
    pub receipt_header: Option<String>,
    pub replayed: bool,
}

/// How this request is paying.
enum Funding {
    Header(Box<(PaymentPayload, PaymentOffer)>),
    Balance(Uuid),
}

impl Funding {
    fn payer(&self) -> String {
        match self {
            Funding::Header(boxed) => boxed.0.payer.to_string(),
            Funding::Balance(account_id) => format!("account:{account_id}"),
        }
    }

    fn account_id(&self) -> Option<Uuid> {
        match self {
            Funding::Header(_) => None,
            Funding::Balance(account_id) => Some(*account_id),
        }
    }
}

pub struct Paygate {
    ledger: Arc<dyn LedgerOps>,
    payments: Arc<dyn PaymentStore>,
    facilitator: Arc<dyn Facilitator>,
    scanner: Arc<dyn Scanner>,
    usage: Arc<dyn UsageRecorder>,
    pricing: PriceTable,
    timestamp_tolerance_seconds: u64,
    settle_retry_base_seconds: i64,
    max_scan_bytes: usize,
}

impl Paygate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn LedgerOps>,
        payments: Arc<dyn PaymentStore>,
        facilitator: Arc<dyn Facilitator>,
        scanner: Arc<dyn Scanner>,
        usage: Arc<dyn UsageRecorder>,
        pricing: PriceTable,
        timestamp_tolerance_seconds: u64,
        settle_retry_base_seconds: i64,
        max_scan_bytes: usize,
    ) -> Self {
        Self {
            ledger,
            payments,
            facilitator,
            scanner,
            usage,
            pricing,
            timestamp_tolerance_seconds,
            settle_retry_base_seconds,
            max_scan_bytes,
        }
    }

    pub fn price(&self, route: ScanRoute) -> Money {
        match route {
            ScanRoute::Content => self.pricing.scan_content,
            ScanRoute::Output => self.pricing.scan_output,
        }
    }

    /// The 402 challenge for a route: one offer per configured network.
    pub fn challenge(&self, route: ScanRoute, request_id: Uuid) -> PaymentChallenge {
        let amount = self.price(route);
        let accepts = self
            .pricing
            .offers
            .iter()
            .map(|(network, wallet, token)| PaymentOffer {
                scheme: Scheme::X402,
                network: *network,
                recipient: wallet.clone(),
                amount,
                token_address: token.clone(),
                currency: "USDC".to_string(),
            })
            .collect();
        PaymentChallenge {
            accepts,
            request_id,
        }
    }

    /// Drives one request through the pipeline.
    pub async fn handle_scan(
        &self,
        route: ScanRoute,
        account_id: Option<Uuid>,
        request_id: Uuid,
        payment_header: Option<&[u8]>,
        body: ScanRequestBody,
    ) -> Result<PaidOutcome, ApiError> {
        if body.text.is_empty() {
            return Err(ApiError::Validation("text must not be empty".into()));
        }
        if body.text.len() > self.max_scan_bytes {
            return Err(ApiError::Validation(format!(
                "text exceeds {} bytes",
                self.max_scan_bytes
            )));
        }
        let price = self.price(route);

        // CHALLENGE: no funding source at all.
        let funding = match payment_header {
            Some(header) => {
                let payload = PaymentPayload::from_header(header).map_err(|err| {
                    tracing::info!(%request_id, error = %err, "malformed payment header");
                    ApiError::PaymentRequired(Box::new(self.challenge(route, request_id)))
                })?;
                let offer = self.bind_offer(route, request_id, &payload, price)?;
                Funding::Header(Box::new((payload, offer)))
            }
            None => match account_id {
                Some(account_id) => Funding::Balance(account_id),
                None => {
                    return Err(ApiError::PaymentRequired(Box::new(
                        self.challenge(route, request_id),
                    )));
                }
            },
        };

        // ARRIVE → HELD. The fingerprint insert is the per-request lock.
        let fingerprint = fingerprint(&funding, route, price, request_id);
        let verify_request = match &funding {
            Funding::Header(boxed) => Some(VerifyRequest {
                payment_payload: boxed.0.clone(),
                requirements: boxed.1.clone(),
            }),
            Funding::Balance(_) => None,
        };
        let stored_payload = verify_request
            .as_ref()
            .map(|vr| serde_json::to_value(vr).expect("verify request serializes"));
        let hold = self
            .payments
            .hold(NewPaymentTransaction {
                request_id,
                fingerprint: fingerprint.clone(),
                route: route.path().to_string(),
                price,
                payer: funding.payer(),
                account_id: funding.account_id(),
                payment_payload: stored_payload,
            })
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        let txn = match hold {
            HoldOutcome::Held(txn) => txn,
            HoldOutcome::Existing(existing) => {
                if existing.phase.has_result() {
                    if let Some(result) = existing.result.clone() {
                        return Ok(self.replay(existing, result));
                    }
                }
                let age = Utc::now() - existing.updated_at;
                if age < ChronoDuration::seconds(STALE_TAKEOVER_SECONDS) {
                    return Err(ApiError::conflict(
                        "an identical request is already in flight",
                        "request_in_flight",
                    ));
                }
                // The previous worker died mid-pipeline. Resume its row:
                // the ledger ref and the facilitator nonce are both
                // idempotent, so re-driving the phases cannot double
                // charge.
                tracing::warn!(
                    request_id = %existing.request_id,
                    phase = existing.phase.as_str(),
                    "taking over abandoned payment transaction"
                );
                existing
            }
        };
        // From here on the row's request id is canonical; on takeover it is
        // the original arrival's id and the response echoes that one.
        let request_id = txn.request_id;

        // HELD → VERIFIED.
        match &funding {
            Funding::Header(_) => {
                let verify_request = verify_request.as_ref().expect("header funding has request");
                self.verify_header_payment(route, request_id, verify_request)
                    .await?;
            }
            Funding::Balance(account_id) => {
                self.debit_balance(route, request_id, *account_id, price)
                    .await?;
            }
        }
        self.payments
            .mark_verified(request_id)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        // VERIFIED → EXECUTING → EXECUTED.
        self.payments
            .mark_executing(request_id)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let started = Instant::now();
        let scan = self
            .scanner
            .scan(route.mode(), &body.text, body.metadata.as_ref())
            .await;
        let outcome = match scan {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(%request_id, error = %err, "scan execution failed");
                self.release_after_failed_execution(&funding, request_id, price)
                    .await;
                return Err(ApiError::Upstream("scan engine unavailable".into()));
            }
        };
        let latency_ms = started.elapsed().as_millis() as i64;

        let result_body = json!({
            "request_id": request_id,
            "mode": route.mode().as_str(),
            "decision": outcome.decision.as_str(),
            "scores": outcome.scores,
            "reason": outcome.reason,
            "sanitized_text": outcome.sanitized_text,
            "latency_ms": outcome.latency_ms,
            "model_version": outcome.model_version,
            "price": price,
        });
        // The result must be durable before settlement: a replay can only
        // be served from what this write persists.
        if let Err(err) = self.payments.store_result(request_id, &result_body).await {
            tracing::error!(%request_id, error = %err, "failed to persist execution result");
            self.release_after_failed_execution(&funding, request_id, price)
                .await;
            return Err(ApiError::Upstream("could not record result".into()));
        }

        // RECORD: best-effort usage log, off the response path.
        self.record_usage(route, request_id, funding.account_id(), price, &outcome, latency_ms);

        // EXECUTED → SETTLED (or PENDING_SETTLE).
        let receipt_header = match &funding {
            Funding::Balance(_) => {
                // The debit already committed; settlement is a no-op.
                let receipt = json!({ "method": "balance", "ref": request_id });
                if let Err(err) = self.payments.mark_settled(request_id, &receipt).await {
                    tracing::warn!(%request_id, error = %err, "failed to mark balance settlement");
                }
                None
            }
            Funding::Header(_) => {
                let settle_request = verify_request.as_ref().expect("header funding has request");
                self.settle_or_park(request_id, settle_request).await
            }
        };

        Ok(PaidOutcome {
            request_id,
            body: result_body,
            receipt_header,
            replayed: false,
        })
    }

    fn replay(&self, txn: PaymentTransaction, result: Value) -> PaidOutcome {
        tracing::info!(
            request_id = %txn.request_id,
            phase = txn.phase.as_str(),
            "replaying stored result"
        );
        let receipt_header = txn
            .receipt
            .and_then(|value| serde_json::from_value::<SettleResponse>(value).ok())
            .map(|receipt| receipt.to_header());
        PaidOutcome {
            request_id: txn.request_id,
            body: result,
            receipt_header,
            replayed: true,
        }
    }

    /// Binds the presented payload to the route's requirements before any
    /// facilitator call: network offered, receiver and token ours, amount
    /// exact, timestamp fresh.
    fn bind_offer(
        &self,
        route: ScanRoute,
        request_id: Uuid,
        payload: &PaymentPayload,
        price: Money,
    ) -> Result<PaymentOffer, ApiError> {
        let challenge = || Box::new(self.challenge(route, request_id));
        let offer = self
            .pricing
            .offers
            .iter()
            .find(|(network, _, _)| *network == payload.network)
            .map(|(network, wallet, token)| PaymentOffer {
                scheme: Scheme::X402,
                network: *network,
                recipient: wallet.clone(),
                amount: price,
                token_address: token.clone(),
                currency: "USDC".to_string(),
            })
            .ok_or_else(|| ApiError::PaymentRequired(challenge()))?;
        let reject = |reason: &str| ApiError::PaymentRejected {
            reason: reason.to_string(),
            challenge: challenge(),
        };
        if payload.receiver != offer.recipient {
            return Err(reject("receiver does not match the route's wallet"));
        }
        if payload.token_address != offer.token_address {
            return Err(reject("unsupported token for this route"));
        }
        if payload.amount.0 != price.micros() as u64 {
            return Err(reject("amount does not match the route price"));
        }
        let now = UnixTimestamp::try_now()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        if !payload
            .timestamp
            .within_tolerance(now, self.timestamp_tolerance_seconds)
        {
            return Err(reject("payment timestamp outside tolerance"));
        }
        Ok(offer)
    }

    async fn verify_header_payment(
        &self,
        route: ScanRoute,
        request_id: Uuid,
        verify_request: &VerifyRequest,
    ) -> Result<(), ApiError> {
        let verdict = self.facilitator.verify(verify_request).await;
        match verdict {
            Ok(response) if response.is_valid => Ok(()),
            Ok(response) => {
                self.quietly_fail(request_id).await;
                let reason = response
                    .invalid_reason
                    .unwrap_or_else(|| "payment rejected".to_string());
                Err(ApiError::PaymentRejected {
                    reason,
                    challenge: Box::new(self.challenge(route, request_id)),
                })
            }
            Err(err) if err.is_retryable() => {
                self.quietly_fail(request_id).await;
                Err(ApiError::Upstream(format!(
                    "payment verification unavailable: {err}"
                )))
            }
            Err(err) => {
                self.quietly_fail(request_id).await;
                Err(ApiError::PaymentRejected {
                    reason: err.to_string(),
                    challenge: Box::new(self.challenge(route, request_id)),
                })
            }
        }
    }

    async fn debit_balance(
        &self,
        route: ScanRoute,
        request_id: Uuid,
        account_id: Uuid,
        price: Money,
    ) -> Result<(), ApiError> {
        let reference = request_id.to_string();
        match self
            .ledger
            .debit_if_sufficient(account_id, price, &reference)
            .await
        {
            // AlreadyApplied happens on takeover of a crashed attempt that
            // had debited: the charge stands, execution proceeds.
            Ok(DebitOutcome::Applied { .. }) | Ok(DebitOutcome::AlreadyApplied { .. }) => Ok(()),
            Err(LedgerError::InsufficientFunds) => {
                self.quietly_fail(request_id).await;
                Err(ApiError::PaymentRequired(Box::new(
                    self.challenge(route, request_id),
                )))
            }
            Err(other) => {
                self.quietly_fail(request_id).await;
                Err(ApiError::Internal(other.to_string()))
            }
        }
    }

    /// Execute-fail: release the hold. A committed balance debit is undone
    /// by an explicit refund entry; a header payment was never settled, so
    /// failing the row is enough.
    async fn release_after_failed_execution(
        &self,
        funding: &Funding,
        request_id: Uuid,
        price: Money,
    ) {
        match funding {
            Funding::Balance(account_id) => {
                let reference = request_id.to_string();
                match self.ledger.refund(*account_id, &reference, price).await {
                    Ok(_) => {
                        if let Err(err) = self.payments.mark_refunded(request_id).await {
                            tracing::warn!(%request_id, error = %err, "failed to mark refund");
                        }
                    }
                    Err(err) => {
                        // The charge stands for reconciliation; never hide
                        // it behind a fake success.
                        tracing::error!(%request_id, error = %err, "refund after failed execution failed");
                        self.quietly_fail(request_id).await;
                    }
                }
            }
            Funding::Header(_) => {
                self.quietly_fail(request_id).await;
            }
        }
    }

    async fn settle_or_park(
        &self,
        request_id: Uuid,
        settle_request: &SettleRequest,
    ) -> Option<String> {
        match self.facilitator.settle(settle_request).await {
            Ok(response) if response.success => {
                let receipt =
                    serde_json::to_value(&response).expect("settle response serializes");
                match self.payments.mark_settled(request_id, &receipt).await {
                    Ok(()) => Some(response.to_header()),
                    Err(err) => {
                        tracing::error!(%request_id, error = %err, "failed to record settlement receipt");
                        self.park_settlement(request_id).await;
                        None
                    }
                }
            }
            // Any outcome not definitively observed as success (explicit
            // failure, timeout, transport error) parks the transaction.
            // The client still gets the result; the charge is preserved
            // and retried out of band.
            Ok(response) => {
                tracing::warn!(
                    %request_id,
                    reason = response.error_reason.as_deref().unwrap_or("unknown"),
                    "settlement reported failure, parking for retry"
                );
                self.park_settlement(request_id).await;
                None
            }
            Err(err) => {
                tracing::warn!(%request_id, error = %err, "settlement call failed, parking for retry");
                self.park_settlement(request_id).await;
                None
            }
        }
    }

    async fn park_settlement(&self, request_id: Uuid) {
        let next = Utc::now() + ChronoDuration::seconds(self.settle_retry_base_seconds);
        if let Err(err) = self.payments.mark_pending_settle(request_id, next).await {
            tracing::error!(%request_id, error = %err, "failed to park settlement");
        }
    }

    async fn quietly_fail(&self, request_id: Uuid) {
        if let Err(err) = self.payments.mark_failed(request_id).await {
            tracing::warn!(%request_id, error = %err, "failed to mark payment transaction failed");
        }
    }

    fn record_usage(
        &self,
        route: ScanRoute,
        request_id: Uuid,
        account_id: Option<Uuid>,
        price: Money,
        outcome: &crate::scanner::ScanOutcome,
        latency_ms: i64,
    ) {
        let usage = Arc::clone(&self.usage);
        let record = UsageRecord {
            account_id,
            route: route.path().to_string(),
            request_id,
            price,
            latency_ms,
            decision: outcome.decision.as_str().to_string(),
        };
        tokio::spawn(async move {
            if let Err(err) = usage.record(record).await {
                tracing::warn!(%request_id, error = %err, "usage record failed");
            }
        });
    }
}

/// Deterministic identifier collapsing every arrival of one logical
/// request onto one row: the payload nonce for header payments, the
/// client's request id for balance payments.
fn fingerprint(funding: &Funding, route: ScanRoute, price: Money, request_id: Uuid) -> String {
    use sha2::{Digest, Sha256};
    let key = match funding {
        Funding::Header(boxed) => boxed.0.nonce.to_hex(),
        Funding::Balance(_) => request_id.to_string(),
    };
    let mut hasher = Sha256::new();
    hasher.update(funding.payer().as_bytes());
    hasher.update(b"\n");
    hasher.update(route.path().as_bytes());
    hasher.update(b"\n");
    hasher.update(price.micros().to_be_bytes());
    hasher.update(b"\n");
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Background settlement retrier.
///
/// Re-drives `pending_settle` transactions with exponential backoff and
/// jitter until the facilitator definitively confirms, stopping on the
/// shutdown token.
pub struct SettleRetrier {
    payments: Arc<dyn PaymentStore>,
    facilitator: Arc<dyn Facilitator>,
    poll_interval: Duration,
    base_seconds: i64,
    cap_seconds: i64,
}

impl SettleRetrier {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        facilitator: Arc<dyn Facilitator>,
        poll_interval: Duration,
        base_seconds: i64,
        cap_seconds: i64,
    ) -> Self {
        Self {
            payments,
            facilitator,
            poll_interval,
            base_seconds,
            cap_seconds,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(interval = ?self.poll_interval, "settlement retrier started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            if let Err(err) = self.drain_due().await {
                tracing::warn!(error = %err, "settlement retry sweep failed");
            }
        }
        tracing::info!("settlement retrier stopped");
    }

    /// One sweep over due transactions. Public so tests can drive sweeps
    /// without the timer.
    pub async fn drain_due(&self) -> Result<usize, ApiError> {
        let due = self
            .payments
            .due_pending_settles(32)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let count = due.len();
        for txn in due {
            self.retry_one(txn).await;
        }
        Ok(count)
    }

    async fn retry_one(&self, txn: PaymentTransaction) {
        let request_id = txn.request_id;
        let Some(payload) = txn.payment_payload.clone() else {
            // Balance-path rows never park; a payloadless row here is an
            // invariant violation worth surfacing loudly.
            tracing::error!(%request_id, "pending_settle row without payment payload");
            return;
        };
        let settle_request: SettleRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(err) => {
                tracing::error!(%request_id, error = %err, "stored settle payload is unreadable");
                return;
            }
        };
        match self.facilitator.settle(&settle_request).await {
            Ok(response) if response.success => {
                let receipt =
                    serde_json::to_value(&response).expect("settle response serializes");
                match self.payments.mark_settled(request_id, &receipt).await {
                    Ok(()) => {
                        tracing::info!(
                            %request_id,
                            receipt_id = response.receipt_id.as_deref().unwrap_or(""),
                            attempts = txn.attempt_count,
                            "out-of-band settlement succeeded"
                        );
                    }
                    Err(err) => {
                        tracing::error!(%request_id, error = %err, "settled but failed to record receipt");
                    }
                }
            }
            outcome => {
                match &outcome {
                    Ok(response) => tracing::warn!(
                        %request_id,
                        reason = response.error_reason.as_deref().unwrap_or("unknown"),
                        "settlement retry refused"
                    ),
                    Err(err) => {
                        tracing::warn!(%request_id, error = %err, "settlement retry failed")
                    }
                }
                let delay = self.backoff(txn.attempt_count);
                if let Err(err) = self.payments.reschedule_settle(request_id, delay).await {
                    tracing::error!(%request_id, error = %err, "failed to reschedule settlement");
                }
            }
        }
    }

    fn backoff(&self, attempt: i32) -> ChronoDuration {
        let exp = attempt.clamp(0, 20) as u32;
        let raw = self
            .base_seconds
            .saturating_mul(2i64.saturating_pow(exp))
            .min(self.cap_seconds);
        let jitter = rand::rng().random_range(0..=self.base_seconds.max(1));
        ChronoDuration::seconds(raw + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facilitator::FacilitatorError;
    use crate::money::Money;
    use crate::proto::{
        AtomicAmount, ChainAddress, Network, PaymentNonce, VerifyResponse,
    };
    use crate::scanner::RuleScanner;
    use crate::store::StoreError;
    use crate::store::ledger::{CreditOutcome, EntryKind};
    use crate::store::payment::{PaymentPhase, PaymentStoreError};
    use crate::store::usage::{UsageBucket, UsageLogRow};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    // ------------------------------------------------------------------
    // In-memory fakes. They enforce the same invariants the database
    // does: unique (account, ref) on the ledger and a unique fingerprint
    // on payment transactions.
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct MemLedger {
        inner: Mutex<MemLedgerInner>,
    }

    #[derive(Default)]
    struct MemLedgerInner {
        balances: HashMap<Uuid, i64>,
        entries: Vec<(Uuid, i64, String)>,
    }

    impl MemLedger {
        fn with_balance(account_id: Uuid, balance: Money) -> Self {
            let ledger = MemLedger::default();
            ledger
                .inner
                .lock()
                .unwrap()
                .balances
                .insert(account_id, balance.micros());
            ledger
        }

        fn balance_of(&self, account_id: Uuid) -> i64 {
            *self
                .inner
                .lock()
                .unwrap()
                .balances
                .get(&account_id)
                .unwrap()
        }

        fn entry_count(&self, account_id: Uuid) -> usize {
            self.inner
                .lock()
                .unwrap()
                .entries
                .iter()
                .filter(|(a, _, _)| *a == account_id)
                .count()
        }

        /// The ledger invariant: entries sum to the balance delta.
        fn assert_consistent(&self, account_id: Uuid, initial: Money) {
            let inner = self.inner.lock().unwrap();
            let sum: i64 = inner
                .entries
                .iter()
                .filter(|(a, _, _)| *a == account_id)
                .map(|(_, amount, _)| amount)
                .sum();
            assert_eq!(
                initial.micros() + sum,
                *inner.balances.get(&account_id).unwrap()
            );
        }
    }

    #[async_trait]
    impl LedgerOps for MemLedger {
        async fn debit_if_sufficient(
            &self,
            account_id: Uuid,
            amount: Money,
            reference: &str,
        ) -> Result<DebitOutcome, LedgerError> {
            let mut inner = self.inner.lock().unwrap();
            let balance = *inner
                .balances
                .get(&account_id)
                .ok_or(LedgerError::UnknownAccount)?;
            if inner
                .entries
                .iter()
                .any(|(a, _, r)| *a == account_id && r == reference)
            {
                return Ok(DebitOutcome::AlreadyApplied {
                    balance: Money::from_micros(balance).unwrap(),
                });
            }
            if balance < amount.micros() {
                return Err(LedgerError::InsufficientFunds);
            }
            let new_balance = balance - amount.micros();
            inner.balances.insert(account_id, new_balance);
            inner
                .entries
                .push((account_id, -amount.micros(), reference.to_string()));
            Ok(DebitOutcome::Applied {
                new_balance: Money::from_micros(new_balance).unwrap(),
            })
        }

        async fn credit(
            &self,
            account_id: Uuid,
            amount: Money,
            reference: &str,
            _kind: EntryKind,
        ) -> Result<CreditOutcome, LedgerError> {
            let mut inner = self.inner.lock().unwrap();
            let balance = *inner
                .balances
                .get(&account_id)
                .ok_or(LedgerError::UnknownAccount)?;
            if inner
                .entries
                .iter()
                .any(|(a, _, r)| *a == account_id && r == reference)
            {
                return Ok(CreditOutcome::AlreadyApplied {
                    balance: Money::from_micros(balance).unwrap(),
                });
            }
            let new_balance = balance + amount.micros();
            inner.balances.insert(account_id, new_balance);
            inner
                .entries
                .push((account_id, amount.micros(), reference.to_string()));
            Ok(CreditOutcome::Applied {
                new_balance: Money::from_micros(new_balance).unwrap(),
            })
        }

        async fn refund(
            &self,
            account_id: Uuid,
            charge_reference: &str,
            amount: Money,
        ) -> Result<CreditOutcome, LedgerError> {
            let reference = format!("refund:{charge_reference}");
            self.credit(account_id, amount, &reference, EntryKind::Refund)
                .await
        }

        async fn balance(&self, account_id: Uuid) -> Result<Money, LedgerError> {
            Ok(Money::from_micros(self.balance_of(account_id)).unwrap())
        }
    }

    #[derive(Default)]
    struct MemPayments {
        rows: Mutex<HashMap<String, PaymentTransaction>>,
    }

    impl MemPayments {
        fn by_request(&self, request_id: Uuid) -> Option<PaymentTransaction> {
            self.rows
                .lock()
                .unwrap()
                .values()
                .find(|t| t.request_id == request_id)
                .cloned()
        }

        fn update<F: FnOnce(&mut PaymentTransaction)>(
            &self,
            request_id: Uuid,
            apply: F,
        ) -> Result<(), PaymentStoreError> {
            let mut rows = self.rows.lock().unwrap();
            let txn = rows
                .values_mut()
                .find(|t| t.request_id == request_id)
                .ok_or(PaymentStoreError::NotFound)?;
            apply(txn);
            txn.updated_at = Utc::now();
            Ok(())
        }
    }

    #[async_trait]
    impl PaymentStore for MemPayments {
        async fn hold(
            &self,
            new: NewPaymentTransaction,
        ) -> Result<HoldOutcome, PaymentStoreError> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(existing) = rows.get(&new.fingerprint) {
                return Ok(HoldOutcome::Existing(existing.clone()));
            }
            let now = Utc::now();
            let txn = PaymentTransaction {
                request_id: new.request_id,
                fingerprint: new.fingerprint.clone(),
                route: new.route,
                price: new.price,
                payer: new.payer,
                account_id: new.account_id,
                phase: PaymentPhase::Held,
                attempt_count: 0,
                verified_at: None,
                payment_payload: new.payment_payload,
                result: None,
                receipt: None,
                next_retry_at: None,
                created_at: now,
                updated_at: now,
            };
            rows.insert(new.fingerprint, txn.clone());
            Ok(HoldOutcome::Held(txn))
        }

        async fn mark_verified(&self, request_id: Uuid) -> Result<(), PaymentStoreError> {
            self.update(request_id, |t| {
                t.phase = PaymentPhase::Verified;
                t.verified_at = Some(Utc::now());
            })
        }

        async fn mark_executing(&self, request_id: Uuid) -> Result<(), PaymentStoreError> {
            self.update(request_id, |t| t.phase = PaymentPhase::Executing)
        }

        async fn store_result(
            &self,
            request_id: Uuid,
            result: &Value,
        ) -> Result<(), PaymentStoreError> {
            let result = result.clone();
            self.update(request_id, move |t| {
                t.phase = PaymentPhase::Executed;
                t.result = Some(result);
            })
        }

        async fn mark_settled(
            &self,
            request_id: Uuid,
            receipt: &Value,
        ) -> Result<(), PaymentStoreError> {
            let receipt = receipt.clone();
            self.update(request_id, move |t| {
                t.phase = PaymentPhase::Settled;
                t.receipt = Some(receipt);
                t.next_retry_at = None;
            })
        }

        async fn mark_pending_settle(
            &self,
            request_id: Uuid,
            next_retry_at: chrono::DateTime<Utc>,
        ) -> Result<(), PaymentStoreError> {
            self.update(request_id, move |t| {
                t.phase = PaymentPhase::PendingSettle;
                t.next_retry_at = Some(next_retry_at);
            })
        }

        async fn mark_failed(&self, request_id: Uuid) -> Result<(), PaymentStoreError> {
            self.update(request_id, |t| t.phase = PaymentPhase::Failed)
        }

        async fn mark_refunded(&self, request_id: Uuid) -> Result<(), PaymentStoreError> {
            self.update(request_id, |t| t.phase = PaymentPhase::Refunded)
        }

        async fn due_pending_settles(
            &self,
            limit: i64,
        ) -> Result<Vec<PaymentTransaction>, PaymentStoreError> {
            let now = Utc::now();
            let mut due: Vec<_> = self
                .rows
                .lock()
                .unwrap()
                .values()
                .filter(|t| {
                    t.phase == PaymentPhase::PendingSettle
                        && t.next_retry_at.is_some_and(|at| at <= now)
                })
                .cloned()
                .collect();
            due.truncate(limit as usize);
            Ok(due)
        }

        async fn reschedule_settle(
            &self,
            request_id: Uuid,
            delay: ChronoDuration,
        ) -> Result<(), PaymentStoreError> {
            self.update(request_id, move |t| {
                t.attempt_count += 1;
                t.next_retry_at = Some(Utc::now() + delay);
            })
        }
    }

    #[derive(Default)]
    struct StubFacilitator {
        verify_results: Mutex<VecDeque<Result<VerifyResponse, FacilitatorError>>>,
        settle_results: Mutex<VecDeque<Result<SettleResponse, FacilitatorError>>>,
        verify_calls: Mutex<u32>,
        settle_calls: Mutex<u32>,
    }

    impl StubFacilitator {
        fn queue_verify(&self, result: Result<VerifyResponse, FacilitatorError>) {
            self.verify_results.lock().unwrap().push_back(result);
        }

        fn queue_settle(&self, result: Result<SettleResponse, FacilitatorError>) {
            self.settle_results.lock().unwrap().push_back(result);
        }

        fn valid_verify() -> VerifyResponse {
            VerifyResponse {
                is_valid: true,
                invalid_reason: None,
                payer: None,
            }
        }

        fn good_settle() -> SettleResponse {
            SettleResponse {
                success: true,
                error_reason: None,
                receipt_id: Some("rcpt_ok".to_string()),
                transaction: Some("0xfeed".to_string()),
                network: Network::BaseSepolia,
            }
        }

        fn transport_error() -> FacilitatorError {
            FacilitatorError::Status {
                context: "POST /settle",
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                body: "boom".to_string(),
            }
        }
    }

    #[async_trait]
    impl Facilitator for StubFacilitator {
        async fn verify(
            &self,
            _request: &VerifyRequest,
        ) -> Result<VerifyResponse, FacilitatorError> {
            *self.verify_calls.lock().unwrap() += 1;
            self.verify_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Self::valid_verify()))
        }

        async fn settle(
            &self,
            _request: &SettleRequest,
        ) -> Result<SettleResponse, FacilitatorError> {
            *self.settle_calls.lock().unwrap() += 1;
            self.settle_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Self::good_settle()))
        }

        async fn healthy(&self) -> bool {
            true
        }
    }

    /// Counts executions so exactly-once delivery is observable.
    struct CountingScanner {
        inner: RuleScanner,
        executions: Mutex<u32>,
    }

    impl CountingScanner {
        fn new() -> Self {
            Self {
                inner: RuleScanner,
                executions: Mutex::new(0),
            }
        }

        fn count(&self) -> u32 {
            *self.executions.lock().unwrap()
        }
    }

    #[async_trait]
    impl Scanner for CountingScanner {
        async fn scan(
            &self,
            mode: ScanMode,
            text: &str,
            metadata: Option<&Value>,
        ) -> Result<crate::scanner::ScanOutcome, crate::scanner::ScanFailure> {
            *self.executions.lock().unwrap() += 1;
            self.inner.scan(mode, text, metadata).await
        }
    }

    /// A scanner that always fails, for release-path tests.
    struct BrokenScanner;

    #[async_trait]
    impl Scanner for BrokenScanner {
        async fn scan(
            &self,
            _mode: ScanMode,
            _text: &str,
            _metadata: Option<&Value>,
        ) -> Result<crate::scanner::ScanOutcome, crate::scanner::ScanFailure> {
            Err(crate::scanner::ScanFailure("engine down".to_string()))
        }
    }

    #[derive(Default)]
    struct MemUsage {
        records: Mutex<Vec<UsageRecord>>,
    }

    #[async_trait]
    impl UsageRecorder for MemUsage {
        async fn record(&self, record: UsageRecord) -> Result<(), StoreError> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }

        async fn recent(
            &self,
            _account_id: Uuid,
            _limit: i64,
        ) -> Result<Vec<UsageLogRow>, StoreError> {
            Ok(Vec::new())
        }

        async fn stats(
            &self,
            _account_id: Uuid,
            _days: i64,
        ) -> Result<Vec<UsageBucket>, StoreError> {
            Ok(Vec::new())
        }
    }

    // ------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------

    struct Harness {
        paygate: Paygate,
        ledger: Arc<MemLedger>,
        payments: Arc<MemPayments>,
        facilitator: Arc<StubFacilitator>,
        scanner: Arc<CountingScanner>,
    }

    fn wallet() -> ChainAddress {
        "0x209693Bc6afc0C5328bA36FaF03C514EF312287C".parse().unwrap()
    }

    fn token() -> ChainAddress {
        "0x036CbD53842c5426634e7929541eC2318f3dCF7e".parse().unwrap()
    }

    fn pricing() -> PriceTable {
        PriceTable {
            scan_content: Money::parse("0.001").unwrap(),
            scan_output: Money::parse("0.001").unwrap(),
            offers: vec![(Network::BaseSepolia, wallet(), token())],
        }
    }

    fn harness(ledger: MemLedger) -> Harness {
        let ledger = Arc::new(ledger);
        let payments = Arc::new(MemPayments::default());
        let facilitator = Arc::new(StubFacilitator::default());
        let scanner = Arc::new(CountingScanner::new());
        let paygate = Paygate::new(
            Arc::clone(&ledger) as Arc<dyn LedgerOps>,
            Arc::clone(&payments) as Arc<dyn PaymentStore>,
            Arc::clone(&facilitator) as Arc<dyn Facilitator>,
            Arc::clone(&scanner) as Arc<dyn Scanner>,
            Arc::new(MemUsage::default()),
            pricing(),
            300,
            10,
            262_144,
        );
        Harness {
            paygate,
            ledger,
            payments,
            facilitator,
            scanner,
        }
    }

    fn body(text: &str) -> ScanRequestBody {
        ScanRequestBody {
            text: text.to_string(),
            metadata: None,
        }
    }

    fn header_payload(nonce: [u8; 32]) -> PaymentPayload {
        PaymentPayload {
            network: Network::BaseSepolia,
            scheme: Scheme::X402,
            payer: "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045".parse().unwrap(),
            receiver: wallet(),
            token_address: token(),
            amount: AtomicAmount(1_000),
            timestamp: UnixTimestamp::try_now().unwrap(),
            nonce: PaymentNonce(nonce),
            transaction: "AQIDBA==".to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Balance path
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn balance_happy_path_charges_once() {
        let account = Uuid::new_v4();
        let initial = Money::parse("1").unwrap();
        let h = harness(MemLedger::with_balance(account, initial));
        let request_id = Uuid::now_v7();

        let outcome = h
            .paygate
            .handle_scan(ScanRoute::Content, Some(account), request_id, None, body("hi"))
            .await
            .unwrap();

        assert!(!outcome.replayed);
        assert_eq!(outcome.body["decision"], "allow");
        assert_eq!(outcome.body["price"], "0.001000");
        assert!(outcome.receipt_header.is_none());
        assert_eq!(h.ledger.balance_of(account), 999_000);
        assert_eq!(h.ledger.entry_count(account), 1);
        h.ledger.assert_consistent(account, initial);
        let txn = h.payments.by_request(request_id).unwrap();
        assert_eq!(txn.phase, PaymentPhase::Settled);
    }

    #[tokio::test]
    async fn balance_replay_returns_identical_body_without_recharging() {
        let account = Uuid::new_v4();
        let initial = Money::parse("1").unwrap();
        let h = harness(MemLedger::with_balance(account, initial));
        let request_id = Uuid::now_v7();

        let first = h
            .paygate
            .handle_scan(ScanRoute::Content, Some(account), request_id, None, body("hi"))
            .await
            .unwrap();
        let second = h
            .paygate
            .handle_scan(ScanRoute::Content, Some(account), request_id, None, body("hi"))
            .await
            .unwrap();

        assert!(second.replayed);
        assert_eq!(first.body, second.body);
        assert_eq!(h.ledger.balance_of(account), 999_000);
        assert_eq!(h.ledger.entry_count(account), 1);
        assert_eq!(h.scanner.count(), 1);
    }

    #[tokio::test]
    async fn insufficient_balance_rejects_without_side_effects() {
        let account = Uuid::new_v4();
        let initial = Money::parse("0.0005").unwrap();
        let h = harness(MemLedger::with_balance(account, initial));
        let request_id = Uuid::now_v7();

        let err = h
            .paygate
            .handle_scan(ScanRoute::Content, Some(account), request_id, None, body("hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::PaymentRequired(_)));
        assert_eq!(h.ledger.balance_of(account), 500);
        assert_eq!(h.ledger.entry_count(account), 0);
        assert_eq!(h.scanner.count(), 0);
        let txn = h.payments.by_request(request_id).unwrap();
        assert_eq!(txn.phase, PaymentPhase::Failed);
    }

    #[tokio::test]
    async fn no_credentials_yields_challenge() {
        let h = harness(MemLedger::default());
        let request_id = Uuid::now_v7();
        let err = h
            .paygate
            .handle_scan(ScanRoute::Content, None, request_id, None, body("hi"))
            .await
            .unwrap_err();
        match err {
            ApiError::PaymentRequired(challenge) => {
                assert_eq!(challenge.request_id, request_id);
                assert_eq!(challenge.accepts.len(), 1);
                assert_eq!(challenge.accepts[0].amount, Money::parse("0.001").unwrap());
            }
            other => panic!("expected PaymentRequired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_execution_refunds_balance_debit() {
        let account = Uuid::new_v4();
        let initial = Money::parse("1").unwrap();
        let ledger = Arc::new(MemLedger::with_balance(account, initial));
        let payments = Arc::new(MemPayments::default());
        let paygate = Paygate::new(
            Arc::clone(&ledger) as Arc<dyn LedgerOps>,
            Arc::clone(&payments) as Arc<dyn PaymentStore>,
            Arc::new(StubFacilitator::default()),
            Arc::new(BrokenScanner),
            Arc::new(MemUsage::default()),
            pricing(),
            300,
            10,
            262_144,
        );
        let request_id = Uuid::now_v7();

        let err = paygate
            .handle_scan(ScanRoute::Content, Some(account), request_id, None, body("hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Upstream(_)));
        // Charge plus refund: net zero, both journaled.
        assert_eq!(ledger.balance_of(account), 1_000_000);
        assert_eq!(ledger.entry_count(account), 2);
        ledger.assert_consistent(account, initial);
        let txn = payments.by_request(request_id).unwrap();
        assert_eq!(txn.phase, PaymentPhase::Refunded);
    }

    // ------------------------------------------------------------------
    // Header path
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn header_happy_path_verifies_executes_settles() {
        let h = harness(MemLedger::default());
        let request_id = Uuid::now_v7();
        let header = header_payload([1u8; 32]).to_header();

        let outcome = h
            .paygate
            .handle_scan(
                ScanRoute::Content,
                None,
                request_id,
                Some(header.as_bytes()),
                body("hi"),
            )
            .await
            .unwrap();

        assert!(outcome.receipt_header.is_some());
        assert_eq!(*h.facilitator.verify_calls.lock().unwrap(), 1);
        assert_eq!(*h.facilitator.settle_calls.lock().unwrap(), 1);
        let txn = h.payments.by_request(request_id).unwrap();
        assert_eq!(txn.phase, PaymentPhase::Settled);
    }

    #[tokio::test]
    async fn verify_rejection_never_executes() {
        let h = harness(MemLedger::default());
        h.facilitator.queue_verify(Ok(VerifyResponse {
            is_valid: false,
            invalid_reason: Some("signature".to_string()),
            payer: None,
        }));
        let request_id = Uuid::now_v7();
        let header = header_payload([2u8; 32]).to_header();

        let err = h
            .paygate
            .handle_scan(
                ScanRoute::Content,
                None,
                request_id,
                Some(header.as_bytes()),
                body("hi"),
            )
            .await
            .unwrap_err();

        match err {
            ApiError::PaymentRejected { reason, .. } => assert_eq!(reason, "signature"),
            other => panic!("expected PaymentRejected, got {other:?}"),
        }
        assert_eq!(h.scanner.count(), 0);
        assert_eq!(*h.facilitator.settle_calls.lock().unwrap(), 0);
        let txn = h.payments.by_request(request_id).unwrap();
        assert_eq!(txn.phase, PaymentPhase::Failed);
    }

    #[tokio::test]
    async fn settle_failure_preserves_result_and_parks_transaction() {
        let h = harness(MemLedger::default());
        h.facilitator
            .queue_settle(Err(StubFacilitator::transport_error()));
        let request_id = Uuid::now_v7();
        let header = header_payload([3u8; 32]).to_header();

        let outcome = h
            .paygate
            .handle_scan(
                ScanRoute::Content,
                None,
                request_id,
                Some(header.as_bytes()),
                body("hi"),
            )
            .await
            .unwrap();

        // The client still gets the result; the receipt header is absent.
        assert!(outcome.receipt_header.is_none());
        assert_eq!(outcome.body["decision"], "allow");
        let txn = h.payments.by_request(request_id).unwrap();
        assert_eq!(txn.phase, PaymentPhase::PendingSettle);
        assert!(txn.result.is_some());
    }

    #[tokio::test]
    async fn retrier_eventually_settles_parked_transaction() {
        let h = harness(MemLedger::default());
        h.facilitator
            .queue_settle(Err(StubFacilitator::transport_error()));
        let request_id = Uuid::now_v7();
        let header = header_payload([4u8; 32]).to_header();
        h.paygate
            .handle_scan(
                ScanRoute::Content,
                None,
                request_id,
                Some(header.as_bytes()),
                body("hi"),
            )
            .await
            .unwrap();

        // Make the parked row due immediately, then sweep.
        h.payments
            .update(request_id, |t| {
                t.next_retry_at = Some(Utc::now() - ChronoDuration::seconds(1));
            })
            .unwrap();
        let retrier = SettleRetrier::new(
            Arc::clone(&h.payments) as Arc<dyn PaymentStore>,
            Arc::clone(&h.facilitator) as Arc<dyn Facilitator>,
            Duration::from_secs(30),
            10,
            3_600,
        );
        let drained = retrier.drain_due().await.unwrap();
        assert_eq!(drained, 1);
        let txn = h.payments.by_request(request_id).unwrap();
        assert_eq!(txn.phase, PaymentPhase::Settled);
        assert!(txn.receipt.is_some());
    }

    #[tokio::test]
    async fn retrier_backs_off_on_repeated_failure() {
        let h = harness(MemLedger::default());
        h.facilitator
            .queue_settle(Err(StubFacilitator::transport_error()));
        let request_id = Uuid::now_v7();
        let header = header_payload([5u8; 32]).to_header();
        h.paygate
            .handle_scan(
                ScanRoute::Content,
                None,
                request_id,
                Some(header.as_bytes()),
                body("hi"),
            )
            .await
            .unwrap();
        h.payments
            .update(request_id, |t| {
                t.next_retry_at = Some(Utc::now() - ChronoDuration::seconds(1));
            })
            .unwrap();
        h.facilitator
            .queue_settle(Err(StubFacilitator::transport_error()));

        let retrier = SettleRetrier::new(
            Arc::clone(&h.payments) as Arc<dyn PaymentStore>,
            Arc::clone(&h.facilitator) as Arc<dyn Facilitator>,
            Duration::from_secs(30),
            10,
            3_600,
        );
        retrier.drain_due().await.unwrap();
        let txn = h.payments.by_request(request_id).unwrap();
        assert_eq!(txn.phase, PaymentPhase::PendingSettle);
        assert_eq!(txn.attempt_count, 1);
        assert!(txn.next_retry_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn nonce_replay_returns_stored_result() {
        let h = harness(MemLedger::default());
        let request_id = Uuid::now_v7();
        let payload = header_payload([6u8; 32]);
        let header = payload.to_header();

        let first = h
            .paygate
            .handle_scan(
                ScanRoute::Content,
                None,
                request_id,
                Some(header.as_bytes()),
                body("hi"),
            )
            .await
            .unwrap();

        // A different request id with the same payload nonce is the same
        // logical request.
        let second = h
            .paygate
            .handle_scan(
                ScanRoute::Content,
                None,
                Uuid::now_v7(),
                Some(header.as_bytes()),
                body("hi"),
            )
            .await
            .unwrap();

        assert!(second.replayed);
        assert_eq!(first.body, second.body);
        assert_eq!(second.request_id, request_id);
        assert_eq!(h.scanner.count(), 1);
        assert_eq!(*h.facilitator.verify_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn amount_mismatch_is_rejected_before_verify() {
        let h = harness(MemLedger::default());
        let mut payload = header_payload([7u8; 32]);
        payload.amount = AtomicAmount(999);
        let header = payload.to_header();

        let err = h
            .paygate
            .handle_scan(
                ScanRoute::Content,
                None,
                Uuid::now_v7(),
                Some(header.as_bytes()),
                body("hi"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::PaymentRejected { .. }));
        assert_eq!(*h.facilitator.verify_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected_before_verify() {
        let h = harness(MemLedger::default());
        let mut payload = header_payload([8u8; 32]);
        payload.timestamp = UnixTimestamp(1_000_000);
        let header = payload.to_header();

        let err = h
            .paygate
            .handle_scan(
                ScanRoute::Content,
                None,
                Uuid::now_v7(),
                Some(header.as_bytes()),
                body("hi"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::PaymentRejected { .. }));
        assert_eq!(*h.facilitator.verify_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn in_flight_fingerprint_conflicts() {
        let h = harness(MemLedger::default());
        let account = Uuid::new_v4();
        h.ledger
            .inner
            .lock()
            .unwrap()
            .balances
            .insert(account, 1_000_000);
        let request_id = Uuid::now_v7();

        // Simulate a concurrent arrival that holds the row but has not
        // produced a result yet.
        let price = Money::parse("0.001").unwrap();
        let funding = Funding::Balance(account);
        let fp = fingerprint(&funding, ScanRoute::Content, price, request_id);
        h.payments
            .hold(NewPaymentTransaction {
                request_id,
                fingerprint: fp,
                route: ScanRoute::Content.path().to_string(),
                price,
                payer: funding.payer(),
                account_id: Some(account),
                payment_payload: None,
            })
            .await
            .unwrap();

        let err = h
            .paygate
            .handle_scan(ScanRoute::Content, Some(account), request_id, None, body("hi"))
            .await
            .unwrap_err();
        match err {
            ApiError::Conflict { code, .. } => assert_eq!(code, "request_in_flight"),
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn abandoned_transaction_is_taken_over_without_double_charge() {
        let account = Uuid::new_v4();
        let initial = Money::parse("1").unwrap();
        let h = harness(MemLedger::with_balance(account, initial));
        let request_id = Uuid::now_v7();
        let price = Money::parse("0.001").unwrap();

        // First attempt crashed after the debit committed: a stale row in
        // `verified`, a charge entry, no result.
        let funding = Funding::Balance(account);
        let fp = fingerprint(&funding, ScanRoute::Content, price, request_id);
        h.payments
            .hold(NewPaymentTransaction {
                request_id,
                fingerprint: fp,
                route: ScanRoute::Content.path().to_string(),
                price,
                payer: funding.payer(),
                account_id: Some(account),
                payment_payload: None,
            })
            .await
            .unwrap();
        h.ledger
            .debit_if_sufficient(account, price, &request_id.to_string())
            .await
            .unwrap();
        h.payments
            .update(request_id, |t| {
                t.phase = PaymentPhase::Verified;
                t.updated_at = Utc::now() - ChronoDuration::seconds(120);
            })
            .unwrap();

        let outcome = h
            .paygate
            .handle_scan(ScanRoute::Content, Some(account), request_id, None, body("hi"))
            .await
            .unwrap();

        assert!(!outcome.replayed);
        // Exactly one charge despite the retry re-driving verification.
        assert_eq!(h.ledger.entry_count(account), 1);
        assert_eq!(h.ledger.balance_of(account), 999_000);
        h.ledger.assert_consistent(account, initial);
        assert_eq!(h.scanner.count(), 1);
    }

    #[tokio::test]
    async fn oversized_text_is_rejected_before_any_charge() {
        let account = Uuid::new_v4();
        let h = harness(MemLedger::with_balance(account, Money::parse("1").unwrap()));
        let big = "a".repeat(262_145);
        let err = h
            .paygate
            .handle_scan(ScanRoute::Content, Some(account), Uuid::now_v7(), None, body(&big))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(h.ledger.entry_count(account), 0);
    }
}
