use crate::error::{DeferredError, StateError};
use crate::models::{
    amount::checked_sum, Network, NewSettlementRecord, PendingSubmission, ReconciliationRecord,
    SettlementRecord, SettlementRequest, VoucherRecord, DEFERRED_SCHEME,
};
use crate::services::aggregation::{validate_batch, AggregatedBatch, AggregationPolicy, AggregationScope};
use crate::services::analytics::Analytics;
use crate::services::chain::{
    ChainClient, ChainError, ConfirmedSettlement, SettlementInstruction, SubmissionOutcome,
    TransactionStatus, VoucherAuthorization,
};
use crate::services::store::VoucherStore;
use chrono::Utc;
use ethers::types::{Address, Signature, U256};
use futures::future::try_join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    Pending,
    FetchingVouchers,
    ValidatingAggregation,
    PreparingSettlement,
    ExecutingOnchain,
    UpdatingDatabase,
    SettledConfirmed,
    SettlementReverted,
    Error,
}

impl SettlementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementState::Pending => "pending",
            SettlementState::FetchingVouchers => "fetching_vouchers",
            SettlementState::ValidatingAggregation => "validating_aggregation",
            SettlementState::PreparingSettlement => "preparing_settlement",
            SettlementState::ExecutingOnchain => "executing_onchain",
            SettlementState::UpdatingDatabase => "updating_database",
            SettlementState::SettledConfirmed => "settled_confirmed",
            SettlementState::SettlementReverted => "settlement_reverted",
            SettlementState::Error => "error",
        }
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type SettlementResult<T> = Result<T, StateError<SettlementState>>;

#[derive(Debug, Clone)]
pub struct SettlementOutcome {
    pub settlement: SettlementRecord,
    pub explorer_url: String,
    pub state: SettlementState,
}

/// Runs one settlement from voucher selection through on-chain execution to bookkeeping.
pub struct SettlementOrchestrator {
    store: Arc<dyn VoucherStore>,
    chains: HashMap<Network, Arc<dyn ChainClient>>,
    policy: AggregationPolicy,
    timeout: Duration,
    analytics: Arc<Analytics>,
}

impl SettlementOrchestrator {
    pub fn new(
        store: Arc<dyn VoucherStore>,
        chains: HashMap<Network, Arc<dyn ChainClient>>,
        timeout: Duration,
        analytics: Arc<Analytics>,
    ) -> Self {
        Self {
            policy: AggregationPolicy::new(store.clone()),
            store,
            chains,
            timeout,
            analytics,
        }
    }

    pub fn settlement_networks(&self) -> Vec<Network> {
        Network::ALL
            .into_iter()
            .filter(|n| self.chains.contains_key(n))
            .collect()
    }

    pub async fn settle(&self, request: SettlementRequest) -> SettlementResult<SettlementOutcome> {
        let started = Instant::now();
        let result = self.run(&request).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(outcome) => {
                self.analytics.record_settled(outcome.settlement.voucher_count);
                tracing::info!(
                    authorization_state = %outcome.state,
                    tx_hash = ?outcome.settlement.tx_hash,
                    payee = ?request.payee,
                    network = %request.network,
                    voucher_count = outcome.settlement.voucher_count,
                    total_amount = %outcome.settlement.total_amount,
                    duration_ms,
                    "deferred.settle.ok"
                );
            }
            Err(failure) if failure.state == SettlementState::SettlementReverted => {
                self.analytics.record_reverted();
                tracing::warn!(
                    authorization_state = %failure.state,
                    payee = ?request.payee,
                    network = %request.network,
                    duration_ms,
                    "deferred.settle.revert: {}",
                    failure.error
                );
            }
            Err(failure) => {
                match failure.error {
                    DeferredError::ReconciliationRequired { .. } => {
                        self.analytics.record_reconciliation()
                    }
                    DeferredError::SettlementTimeout { .. } | DeferredError::InternalError(_) => {
                        self.analytics.record_failed()
                    }
                    _ => {}
                }
                tracing::info!(
                    authorization_state = %failure.state,
                    error_code = failure.error.error_code(),
                    payee = ?request.payee,
                    network = %request.network,
                    duration_ms,
                    "deferred.settle.error: {}",
                    failure.error
                );
            }
        }

        result
    }

    async fn run(&self, request: &SettlementRequest) -> SettlementResult<SettlementOutcome> {
        let scope = AggregationScope::from(request);
        let chain = self.chains.get(&request.network).cloned().ok_or_else(|| {
            StateError::new(
                SettlementState::Pending,
                DeferredError::UnsupportedNetwork(format!(
                    "settlement is not enabled on {}",
                    request.network
                )),
            )
        })?;

        self.reconcile_pending(chain.as_ref(), request.payee, request.network)
            .await
            .map_err(|e| StateError::new(SettlementState::Pending, e))?;

        let state = SettlementState::FetchingVouchers;
        let now = Utc::now();
        let candidates = self
            .policy
            .fetch_candidates(&scope, now)
            .await
            .map_err(|e| StateError::new(state, DeferredError::InternalError(e.to_string())))?;

        if candidates.is_empty() {
            return Err(StateError::new(state, DeferredError::NoUnsettledVouchers));
        }

        let state = SettlementState::ValidatingAggregation;
        if candidates.live.is_empty() {
            return Err(StateError::new(
                state,
                DeferredError::AggregationInvalid(format!(
                    "all {} unsettled vouchers have expired",
                    candidates.expired.len()
                )),
            ));
        }
        if !candidates.expired.is_empty() {
            tracing::debug!(
                expired = candidates.expired.len(),
                "Excluding expired vouchers from settlement"
            );
        }

        let batch = validate_batch(&scope, candidates.live, now, request.min_amount)
            .map_err(|e| StateError::new(state, e))?;

        let state = SettlementState::PreparingSettlement;
        let instruction = prepare_instruction(&batch).map_err(|e| StateError::new(state, e))?;

        let state = SettlementState::ExecutingOnchain;
        let tx_hash = chain.submit(&instruction).await.map_err(|e| match e {
            ChainError::Reverted(reason) => StateError::new(
                SettlementState::SettlementReverted,
                DeferredError::SettlementReverted { reason, tx_hash: None },
            ),
            ChainError::Rpc(reason) => StateError::new(
                SettlementState::Error,
                DeferredError::InternalError(format!("settlement broadcast failed: {reason}")),
            ),
        })?;

        let pending = PendingSubmission {
            tx_hash,
            payee: batch.payee,
            payer: batch.payer,
            network: batch.network,
            voucher_ids: batch.voucher_ids(),
            total_amount: batch.total_amount,
            broadcast_at: Utc::now(),
        };
        // Never wait on a broadcast that has no pending record behind it.
        if let Err(e) = self.store.record_pending(pending.clone()).await {
            let error = self
                .reconciliation_required(&pending, vec![], format!("pending record not stored: {e}"))
                .await;
            return Err(StateError::new(SettlementState::Error, error));
        }

        let outcome = match tokio::time::timeout(self.timeout, chain.confirm(tx_hash)).await {
            Err(_) => {
                return Err(StateError::new(
                    SettlementState::Error,
                    DeferredError::SettlementTimeout {
                        tx_hash,
                        timeout_secs: self.timeout.as_secs(),
                    },
                ));
            }
            Ok(Err(e)) => {
                return Err(StateError::new(
                    SettlementState::Error,
                    DeferredError::InternalError(format!(
                        "settlement {tx_hash:?} outcome unknown: {e}"
                    )),
                ));
            }
            Ok(Ok(outcome)) => outcome,
        };

        let confirmed = match outcome {
            SubmissionOutcome::Reverted { tx_hash, reason } => {
                self.clear_pending(&pending).await;
                return Err(StateError::new(
                    SettlementState::SettlementReverted,
                    DeferredError::SettlementReverted { reason, tx_hash: Some(tx_hash) },
                ));
            }
            SubmissionOutcome::Confirmed(confirmed) => confirmed,
        };

        let amounts: Vec<(Uuid, U256)> = batch.vouchers.iter().map(|v| (v.id, v.amount)).collect();
        let settlement = self
            .finalize(&pending, &confirmed, &amounts)
            .await
            .map_err(|e| StateError::new(SettlementState::Error, e))?;

        Ok(SettlementOutcome {
            settlement,
            explorer_url: confirmed.explorer_url,
            state: SettlementState::SettledConfirmed,
        })
    }

    /// Resolves earlier broadcasts for this payee before anything new is submitted.
    async fn reconcile_pending(
        &self,
        chain: &dyn ChainClient,
        payee: Address,
        network: Network,
    ) -> Result<(), DeferredError> {
        let pending = self
            .store
            .pending_submissions(payee, network)
            .await
            .map_err(|e| DeferredError::InternalError(e.to_string()))?;

        for submission in pending {
            let status = chain.status_of(submission.tx_hash).await.map_err(|e| {
                DeferredError::InternalError(format!(
                    "status of {:?} unavailable: {e}",
                    submission.tx_hash
                ))
            })?;

            match status {
                TransactionStatus::Pending => {
                    return Err(DeferredError::SettlementInFlight { tx_hash: submission.tx_hash });
                }
                TransactionStatus::Reverted | TransactionStatus::Unknown => {
                    tracing::info!(
                        tx_hash = ?submission.tx_hash,
                        status = ?status,
                        "Discarding unconfirmed settlement submission"
                    );
                    self.clear_pending(&submission).await;
                }
                TransactionStatus::Confirmed(confirmed) => {
                    tracing::info!(
                        tx_hash = ?submission.tx_hash,
                        "Completing bookkeeping for settlement confirmed after timeout"
                    );
                    let records = self.load_vouchers(&submission.voucher_ids).await?;
                    let amounts: Vec<(Uuid, U256)> =
                        records.iter().map(|r| (r.id, r.amount)).collect();
                    match self.finalize(&submission, &confirmed, &amounts).await {
                        Ok(settlement) => self.analytics.record_settled(settlement.voucher_count),
                        // Parked with its vouchers fenced off; newer vouchers may still settle.
                        Err(_) => self.analytics.record_reconciliation(),
                    }
                }
            }
        }

        Ok(())
    }

    /// Flips the settled vouchers and records the settlement for whichever ones this
    /// call actually changed.
    async fn finalize(
        &self,
        submission: &PendingSubmission,
        confirmed: &ConfirmedSettlement,
        amounts: &[(Uuid, U256)],
    ) -> Result<SettlementRecord, DeferredError> {
        let tx_hash = confirmed.tx_hash;
        let attempted = &submission.voucher_ids;

        let flipped = match self.store.mark_settled(attempted).await {
            Ok(flipped) => flipped,
            Err(e) => return Err(self.reconciliation_required(submission, vec![], e.to_string()).await),
        };

        if flipped.is_empty() {
            return Err(self
                .reconciliation_required(submission, flipped, "no vouchers were still unsettled".to_string())
                .await);
        }

        let total_amount = if flipped.len() == attempted.len() {
            submission.total_amount
        } else {
            tracing::warn!(
                tx_hash = ?tx_hash,
                attempted = attempted.len(),
                flipped = flipped.len(),
                "Some vouchers were settled concurrently; recording only the ones flipped here"
            );
            let flipped_amounts = amounts
                .iter()
                .filter(|(id, _)| flipped.contains(id))
                .map(|(_, amount)| *amount);
            match checked_sum(flipped_amounts) {
                Some(total) => total,
                None => {
                    return Err(self
                        .reconciliation_required(submission, flipped, "settled amount overflows".to_string())
                        .await)
                }
            }
        };

        let settlement = self
            .store
            .store_settlement(NewSettlementRecord {
                tx_hash,
                payee: submission.payee,
                payer: submission.payer,
                total_amount,
                network: submission.network,
                voucher_ids: flipped.clone(),
                scheme: DEFERRED_SCHEME.to_string(),
                block_number: confirmed.block_number,
            })
            .await;

        let settlement = match settlement {
            Ok(settlement) => settlement,
            Err(e) => return Err(self.reconciliation_required(submission, flipped, e.to_string()).await),
        };

        self.clear_pending(submission).await;
        Ok(settlement)
    }

    async fn load_vouchers(&self, ids: &[Uuid]) -> Result<Vec<VoucherRecord>, DeferredError> {
        let lookups = ids.iter().map(|id| self.store.get_voucher(*id));
        let found = try_join_all(lookups)
            .await
            .map_err(|e| DeferredError::InternalError(e.to_string()))?;
        Ok(found.into_iter().flatten().collect())
    }

    async fn clear_pending(&self, submission: &PendingSubmission) {
        if let Err(e) = self.store.clear_pending(submission).await {
            tracing::error!(
                tx_hash = ?submission.tx_hash,
                "Failed to clear pending submission: {}",
                e
            );
        }
    }

    /// Moves a submission whose bookkeeping failed out of the pending set into a
    /// reconciliation record. Its vouchers stay excluded from new batches.
    async fn reconciliation_required(
        &self,
        submission: &PendingSubmission,
        flipped: Vec<Uuid>,
        reason: String,
    ) -> DeferredError {
        let tx_hash = submission.tx_hash;
        tracing::error!(
            tx_hash = ?tx_hash,
            attempted_ids = ?submission.voucher_ids,
            flipped = flipped.len(),
            reason = %reason,
            "Settlement bookkeeping failed; reconciliation required"
        );

        let record = ReconciliationRecord {
            tx_hash,
            payee: submission.payee,
            network: submission.network,
            attempted: submission.voucher_ids.clone(),
            flipped: flipped.clone(),
            reason: reason.clone(),
            recorded_at: Utc::now(),
        };
        match self.store.record_reconciliation(record).await {
            Ok(()) => self.clear_pending(submission).await,
            Err(e) => tracing::error!(
                tx_hash = ?tx_hash,
                "Failed to record reconciliation, submission stays pending: {}",
                e
            ),
        }

        DeferredError::ReconciliationRequired {
            tx_hash,
            attempted: submission.voucher_ids.clone(),
            settled: flipped,
            reason,
        }
    }
}

/// Pairs each voucher with its own stored signature.
fn prepare_instruction(batch: &AggregatedBatch) -> Result<SettlementInstruction, DeferredError> {
    let authorizations = batch
        .vouchers
        .iter()
        .map(|record| {
            let signature = Signature::from_str(&record.signature).map_err(|e| {
                DeferredError::InternalError(format!(
                    "stored signature for voucher {} is unreadable: {e}",
                    record.id
                ))
            })?;
            Ok(VoucherAuthorization {
                voucher_id: record.id,
                voucher: record.voucher(),
                signature,
            })
        })
        .collect::<Result<Vec<_>, DeferredError>>()?;

    SettlementInstruction::new(batch.network, batch.payee, batch.total_amount, authorizations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewVoucherRecord;
    use crate::services::store::{MemoryVoucherStore, StoreError};
    use crate::testing::{submitted_total, ScriptedChainClient, ScriptedOutcome};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use ethers::types::H256;

    const SIGNATURE: &str = "0x1111111111111111111111111111111111111111111111111111111111111111\
                             22222222222222222222222222222222222222222222222222222222222222221b";

    fn payer(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn payee() -> Address {
        Address::repeat_byte(0xee)
    }

    async fn seed(store: &MemoryVoucherStore, payer: Address, amount: u64, nonce: &str) -> VoucherRecord {
        store
            .store_voucher(NewVoucherRecord {
                payer,
                payee: payee(),
                amount: U256::from(amount),
                nonce: nonce.to_string(),
                signature: SIGNATURE.to_string(),
                valid_until: Utc::now() + ChronoDuration::hours(1),
                network: Network::Celo,
                scheme: DEFERRED_SCHEME.to_string(),
            })
            .await
            .unwrap()
    }

    fn orchestrator(
        store: Arc<MemoryVoucherStore>,
        chain: Arc<dyn ChainClient>,
        timeout: Duration,
    ) -> SettlementOrchestrator {
        let mut chains: HashMap<Network, Arc<dyn ChainClient>> = HashMap::new();
        chains.insert(Network::Celo, chain);
        SettlementOrchestrator::new(store, chains, timeout, Arc::new(Analytics::new()))
    }

    fn request(payer: Option<Address>) -> SettlementRequest {
        SettlementRequest { payee: payee(), payer, network: Network::Celo, min_amount: None }
    }

    #[tokio::test]
    async fn test_settles_exact_sum_and_clears_balance() {
        let store = Arc::new(MemoryVoucherStore::new());
        let a = seed(&store, payer(1), 1_000_000, "n1").await;
        let b = seed(&store, payer(1), 2_000_000, "n2").await;
        let chain = Arc::new(ScriptedChainClient::new(Network::Celo));
        let orchestrator = orchestrator(store.clone(), chain.clone(), Duration::from_secs(5));

        let outcome = orchestrator.settle(request(Some(payer(1)))).await.unwrap();

        assert_eq!(outcome.state, SettlementState::SettledConfirmed);
        assert_eq!(outcome.settlement.total_amount, U256::from(3_000_000u64));
        assert_eq!(outcome.settlement.voucher_count, 2);
        assert_eq!(outcome.settlement.voucher_ids, vec![a.id, b.id]);
        assert_eq!(submitted_total(&chain), U256::from(3_000_000u64));
        assert_eq!(chain.submissions()[0].authorizations().len(), 2);

        assert!(store.get_unsettled(None, payee(), Network::Celo).await.unwrap().is_empty());
        assert!(store
            .get_accumulated_balances(payee(), Network::Celo)
            .await
            .unwrap()
            .is_empty());
        assert!(store.pending_submissions(payee(), Network::Celo).await.unwrap().is_empty());
        assert!(store.get_settlement(outcome.settlement.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_no_vouchers_makes_no_chain_call() {
        let store = Arc::new(MemoryVoucherStore::new());
        let chain = Arc::new(ScriptedChainClient::new(Network::Celo));
        let orchestrator = orchestrator(store, chain.clone(), Duration::from_secs(5));

        let err = orchestrator.settle(request(None)).await.unwrap_err();
        assert!(matches!(err.error, DeferredError::NoUnsettledVouchers));
        assert_eq!(err.state, SettlementState::FetchingVouchers);
        assert_eq!(chain.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_below_minimum_makes_no_chain_call() {
        let store = Arc::new(MemoryVoucherStore::new());
        seed(&store, payer(1), 500, "n1").await;
        let chain = Arc::new(ScriptedChainClient::new(Network::Celo));
        let orchestrator = orchestrator(store, chain.clone(), Duration::from_secs(5));

        let mut req = request(None);
        req.min_amount = Some(U256::from(10_000_000u64));
        let err = orchestrator.settle(req).await.unwrap_err();

        assert!(matches!(err.error, DeferredError::BelowMinimumThreshold { .. }));
        assert_eq!(err.state, SettlementState::ValidatingAggregation);
        assert_eq!(chain.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_all_expired_is_aggregation_invalid() {
        let store = Arc::new(MemoryVoucherStore::new());
        store
            .store_voucher(NewVoucherRecord {
                payer: payer(1),
                payee: payee(),
                amount: U256::from(5u64),
                nonce: "old".to_string(),
                signature: SIGNATURE.to_string(),
                valid_until: Utc::now() - ChronoDuration::seconds(5),
                network: Network::Celo,
                scheme: DEFERRED_SCHEME.to_string(),
            })
            .await
            .unwrap();
        let chain = Arc::new(ScriptedChainClient::new(Network::Celo));
        let orchestrator = orchestrator(store, chain.clone(), Duration::from_secs(5));

        let err = orchestrator.settle(request(None)).await.unwrap_err();
        assert!(matches!(err.error, DeferredError::AggregationInvalid(_)));
        assert_eq!(chain.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_revert_leaves_vouchers_unsettled() {
        let store = Arc::new(MemoryVoucherStore::new());
        seed(&store, payer(1), 1_000, "n1").await;
        let chain = Arc::new(ScriptedChainClient::new(Network::Celo));
        chain.push(ScriptedOutcome::Revert("insufficient allowance".to_string()));
        let orchestrator = orchestrator(store.clone(), chain.clone(), Duration::from_secs(5));

        let err = orchestrator.settle(request(None)).await.unwrap_err();
        assert_eq!(err.state, SettlementState::SettlementReverted);
        assert!(matches!(
            err.error,
            DeferredError::SettlementReverted { tx_hash: Some(_), .. }
        ));
        assert_eq!(store.get_unsettled(None, payee(), Network::Celo).await.unwrap().len(), 1);
        assert!(store.pending_submissions(payee(), Network::Celo).await.unwrap().is_empty());

        // A later attempt is free to resubmit.
        orchestrator.settle(request(None)).await.unwrap();
        assert_eq!(chain.submission_count(), 2);
    }

    #[tokio::test]
    async fn test_rejected_broadcast_is_reverted_without_pending() {
        let store = Arc::new(MemoryVoucherStore::new());
        seed(&store, payer(1), 1_000, "n1").await;
        let chain = Arc::new(ScriptedChainClient::new(Network::Celo));
        chain.push(ScriptedOutcome::RejectOnSubmit("bad signature".to_string()));
        let orchestrator = orchestrator(store.clone(), chain, Duration::from_secs(5));

        let err = orchestrator.settle(request(None)).await.unwrap_err();
        assert!(matches!(err.error, DeferredError::SettlementReverted { tx_hash: None, .. }));
        assert!(store.pending_submissions(payee(), Network::Celo).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_keeps_pending_then_reconciles() {
        let store = Arc::new(MemoryVoucherStore::new());
        let voucher = seed(&store, payer(1), 1_000, "n1").await;
        let chain = Arc::new(ScriptedChainClient::new(Network::Celo));
        chain.push(ScriptedOutcome::Hang);
        let orchestrator = orchestrator(store.clone(), chain.clone(), Duration::from_millis(50));

        let err = orchestrator.settle(request(None)).await.unwrap_err();
        assert_eq!(err.state, SettlementState::Error);
        let DeferredError::SettlementTimeout { tx_hash, .. } = err.error else {
            panic!("expected a settlement timeout");
        };
        assert_eq!(store.pending_submissions(payee(), Network::Celo).await.unwrap().len(), 1);

        // Still unmined: no second broadcast.
        let err = orchestrator.settle(request(None)).await.unwrap_err();
        assert!(matches!(err.error, DeferredError::SettlementInFlight { .. }));
        assert_eq!(chain.submission_count(), 1);

        // Mined in the meantime: bookkeeping completes and nothing is left to settle.
        chain.set_status(
            tx_hash,
            TransactionStatus::Confirmed(ScriptedChainClient::confirmed(tx_hash)),
        );
        let err = orchestrator.settle(request(None)).await.unwrap_err();
        assert!(matches!(err.error, DeferredError::NoUnsettledVouchers));
        assert_eq!(chain.submission_count(), 1);
        assert!(store.get_voucher(voucher.id).await.unwrap().unwrap().settled);
        assert!(store.pending_submissions(payee(), Network::Celo).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_submission_is_resubmitted() {
        let store = Arc::new(MemoryVoucherStore::new());
        seed(&store, payer(1), 1_000, "n1").await;
        let chain = Arc::new(ScriptedChainClient::new(Network::Celo));
        chain.push(ScriptedOutcome::Hang);
        let orchestrator = orchestrator(store.clone(), chain.clone(), Duration::from_millis(50));

        let err = orchestrator.settle(request(None)).await.unwrap_err();
        let DeferredError::SettlementTimeout { tx_hash, .. } = err.error else {
            panic!("expected a settlement timeout");
        };
        chain.set_status(tx_hash, TransactionStatus::Unknown);

        let outcome = orchestrator.settle(request(None)).await.unwrap();
        assert_eq!(outcome.settlement.voucher_count, 1);
        assert_eq!(chain.submission_count(), 2);
    }

    /// Settles one voucher behind the orchestrator's back while the transaction mines.
    struct RacingChain {
        inner: ScriptedChainClient,
        store: Arc<MemoryVoucherStore>,
        steal: Uuid,
    }

    #[async_trait]
    impl ChainClient for RacingChain {
        fn network(&self) -> Network {
            self.inner.network()
        }

        async fn submit(&self, instruction: &SettlementInstruction) -> Result<H256, ChainError> {
            self.inner.submit(instruction).await
        }

        async fn confirm(&self, tx_hash: H256) -> Result<SubmissionOutcome, ChainError> {
            self.store.mark_settled(&[self.steal]).await.unwrap();
            self.inner.confirm(tx_hash).await
        }

        async fn status_of(&self, tx_hash: H256) -> Result<TransactionStatus, ChainError> {
            self.inner.status_of(tx_hash).await
        }
    }

    #[tokio::test]
    async fn test_partial_flip_records_only_flipped_vouchers() {
        let store = Arc::new(MemoryVoucherStore::new());
        let a = seed(&store, payer(1), 1_000_000, "n1").await;
        let b = seed(&store, payer(2), 2_000_000, "n2").await;
        let chain = Arc::new(RacingChain {
            inner: ScriptedChainClient::new(Network::Celo),
            store: store.clone(),
            steal: a.id,
        });
        let orchestrator = orchestrator(store.clone(), chain, Duration::from_secs(5));

        let outcome = orchestrator.settle(request(None)).await.unwrap();
        assert_eq!(outcome.settlement.voucher_ids, vec![b.id]);
        assert_eq!(outcome.settlement.voucher_count, 1);
        assert_eq!(outcome.settlement.total_amount, U256::from(2_000_000u64));
        assert_eq!(outcome.settlement.payer, None);
    }

    #[tokio::test]
    async fn test_fully_raced_settlement_requires_reconciliation() {
        let store = Arc::new(MemoryVoucherStore::new());
        let a = seed(&store, payer(1), 1_000, "n1").await;
        let chain = Arc::new(RacingChain {
            inner: ScriptedChainClient::new(Network::Celo),
            store: store.clone(),
            steal: a.id,
        });
        let orchestrator = orchestrator(store.clone(), chain, Duration::from_secs(5));

        let err = orchestrator.settle(request(None)).await.unwrap_err();
        assert_eq!(err.state, SettlementState::Error);
        assert!(matches!(err.error, DeferredError::ReconciliationRequired { .. }));

        assert!(store.pending_submissions(payee(), Network::Celo).await.unwrap().is_empty());
        let parked = store.reconciliations(payee(), Network::Celo).await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].attempted, vec![a.id]);
        assert!(parked[0].flipped.is_empty());

        // The payee's next voucher settles normally.
        let b = seed(&store, payer(1), 2_000, "n2").await;
        let outcome = orchestrator.settle(request(None)).await.unwrap();
        assert_eq!(outcome.settlement.voucher_ids, vec![b.id]);
    }

    #[tokio::test]
    async fn test_reconciliation_after_timeout_does_not_block_payee() {
        let store = Arc::new(MemoryVoucherStore::new());
        let a = seed(&store, payer(1), 1_000, "n1").await;
        let chain = Arc::new(ScriptedChainClient::new(Network::Celo));
        chain.push(ScriptedOutcome::Hang);
        let orchestrator = orchestrator(store.clone(), chain.clone(), Duration::from_millis(50));

        let err = orchestrator.settle(request(None)).await.unwrap_err();
        let DeferredError::SettlementTimeout { tx_hash, .. } = err.error else {
            panic!("expected a settlement timeout");
        };

        // Another path settled the voucher before the late confirmation is seen.
        store.mark_settled(&[a.id]).await.unwrap();
        chain.set_status(
            tx_hash,
            TransactionStatus::Confirmed(ScriptedChainClient::confirmed(tx_hash)),
        );
        let b = seed(&store, payer(1), 2_000, "n2").await;

        let outcome = orchestrator.settle(request(None)).await.unwrap();
        assert_eq!(outcome.settlement.voucher_ids, vec![b.id]);
        assert_eq!(chain.submission_count(), 2);
        assert!(store.pending_submissions(payee(), Network::Celo).await.unwrap().is_empty());

        let parked = store.reconciliations(payee(), Network::Celo).await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].tx_hash, tx_hash);
    }

    /// Memory store whose pending-submission writes fail.
    struct PendingWriteFails {
        inner: MemoryVoucherStore,
    }

    #[async_trait]
    impl VoucherStore for PendingWriteFails {
        async fn store_voucher(
            &self,
            voucher: NewVoucherRecord,
        ) -> Result<VoucherRecord, StoreError> {
            self.inner.store_voucher(voucher).await
        }

        async fn get_voucher(&self, id: Uuid) -> Result<Option<VoucherRecord>, StoreError> {
            self.inner.get_voucher(id).await
        }

        async fn get_by_nonce(
            &self,
            nonce: &str,
            network: Network,
        ) -> Result<Option<VoucherRecord>, StoreError> {
            self.inner.get_by_nonce(nonce, network).await
        }

        async fn get_unsettled(
            &self,
            payer: Option<Address>,
            payee: Address,
            network: Network,
        ) -> Result<Vec<VoucherRecord>, StoreError> {
            self.inner.get_unsettled(payer, payee, network).await
        }

        async fn mark_settled(&self, ids: &[Uuid]) -> Result<Vec<Uuid>, StoreError> {
            self.inner.mark_settled(ids).await
        }

        async fn store_settlement(
            &self,
            settlement: NewSettlementRecord,
        ) -> Result<SettlementRecord, StoreError> {
            self.inner.store_settlement(settlement).await
        }

        async fn get_settlement(&self, id: Uuid) -> Result<Option<SettlementRecord>, StoreError> {
            self.inner.get_settlement(id).await
        }

        async fn record_pending(&self, _submission: PendingSubmission) -> Result<(), StoreError> {
            Err(StoreError::Backend("connection reset".to_string()))
        }

        async fn pending_submissions(
            &self,
            payee: Address,
            network: Network,
        ) -> Result<Vec<PendingSubmission>, StoreError> {
            self.inner.pending_submissions(payee, network).await
        }

        async fn clear_pending(&self, submission: &PendingSubmission) -> Result<(), StoreError> {
            self.inner.clear_pending(submission).await
        }

        async fn record_reconciliation(
            &self,
            record: ReconciliationRecord,
        ) -> Result<(), StoreError> {
            self.inner.record_reconciliation(record).await
        }

        async fn reconciliations(
            &self,
            payee: Address,
            network: Network,
        ) -> Result<Vec<ReconciliationRecord>, StoreError> {
            self.inner.reconciliations(payee, network).await
        }

        async fn ping(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_unrecorded_broadcast_is_never_rebroadcast() {
        let inner = MemoryVoucherStore::new();
        let voucher = seed(&inner, payer(1), 1_000, "n1").await;
        let store = Arc::new(PendingWriteFails { inner });
        let chain = Arc::new(ScriptedChainClient::new(Network::Celo));
        chain.push(ScriptedOutcome::Hang);
        let mut chains: HashMap<Network, Arc<dyn ChainClient>> = HashMap::new();
        chains.insert(Network::Celo, chain.clone());
        let orchestrator = SettlementOrchestrator::new(
            store.clone(),
            chains,
            Duration::from_secs(30),
            Arc::new(Analytics::new()),
        );

        let err = orchestrator.settle(request(None)).await.unwrap_err();
        assert_eq!(err.state, SettlementState::Error);
        let DeferredError::ReconciliationRequired { attempted, settled, .. } = err.error else {
            panic!("expected reconciliation to be required");
        };
        assert_eq!(attempted, vec![voucher.id]);
        assert!(settled.is_empty());

        let err = orchestrator.settle(request(None)).await.unwrap_err();
        assert!(matches!(err.error, DeferredError::NoUnsettledVouchers));
        assert_eq!(chain.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_network_is_rejected() {
        let store = Arc::new(MemoryVoucherStore::new());
        let chain = Arc::new(ScriptedChainClient::new(Network::Celo));
        let orchestrator = orchestrator(store, chain, Duration::from_secs(5));

        let mut req = request(None);
        req.network = Network::CeloSepolia;
        let err = orchestrator.settle(req).await.unwrap_err();
        assert!(matches!(err.error, DeferredError::UnsupportedNetwork(_)));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SettlementState::SettledConfirmed.to_string(), "settled_confirmed");
        assert_eq!(
            serde_json::to_value(SettlementState::ExecutingOnchain).unwrap(),
            "executing_onchain"
        );
    }
}
