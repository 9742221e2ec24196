//! Persistence of vouchers, settlements and in-flight submissions.
//!
//! Correctness under concurrent requests comes from the two atomic operations every
//! backend must provide: nonce-unique insertion in [`VoucherStore::store_voucher`] and
//! the conditional flip in [`VoucherStore::mark_settled`].

pub mod memory;
pub mod redis;

pub use memory::MemoryVoucherStore;
pub use self::redis::RedisVoucherStore;

use crate::models::{
    amount::checked_sum, AccumulatedBalance, Network, NewSettlementRecord, NewVoucherRecord,
    PendingSubmission, ReconciliationRecord, SettlementRecord, VoucherRecord,
};
use async_trait::async_trait;
use ethers::types::Address;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("nonce {nonce} already recorded on {network}")]
    Conflict { nonce: String, network: Network },

    #[error("accumulated balance overflows 256 bits")]
    Overflow,

    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[async_trait]
pub trait VoucherStore: Send + Sync {
    /// Inserts a new unsettled voucher. Fails with [`StoreError::Conflict`] if the nonce
    /// is already present on the network, even under concurrent writers. Nonces are
    /// compared by [`canonical_nonce`](crate::models::canonical_nonce).
    async fn store_voucher(&self, voucher: NewVoucherRecord) -> Result<VoucherRecord, StoreError>;

    async fn get_voucher(&self, id: Uuid) -> Result<Option<VoucherRecord>, StoreError>;

    async fn get_by_nonce(
        &self,
        nonce: &str,
        network: Network,
    ) -> Result<Option<VoucherRecord>, StoreError>;

    /// Unsettled vouchers for the payee, oldest first. `payer = None` spans all payers.
    async fn get_unsettled(
        &self,
        payer: Option<Address>,
        payee: Address,
        network: Network,
    ) -> Result<Vec<VoucherRecord>, StoreError>;

    /// Per-payer unsettled totals, recomputed from the current voucher records.
    async fn get_accumulated_balances(
        &self,
        payee: Address,
        network: Network,
    ) -> Result<Vec<AccumulatedBalance>, StoreError> {
        let records = self.get_unsettled(None, payee, network).await?;
        accumulate(&records)
    }

    /// Flips `settled` for each listed voucher that is still unsettled and returns
    /// exactly the ids this call changed.
    async fn mark_settled(&self, ids: &[Uuid]) -> Result<Vec<Uuid>, StoreError>;

    async fn store_settlement(
        &self,
        settlement: NewSettlementRecord,
    ) -> Result<SettlementRecord, StoreError>;

    async fn get_settlement(&self, id: Uuid) -> Result<Option<SettlementRecord>, StoreError>;

    async fn record_pending(&self, submission: PendingSubmission) -> Result<(), StoreError>;

    async fn pending_submissions(
        &self,
        payee: Address,
        network: Network,
    ) -> Result<Vec<PendingSubmission>, StoreError>;

    async fn clear_pending(&self, submission: &PendingSubmission) -> Result<(), StoreError>;

    async fn record_reconciliation(&self, record: ReconciliationRecord) -> Result<(), StoreError>;

    /// Unresolved reconciliations for the payee, oldest first.
    async fn reconciliations(
        &self,
        payee: Address,
        network: Network,
    ) -> Result<Vec<ReconciliationRecord>, StoreError>;

    async fn ping(&self) -> bool;
}

/// Groups unsettled records by payer, summing exactly.
pub fn accumulate(records: &[VoucherRecord]) -> Result<Vec<AccumulatedBalance>, StoreError> {
    let mut by_payer: BTreeMap<Address, Vec<&VoucherRecord>> = BTreeMap::new();
    for record in records.iter().filter(|r| !r.settled) {
        by_payer.entry(record.payer).or_default().push(record);
    }

    by_payer
        .into_iter()
        .map(|(payer, group)| {
            let total_amount =
                checked_sum(group.iter().map(|r| r.amount)).ok_or(StoreError::Overflow)?;
            Ok(AccumulatedBalance {
                payer,
                payee: group[0].payee,
                network: group[0].network,
                total_amount,
                voucher_count: group.len(),
                voucher_ids: group.iter().map(|r| r.id).collect(),
            })
        })
        .collect()
}
