use super::{StoreError, VoucherStore};
use crate::models::{
    canonical_nonce, Network, NewSettlementRecord, NewVoucherRecord, PendingSubmission,
    ReconciliationRecord, SettlementRecord, VoucherRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, H256};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    vouchers: HashMap<Uuid, VoucherRecord>,
    /// Insertion order, for stable oldest-first listing.
    order: Vec<Uuid>,
    /// Keyed by [`canonical_nonce`].
    nonces: HashMap<(Network, String), Uuid>,
    settlements: HashMap<Uuid, SettlementRecord>,
    pending: HashMap<(Network, H256), PendingSubmission>,
    reconciliations: HashMap<(Network, H256), ReconciliationRecord>,
}

/// Process-local store. Every operation runs under one lock, which gives the same
/// atomicity a database unique index and conditional update would.
#[derive(Default)]
pub struct MemoryVoucherStore {
    inner: RwLock<Inner>,
}

impl MemoryVoucherStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VoucherStore for MemoryVoucherStore {
    async fn store_voucher(&self, voucher: NewVoucherRecord) -> Result<VoucherRecord, StoreError> {
        let mut inner = self.inner.write().await;

        let key = (voucher.network, canonical_nonce(&voucher.nonce));
        if inner.nonces.contains_key(&key) {
            return Err(StoreError::Conflict { nonce: voucher.nonce, network: voucher.network });
        }

        let record = VoucherRecord::from_new(Uuid::new_v4(), voucher, Utc::now());
        inner.nonces.insert(key, record.id);
        inner.order.push(record.id);
        inner.vouchers.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_voucher(&self, id: Uuid) -> Result<Option<VoucherRecord>, StoreError> {
        Ok(self.inner.read().await.vouchers.get(&id).cloned())
    }

    async fn get_by_nonce(
        &self,
        nonce: &str,
        network: Network,
    ) -> Result<Option<VoucherRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .nonces
            .get(&(network, canonical_nonce(nonce)))
            .and_then(|id| inner.vouchers.get(id))
            .cloned())
    }

    async fn get_unsettled(
        &self,
        payer: Option<Address>,
        payee: Address,
        network: Network,
    ) -> Result<Vec<VoucherRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.vouchers.get(id))
            .filter(|r| !r.settled && r.payee == payee && r.network == network)
            .filter(|r| payer.map_or(true, |p| r.payer == p))
            .cloned()
            .collect())
    }

    async fn mark_settled(&self, ids: &[Uuid]) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.inner.write().await;
        let mut flipped = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = inner.vouchers.get_mut(id) {
                if !record.settled {
                    record.settled = true;
                    flipped.push(*id);
                }
            }
        }
        Ok(flipped)
    }

    async fn store_settlement(
        &self,
        settlement: NewSettlementRecord,
    ) -> Result<SettlementRecord, StoreError> {
        let record = SettlementRecord::from_new(Uuid::new_v4(), settlement, Utc::now());
        self.inner
            .write()
            .await
            .settlements
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_settlement(&self, id: Uuid) -> Result<Option<SettlementRecord>, StoreError> {
        Ok(self.inner.read().await.settlements.get(&id).cloned())
    }

    async fn record_pending(&self, submission: PendingSubmission) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .pending
            .insert((submission.network, submission.tx_hash), submission);
        Ok(())
    }

    async fn pending_submissions(
        &self,
        payee: Address,
        network: Network,
    ) -> Result<Vec<PendingSubmission>, StoreError> {
        let inner = self.inner.read().await;
        let mut pending: Vec<PendingSubmission> = inner
            .pending
            .values()
            .filter(|p| p.payee == payee && p.network == network)
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.broadcast_at);
        Ok(pending)
    }

    async fn clear_pending(&self, submission: &PendingSubmission) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .pending
            .remove(&(submission.network, submission.tx_hash));
        Ok(())
    }

    async fn record_reconciliation(&self, record: ReconciliationRecord) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .reconciliations
            .insert((record.network, record.tx_hash), record);
        Ok(())
    }

    async fn reconciliations(
        &self,
        payee: Address,
        network: Network,
    ) -> Result<Vec<ReconciliationRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut records: Vec<ReconciliationRecord> = inner
            .reconciliations
            .values()
            .filter(|r| r.payee == payee && r.network == network)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.recorded_at);
        Ok(records)
    }

    async fn ping(&self) -> bool {
        true
    }
}
