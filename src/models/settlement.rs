use crate::models::{amount, Network};
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /deferred/settle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRequest {
    pub payee: Address,
    #[serde(default)]
    pub payer: Option<Address>,
    pub network: Network,
    #[serde(default, with = "amount::decimal_opt")]
    pub min_amount: Option<U256>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub id: Uuid,
    pub tx_hash: H256,
    pub payee: Address,
    /// Absent when the batch spans several payers.
    pub payer: Option<Address>,
    #[serde(with = "amount::decimal")]
    pub total_amount: U256,
    pub voucher_count: usize,
    pub network: Network,
    pub voucher_ids: Vec<Uuid>,
    pub scheme: String,
    pub block_number: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl SettlementRecord {
    pub fn from_new(id: Uuid, new: NewSettlementRecord, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            tx_hash: new.tx_hash,
            payee: new.payee,
            payer: new.payer,
            total_amount: new.total_amount,
            voucher_count: new.voucher_ids.len(),
            network: new.network,
            voucher_ids: new.voucher_ids,
            scheme: new.scheme,
            block_number: new.block_number,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSettlementRecord {
    pub tx_hash: H256,
    pub payee: Address,
    pub payer: Option<Address>,
    pub total_amount: U256,
    pub network: Network,
    pub voucher_ids: Vec<Uuid>,
    pub scheme: String,
    pub block_number: Option<u64>,
}

/// A settlement transaction that has been broadcast but whose outcome has not yet
/// been written back to the voucher records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSubmission {
    pub tx_hash: H256,
    pub payee: Address,
    pub payer: Option<Address>,
    pub network: Network,
    pub voucher_ids: Vec<Uuid>,
    #[serde(with = "amount::decimal")]
    pub total_amount: U256,
    pub broadcast_at: DateTime<Utc>,
}

/// A confirmed or possibly-landed settlement whose bookkeeping could not be completed.
/// Its vouchers stay out of new batches until an operator resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub tx_hash: H256,
    pub payee: Address,
    pub network: Network,
    pub attempted: Vec<Uuid>,
    pub flipped: Vec<Uuid>,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Unsettled total for one (payer, payee, network). Always derived from voucher
/// records, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccumulatedBalance {
    pub payer: Address,
    pub payee: Address,
    pub network: Network,
    #[serde(with = "amount::decimal")]
    pub total_amount: U256,
    pub voucher_count: usize,
    pub voucher_ids: Vec<Uuid>,
}
