use crate::models::{amount, Network};
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub success: bool,
    pub verified: bool,
    pub voucher_id: Uuid,
    pub signer: Address,
    pub expires_at: DateTime<Utc>,
    pub warnings: Vec<String>,
    pub authorization_state: String,
    pub scheme: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    pub tx_hash: H256,
    #[serde(with = "amount::decimal")]
    pub total_amount: U256,
    pub voucher_count: usize,
    pub settlement_id: Uuid,
    pub voucher_ids: Vec<Uuid>,
    pub block_number: Option<u64>,
    pub explorer: String,
    pub authorization_state: String,
    pub scheme: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PayerBalance {
    pub payer: Address,
    #[serde(with = "amount::decimal")]
    pub amount: U256,
    pub voucher_count: usize,
    pub voucher_ids: Vec<Uuid>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub success: bool,
    pub payee: Address,
    pub network: Network,
    #[serde(with = "amount::decimal")]
    pub total_balance: U256,
    pub balances_by_payer: Vec<PayerBalance>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub store: bool,
    pub settlement_networks: Vec<Network>,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub vouchers_verified: u64,
    pub vouchers_rejected: u64,
    pub settlements_confirmed: u64,
    pub settlements_reverted: u64,
    pub settlements_failed: u64,
    pub reconciliations_required: u64,
    pub vouchers_settled: u64,
    pub uptime_seconds: u64,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    pub x402_version: u8,
    pub kinds: Vec<SupportedKind>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SupportedKind {
    pub scheme: String,
    pub network_id: Network,
    pub extra: DeferredKindExtra,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DeferredKindExtra {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: Address,
    #[serde(with = "amount::decimal")]
    pub min_settlement_amount: U256,
    pub max_voucher_validity_seconds: u64,
    pub settlement_enabled: bool,
    pub endpoints: DeferredEndpoints,
    pub features: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct DeferredEndpoints {
    pub verify: String,
    pub settle: String,
    pub balance: String,
}
