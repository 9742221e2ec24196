use crate::contracts::DeferredSettlement;
use crate::error::DeferredError;
use crate::models::{amount::checked_sum, Network, Voucher};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::{
    contract::ContractError,
    prelude::*,
    providers::{Http, Provider},
    types::{Address, Bytes, Signature, TransactionReceipt, H256, U256},
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone)]
pub enum ChainError {
    /// The chain rejected the call outright (e.g. reverted during gas estimation).
    #[error("execution reverted: {0}")]
    Reverted(String),

    #[error("RPC error: {0}")]
    Rpc(String),
}

/// One voucher together with the payer signature that authorizes its amount.
#[derive(Debug, Clone)]
pub struct VoucherAuthorization {
    pub voucher_id: Uuid,
    pub voucher: Voucher,
    pub signature: Signature,
}

/// Everything the chain needs to move `total_amount` to the payee.
///
/// The contract verifies every authorization on its own, so the total is never
/// backed by anything other than the individually signed voucher amounts.
#[derive(Debug, Clone)]
pub struct SettlementInstruction {
    network: Network,
    payee: Address,
    total_amount: U256,
    authorizations: Vec<VoucherAuthorization>,
}

impl SettlementInstruction {
    pub fn new(
        network: Network,
        payee: Address,
        total_amount: U256,
        authorizations: Vec<VoucherAuthorization>,
    ) -> Result<Self, DeferredError> {
        if authorizations.is_empty() {
            return Err(DeferredError::InternalError(
                "settlement instruction has no voucher authorizations".to_string(),
            ));
        }
        if let Some(stray) = authorizations.iter().find(|a| a.voucher.payee != payee) {
            return Err(DeferredError::InternalError(format!(
                "voucher {} authorizes payee {:?}, not {payee:?}",
                stray.voucher_id, stray.voucher.payee
            )));
        }

        let authorized = checked_sum(authorizations.iter().map(|a| a.voucher.amount))
            .ok_or_else(|| DeferredError::InternalError("authorized amount overflows".to_string()))?;
        if authorized != total_amount {
            return Err(DeferredError::InternalError(format!(
                "authorized amount {authorized} does not equal settlement total {total_amount}"
            )));
        }

        Ok(Self { network, payee, total_amount, authorizations })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn payee(&self) -> Address {
        self.payee
    }

    pub fn total_amount(&self) -> U256 {
        self.total_amount
    }

    pub fn authorizations(&self) -> &[VoucherAuthorization] {
        &self.authorizations
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedSettlement {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub explorer_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Confirmed(ConfirmedSettlement),
    Reverted { tx_hash: H256, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Known to the node but not yet mined.
    Pending,
    Confirmed(ConfirmedSettlement),
    Reverted,
    /// Not known to the node at all (dropped or never propagated).
    Unknown,
}

/// The on-chain side of settlement.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn network(&self) -> Network;

    /// Broadcasts the settlement and returns its transaction hash without waiting
    /// for it to be mined.
    async fn submit(&self, instruction: &SettlementInstruction) -> Result<H256, ChainError>;

    /// Waits until the transaction is mined. Callers bound this with a timeout.
    async fn confirm(&self, tx_hash: H256) -> Result<SubmissionOutcome, ChainError>;

    async fn status_of(&self, tx_hash: H256) -> Result<TransactionStatus, ChainError>;
}

type SettlementSigner = SignerMiddleware<Provider<Http>, LocalWallet>;

/// [`ChainClient`] talking to the batch settlement contract over JSON-RPC.
pub struct EthersChainClient {
    network: Network,
    client: Arc<SettlementSigner>,
    contract: DeferredSettlement<SettlementSigner>,
    explorer_url: String,
    poll_interval: Duration,
}

impl EthersChainClient {
    pub async fn new(
        network: Network,
        rpc_url: &str,
        private_key: &str,
        contract_address: Address,
        explorer_url: String,
    ) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .with_context(|| format!("Invalid RPC URL for {network}"))?;

        let wallet = private_key
            .parse::<LocalWallet>()
            .with_context(|| format!("Invalid settlement key for {network}"))?
            .with_chain_id(network.chain_id());

        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let block_number = client
            .get_block_number()
            .await
            .with_context(|| format!("{network} RPC unreachable"))?;
        tracing::info!(
            network = %network,
            block = %block_number,
            settlement_contract = ?contract_address,
            facilitator = ?client.address(),
            "Settlement client connected"
        );

        let contract = DeferredSettlement::new(contract_address, client.clone());

        Ok(Self {
            network,
            client,
            contract,
            explorer_url,
            poll_interval: Duration::from_secs(2),
        })
    }

    fn confirmed(&self, receipt: &TransactionReceipt) -> ConfirmedSettlement {
        ConfirmedSettlement {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|n| n.as_u64()),
            explorer_url: format!("{}/tx/{:?}", self.explorer_url, receipt.transaction_hash),
        }
    }
}

fn contract_error<M: Middleware>(err: ContractError<M>) -> ChainError {
    match err {
        ContractError::Revert(data) => ChainError::Reverted(data.to_string()),
        other => ChainError::Rpc(other.to_string()),
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    fn network(&self) -> Network {
        self.network
    }

    async fn submit(&self, instruction: &SettlementInstruction) -> Result<H256, ChainError> {
        let auths = instruction.authorizations();
        let payers = auths.iter().map(|a| a.voucher.payer).collect();
        let amounts = auths.iter().map(|a| a.voucher.amount).collect();
        let nonces = auths.iter().map(|a| Bytes::from(a.voucher.nonce_bytes())).collect();
        let valid_untils = auths.iter().map(|a| U256::from(a.voucher.valid_until)).collect();
        let signatures = auths.iter().map(|a| Bytes::from(a.signature.to_vec())).collect();

        let call = self.contract.settle_vouchers(
            payers,
            instruction.payee(),
            amounts,
            nonces,
            valid_untils,
            signatures,
        );
        let pending = call.send().await.map_err(contract_error)?;
        let tx_hash = pending.tx_hash();

        tracing::info!(
            network = %self.network,
            tx_hash = ?tx_hash,
            voucher_count = auths.len(),
            total_amount = %instruction.total_amount(),
            "Settlement transaction broadcast"
        );
        Ok(tx_hash)
    }

    async fn confirm(&self, tx_hash: H256) -> Result<SubmissionOutcome, ChainError> {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            match self.client.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) if receipt.status == Some(1.into()) => {
                    return Ok(SubmissionOutcome::Confirmed(self.confirmed(&receipt)));
                }
                Ok(Some(_)) => {
                    return Ok(SubmissionOutcome::Reverted {
                        tx_hash,
                        reason: "transaction reverted on-chain".to_string(),
                    });
                }
                Ok(None) => tracing::debug!(tx_hash = ?tx_hash, "Awaiting settlement receipt"),
                Err(e) => tracing::warn!(tx_hash = ?tx_hash, "Receipt lookup failed: {}", e),
            }
        }
    }

    async fn status_of(&self, tx_hash: H256) -> Result<TransactionStatus, ChainError> {
        let receipt = self
            .client
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        if let Some(receipt) = receipt {
            return Ok(if receipt.status == Some(1.into()) {
                TransactionStatus::Confirmed(self.confirmed(&receipt))
            } else {
                TransactionStatus::Reverted
            });
        }

        let tx = self
            .client
            .get_transaction(tx_hash)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        Ok(if tx.is_some() { TransactionStatus::Pending } else { TransactionStatus::Unknown })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authorization(payee: Address, amount: u64) -> VoucherAuthorization {
        VoucherAuthorization {
            voucher_id: Uuid::new_v4(),
            voucher: Voucher {
                payer: Address::repeat_byte(1),
                payee,
                amount: U256::from(amount),
                nonce: "n".to_string(),
                valid_until: 2_000_000_000,
            },
            signature: Signature { r: U256::one(), s: U256::one(), v: 27 },
        }
    }

    #[test]
    fn test_instruction_total_must_match_authorized_amounts() {
        let payee = Address::repeat_byte(9);
        let auths = vec![authorization(payee, 1_000_000), authorization(payee, 2_000_000)];

        assert!(SettlementInstruction::new(Network::Celo, payee, U256::from(3_000_000u64), auths.clone()).is_ok());

        // Scaling one voucher's authorization up to the batch total is exactly what
        // must be refused.
        let err = SettlementInstruction::new(
            Network::Celo,
            payee,
            U256::from(3_000_000u64),
            vec![auths[1].clone()],
        )
        .unwrap_err();
        assert!(matches!(err, DeferredError::InternalError(_)));
    }

    #[test]
    fn test_instruction_rejects_foreign_payee_and_empty_batch() {
        let payee = Address::repeat_byte(9);
        let stray = vec![authorization(Address::repeat_byte(8), 5)];
        assert!(SettlementInstruction::new(Network::Celo, payee, U256::from(5u64), stray).is_err());
        assert!(SettlementInstruction::new(Network::Celo, payee, U256::zero(), vec![]).is_err());
    }
}
