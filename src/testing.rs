//! Test doubles for the chain collaborator.

use crate::models::Network;
use crate::services::chain::{
    ChainClient, ChainError, ConfirmedSettlement, SettlementInstruction, SubmissionOutcome,
    TransactionStatus,
};
use async_trait::async_trait;
use ethers::types::{H256, U256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What the scripted chain does with the next submission.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Confirm,
    /// Rejected at broadcast, before a transaction exists.
    RejectOnSubmit(String),
    /// Mined but reverted.
    Revert(String),
    /// Broadcast, then never mined within `confirm`'s lifetime.
    Hang,
    TransportError(String),
}

/// A [`ChainClient`] that replays queued outcomes and records every instruction.
pub struct ScriptedChainClient {
    network: Network,
    outcomes: Mutex<VecDeque<ScriptedOutcome>>,
    submitted: Mutex<Vec<SettlementInstruction>>,
    statuses: Mutex<Vec<(H256, TransactionStatus)>>,
    in_flight: Mutex<Vec<(H256, ScriptedOutcome)>>,
    counter: AtomicU64,
}

impl ScriptedChainClient {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            outcomes: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
            in_flight: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn push(&self, outcome: ScriptedOutcome) -> &Self {
        self.lock(&self.outcomes).push_back(outcome);
        self
    }

    /// Answer for a later `status_of` query on `tx_hash`.
    pub fn set_status(&self, tx_hash: H256, status: TransactionStatus) {
        let mut statuses = self.lock(&self.statuses);
        statuses.retain(|(hash, _)| *hash != tx_hash);
        statuses.push((tx_hash, status));
    }

    pub fn submissions(&self) -> Vec<SettlementInstruction> {
        self.lock(&self.submitted).clone()
    }

    pub fn submission_count(&self) -> usize {
        self.lock(&self.submitted).len()
    }

    pub fn confirmed(tx_hash: H256) -> ConfirmedSettlement {
        ConfirmedSettlement {
            tx_hash,
            block_number: Some(1),
            explorer_url: format!("https://explorer.test/tx/{tx_hash:?}"),
        }
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ChainClient for ScriptedChainClient {
    fn network(&self) -> Network {
        self.network
    }

    async fn submit(&self, instruction: &SettlementInstruction) -> Result<H256, ChainError> {
        self.lock(&self.submitted).push(instruction.clone());
        let outcome = self
            .lock(&self.outcomes)
            .pop_front()
            .unwrap_or(ScriptedOutcome::Confirm);

        match outcome {
            ScriptedOutcome::RejectOnSubmit(reason) => Err(ChainError::Reverted(reason)),
            ScriptedOutcome::TransportError(reason) => Err(ChainError::Rpc(reason)),
            other => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                let tx_hash = H256::from_low_u64_be(n);
                self.lock(&self.in_flight).push((tx_hash, other));
                Ok(tx_hash)
            }
        }
    }

    async fn confirm(&self, tx_hash: H256) -> Result<SubmissionOutcome, ChainError> {
        let outcome = self
            .lock(&self.in_flight)
            .iter()
            .find(|(hash, _)| *hash == tx_hash)
            .map(|(_, outcome)| outcome.clone());

        match outcome {
            Some(ScriptedOutcome::Revert(reason)) => {
                Ok(SubmissionOutcome::Reverted { tx_hash, reason })
            }
            Some(ScriptedOutcome::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ChainError::Rpc("gave up waiting".to_string()))
            }
            Some(_) => Ok(SubmissionOutcome::Confirmed(Self::confirmed(tx_hash))),
            None => Err(ChainError::Rpc(format!("unknown transaction {tx_hash:?}"))),
        }
    }

    async fn status_of(&self, tx_hash: H256) -> Result<TransactionStatus, ChainError> {
        Ok(self
            .lock(&self.statuses)
            .iter()
            .find(|(hash, _)| *hash == tx_hash)
            .map(|(_, status)| status.clone())
            .unwrap_or(TransactionStatus::Pending))
    }
}

/// Sum of the amounts a scripted chain was asked to move.
pub fn submitted_total(chain: &ScriptedChainClient) -> U256 {
    chain
        .submissions()
        .iter()
        .fold(U256::zero(), |acc, s| acc + s.total_amount())
}
