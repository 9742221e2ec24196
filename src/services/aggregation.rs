use crate::error::DeferredError;
use crate::models::{amount::checked_sum, Network, SettlementRequest, VoucherRecord};
use crate::services::store::{StoreError, VoucherStore};
use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Which vouchers a settlement request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationScope {
    Payer { payer: Address, payee: Address, network: Network },
    AllPayers { payee: Address, network: Network },
}

impl AggregationScope {
    pub fn payee(&self) -> Address {
        match self {
            AggregationScope::Payer { payee, .. } | AggregationScope::AllPayers { payee, .. } => *payee,
        }
    }

    pub fn network(&self) -> Network {
        match self {
            AggregationScope::Payer { network, .. } | AggregationScope::AllPayers { network, .. } => {
                *network
            }
        }
    }
}

impl From<&SettlementRequest> for AggregationScope {
    fn from(request: &SettlementRequest) -> Self {
        match request.payer {
            Some(payer) => AggregationScope::Payer {
                payer,
                payee: request.payee,
                network: request.network,
            },
            None => AggregationScope::AllPayers { payee: request.payee, network: request.network },
        }
    }
}

/// Unsettled vouchers in scope, split by whether they can still be settled.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    pub live: Vec<VoucherRecord>,
    pub expired: Vec<VoucherRecord>,
}

impl Candidates {
    pub fn is_empty(&self) -> bool {
        self.live.is_empty() && self.expired.is_empty()
    }
}

/// A validated batch ready to be turned into one settlement.
#[derive(Debug, Clone)]
pub struct AggregatedBatch {
    pub payee: Address,
    pub network: Network,
    /// Set when every voucher comes from the same payer.
    pub payer: Option<Address>,
    pub vouchers: Vec<VoucherRecord>,
    pub total_amount: U256,
}

impl AggregatedBatch {
    pub fn voucher_ids(&self) -> Vec<Uuid> {
        self.vouchers.iter().map(|v| v.id).collect()
    }
}

pub struct AggregationPolicy {
    store: Arc<dyn VoucherStore>,
}

impl AggregationPolicy {
    pub fn new(store: Arc<dyn VoucherStore>) -> Self {
        Self { store }
    }

    /// Loads the unsettled vouchers in scope. For all-payer scopes the payers are found
    /// through their accumulated balances and each one's vouchers loaded in turn.
    /// Vouchers already riding on a broadcast transaction, or parked for reconciliation,
    /// are left out.
    pub async fn fetch_candidates(
        &self,
        scope: &AggregationScope,
        now: DateTime<Utc>,
    ) -> Result<Candidates, StoreError> {
        let records = match *scope {
            AggregationScope::Payer { payer, payee, network } => {
                self.store.get_unsettled(Some(payer), payee, network).await?
            }
            AggregationScope::AllPayers { payee, network } => {
                let balances = self.store.get_accumulated_balances(payee, network).await?;
                let per_payer = balances
                    .iter()
                    .map(|b| self.store.get_unsettled(Some(b.payer), payee, network));
                try_join_all(per_payer).await?.into_iter().flatten().collect()
            }
        };

        let mut in_flight: HashSet<Uuid> = self
            .store
            .pending_submissions(scope.payee(), scope.network())
            .await?
            .into_iter()
            .flat_map(|p| p.voucher_ids)
            .collect();
        in_flight.extend(
            self.store
                .reconciliations(scope.payee(), scope.network())
                .await?
                .into_iter()
                .flat_map(|r| r.attempted),
        );

        let (expired, live): (Vec<_>, Vec<_>) = records
            .into_iter()
            .filter(|r| !in_flight.contains(&r.id))
            .partition(|r: &VoucherRecord| r.is_expired(now));
        Ok(Candidates { live, expired })
    }
}

/// Applies the batch rules and computes the exact total.
pub fn validate_batch(
    scope: &AggregationScope,
    vouchers: Vec<VoucherRecord>,
    now: DateTime<Utc>,
    min_amount: Option<U256>,
) -> Result<AggregatedBatch, DeferredError> {
    let Some(first) = vouchers.first() else {
        return Err(DeferredError::AggregationInvalid("no vouchers to aggregate".to_string()));
    };
    let payee = first.payee;
    let network = first.network;

    if payee != scope.payee() {
        return Err(DeferredError::AggregationInvalid(format!(
            "vouchers are for payee {payee:?}, settlement requested for {:?}",
            scope.payee()
        )));
    }
    if network != scope.network() {
        return Err(DeferredError::AggregationInvalid(format!(
            "vouchers are on {network}, settlement requested on {}",
            scope.network()
        )));
    }

    for voucher in &vouchers {
        if voucher.payee != payee {
            return Err(DeferredError::AggregationInvalid(format!(
                "voucher {} has payee {:?}, batch payee is {payee:?}",
                voucher.id, voucher.payee
            )));
        }
        if voucher.network != network {
            return Err(DeferredError::AggregationInvalid(format!(
                "voucher {} is on {}, batch network is {network}",
                voucher.id, voucher.network
            )));
        }
        if voucher.is_expired(now) {
            return Err(DeferredError::AggregationInvalid(format!(
                "voucher {} expired at {}",
                voucher.id, voucher.valid_until
            )));
        }
        if voucher.settled {
            return Err(DeferredError::AggregationInvalid(format!(
                "voucher {} is already settled",
                voucher.id
            )));
        }
    }

    if let AggregationScope::Payer { payer, .. } = scope {
        if let Some(stray) = vouchers.iter().find(|v| v.payer != *payer) {
            return Err(DeferredError::AggregationInvalid(format!(
                "voucher {} is from payer {:?}, settlement requested for {payer:?}",
                stray.id, stray.payer
            )));
        }
    }

    let total_amount = checked_sum(vouchers.iter().map(|v| v.amount)).ok_or_else(|| {
        DeferredError::AggregationInvalid("batch total overflows 256 bits".to_string())
    })?;

    if let Some(minimum) = min_amount {
        if total_amount < minimum {
            return Err(DeferredError::BelowMinimumThreshold { total: total_amount, minimum });
        }
    }

    let payer = first.payer;
    let payer = vouchers.iter().all(|v| v.payer == payer).then_some(payer);

    Ok(AggregatedBatch { payee, network, payer, vouchers, total_amount })
}
