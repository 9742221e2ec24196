use crate::models::{amount::checked_sum, AccumulatedBalance, Network};
use crate::services::store::{StoreError, VoucherStore};
use ethers::types::{Address, U256};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PayeeBalance {
    pub payee: Address,
    pub network: Network,
    pub total: U256,
    pub by_payer: Vec<AccumulatedBalance>,
}

/// Reports what a payee is owed but has not yet settled.
#[derive(Clone)]
pub struct BalanceQuery {
    store: Arc<dyn VoucherStore>,
}

impl BalanceQuery {
    pub fn new(store: Arc<dyn VoucherStore>) -> Self {
        Self { store }
    }

    pub async fn balance(&self, payee: Address, network: Network) -> Result<PayeeBalance, StoreError> {
        let by_payer = self.store.get_accumulated_balances(payee, network).await?;
        let total = checked_sum(by_payer.iter().map(|b| b.total_amount)).ok_or(StoreError::Overflow)?;

        Ok(PayeeBalance { payee, network, total, by_payer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewVoucherRecord, DEFERRED_SCHEME};
    use crate::services::store::MemoryVoucherStore;
    use chrono::{Duration, Utc};

    async fn seed(store: &MemoryVoucherStore, payer: u8, amount: U256, nonce: &str) -> uuid::Uuid {
        store
            .store_voucher(NewVoucherRecord {
                payer: Address::repeat_byte(payer),
                payee: Address::repeat_byte(0xee),
                amount,
                nonce: nonce.to_string(),
                signature: "0x00".to_string(),
                valid_until: Utc::now() + Duration::hours(1),
                network: Network::Celo,
                scheme: DEFERRED_SCHEME.to_string(),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_balance_groups_by_payer() {
        let store = Arc::new(MemoryVoucherStore::new());
        seed(&store, 1, U256::from(1_000_000u64), "n1").await;
        seed(&store, 1, U256::from(2_000_000u64), "n2").await;
        let settled = seed(&store, 2, U256::from(5u64), "n3").await;
        seed(&store, 2, U256::from(7u64), "n4").await;
        store.mark_settled(&[settled]).await.unwrap();

        let balance = BalanceQuery::new(store)
            .balance(Address::repeat_byte(0xee), Network::Celo)
            .await
            .unwrap();

        assert_eq!(balance.total, U256::from(3_000_007u64));
        assert_eq!(balance.by_payer.len(), 2);
        assert_eq!(balance.by_payer[0].total_amount, U256::from(3_000_000u64));
        assert_eq!(balance.by_payer[0].voucher_count, 2);
        assert_eq!(balance.by_payer[1].total_amount, U256::from(7u64));
    }

    #[tokio::test]
    async fn test_amounts_beyond_u64_are_exact() {
        let store = Arc::new(MemoryVoucherStore::new());
        let big = U256::from(u64::MAX) * U256::from(4u64);
        seed(&store, 1, big, "n1").await;
        seed(&store, 2, big, "n2").await;

        let balance = BalanceQuery::new(store)
            .balance(Address::repeat_byte(0xee), Network::Celo)
            .await
            .unwrap();
        assert_eq!(balance.total, big * U256::from(2u64));
    }

    #[tokio::test]
    async fn test_empty_balance_is_zero() {
        let balance = BalanceQuery::new(Arc::new(MemoryVoucherStore::new()))
            .balance(Address::repeat_byte(0xee), Network::Celo)
            .await
            .unwrap();
        assert!(balance.total.is_zero());
        assert!(balance.by_payer.is_empty());
    }
}
