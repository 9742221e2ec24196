use crate::models::Network;
use crate::services::store::{StoreError, VoucherStore};
use std::sync::Arc;

/// Tracks which nonces have been accepted per network.
///
/// This is the early, friendly check. The store's atomic insert remains the guard that
/// holds when two requests race on the same nonce.
#[derive(Clone)]
pub struct NonceLedger {
    store: Arc<dyn VoucherStore>,
}

impl NonceLedger {
    pub fn new(store: Arc<dyn VoucherStore>) -> Self {
        Self { store }
    }

    pub async fn exists(&self, nonce: &str, network: Network) -> Result<bool, StoreError> {
        Ok(self.store.get_by_nonce(nonce, network).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewVoucherRecord, DEFERRED_SCHEME};
    use crate::services::store::MemoryVoucherStore;
    use chrono::{Duration, Utc};
    use ethers::types::{Address, U256};

    #[tokio::test]
    async fn test_nonce_scoped_to_network() {
        let store = Arc::new(MemoryVoucherStore::new());
        store
            .store_voucher(NewVoucherRecord {
                payer: Address::repeat_byte(1),
                payee: Address::repeat_byte(2),
                amount: U256::from(10u64),
                nonce: "n1".to_string(),
                signature: "0x00".to_string(),
                valid_until: Utc::now() + Duration::hours(1),
                network: Network::Celo,
                scheme: DEFERRED_SCHEME.to_string(),
            })
            .await
            .unwrap();

        let ledger = NonceLedger::new(store);
        assert!(ledger.exists("n1", Network::Celo).await.unwrap());
        assert!(!ledger.exists("n1", Network::CeloSepolia).await.unwrap());
        assert!(!ledger.exists("n2", Network::Celo).await.unwrap());
    }
}
