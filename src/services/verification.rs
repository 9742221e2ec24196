use crate::error::{DeferredError, StateError};
use crate::models::{NewVoucherRecord, VerifyRequest, VoucherRecord, DEFERRED_SCHEME};
use crate::services::analytics::Analytics;
use crate::services::nonce_ledger::NonceLedger;
use crate::services::store::{StoreError, VoucherStore};
use crate::services::validator::VoucherValidator;
use chrono::Utc;
use ethers::types::Address;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyState {
    Pending,
    ValidatingStructure,
    VerifyingSignature,
    CheckingDuplicate,
    StoringVoucher,
    VerifiedStored,
}

impl VerifyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyState::Pending => "pending",
            VerifyState::ValidatingStructure => "validating_structure",
            VerifyState::VerifyingSignature => "verifying_signature",
            VerifyState::CheckingDuplicate => "checking_duplicate",
            VerifyState::StoringVoucher => "storing_voucher",
            VerifyState::VerifiedStored => "verified_stored",
        }
    }
}

impl fmt::Display for VerifyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct VerifiedVoucher {
    pub record: VoucherRecord,
    pub signer: Address,
    pub warnings: Vec<String>,
    pub state: VerifyState,
}

/// Accepts a signed voucher: structure, signature, nonce uniqueness, then persistence.
pub struct VerificationService {
    validator: VoucherValidator,
    ledger: NonceLedger,
    store: Arc<dyn VoucherStore>,
    analytics: Arc<Analytics>,
}

impl VerificationService {
    pub fn new(
        validator: VoucherValidator,
        store: Arc<dyn VoucherStore>,
        analytics: Arc<Analytics>,
    ) -> Self {
        Self {
            validator,
            ledger: NonceLedger::new(store.clone()),
            store,
            analytics,
        }
    }

    pub fn validator(&self) -> &VoucherValidator {
        &self.validator
    }

    pub async fn verify(
        &self,
        request: VerifyRequest,
    ) -> Result<VerifiedVoucher, StateError<VerifyState>> {
        let started = Instant::now();
        let result = self.run(request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(verified) => {
                self.analytics.record_verified();
                tracing::info!(
                    authorization_state = %verified.state,
                    voucher_id = %verified.record.id,
                    payer = ?verified.record.payer,
                    payee = ?verified.record.payee,
                    amount = %verified.record.amount,
                    network = %verified.record.network,
                    duration_ms,
                    "deferred.verify.ok"
                );
            }
            Err(failure) => {
                self.analytics.record_rejected();
                tracing::info!(
                    authorization_state = %failure.state,
                    error_code = failure.error.error_code(),
                    duration_ms,
                    "deferred.verify.fail: {}",
                    failure.error
                );
            }
        }

        result
    }

    async fn run(&self, request: VerifyRequest) -> Result<VerifiedVoucher, StateError<VerifyState>> {
        let network = request.network;

        let state = VerifyState::ValidatingStructure;
        let structured = self
            .validator
            .check_structure(&request.voucher, &request.signature, Utc::now())
            .map_err(|report| StateError::new(state, DeferredError::InvalidStructure(report)))?;

        let state = VerifyState::VerifyingSignature;
        let signer = self
            .validator
            .verify_signature(&structured.voucher, &structured.signature, network)
            .map_err(|e| StateError::new(state, e))?;

        let state = VerifyState::CheckingDuplicate;
        let voucher = structured.voucher;
        let duplicate = self
            .ledger
            .exists(&voucher.nonce, network)
            .await
            .map_err(|e| StateError::new(state, DeferredError::InternalError(e.to_string())))?;
        if duplicate {
            return Err(StateError::new(
                state,
                DeferredError::DuplicateNonce { nonce: voucher.nonce },
            ));
        }

        let state = VerifyState::StoringVoucher;
        let valid_until = voucher.expires_at().ok_or_else(|| {
            StateError::new(
                state,
                DeferredError::InternalError("validUntil out of range".to_string()),
            )
        })?;

        let record = self
            .store
            .store_voucher(NewVoucherRecord {
                payer: voucher.payer,
                payee: voucher.payee,
                amount: voucher.amount,
                nonce: voucher.nonce,
                signature: format!("0x{}", structured.signature),
                valid_until,
                network,
                scheme: DEFERRED_SCHEME.to_string(),
            })
            .await
            .map_err(|e| match e {
                StoreError::Conflict { nonce, .. } => {
                    StateError::new(VerifyState::CheckingDuplicate, DeferredError::DuplicateNonce { nonce })
                }
                other => StateError::new(state, DeferredError::InternalError(other.to_string())),
            })?;

        Ok(VerifiedVoucher {
            record,
            signer,
            warnings: structured.warnings,
            state: VerifyState::VerifiedStored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::voucher::VoucherSigner;
    use crate::models::{Network, VoucherDomain};
    use crate::services::store::MemoryVoucherStore;
    use ethers::types::U256;
    use std::collections::HashMap;
    use std::str::FromStr;

    const PAYER_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn domain() -> VoucherDomain {
        VoucherDomain {
            chain_id: Network::Celo.chain_id(),
            token: Address::from_str(Network::Celo.default_token_address()).unwrap(),
        }
    }

    fn service(store: Arc<MemoryVoucherStore>) -> VerificationService {
        let mut domains = HashMap::new();
        domains.insert(Network::Celo, domain());
        VerificationService::new(
            VoucherValidator::new(domains, 3600),
            store,
            Arc::new(Analytics::new()),
        )
    }

    async fn signed_request(amount: u64, nonce: &str) -> (serde_json::Value, VoucherSigner) {
        let signer = VoucherSigner::from_private_key(PAYER_KEY).unwrap();
        let valid_until = (Utc::now().timestamp() + 600) as u64;
        let voucher = signer.voucher(Address::repeat_byte(0xee), U256::from(amount), nonce, valid_until);
        let signature = signer.sign(&voucher, domain()).await.unwrap();
        (VoucherSigner::envelope(&voucher, &signature, Network::Celo), signer)
    }

    fn parse(body: serde_json::Value) -> VerifyRequest {
        serde_json::from_value(body).unwrap()
    }

    #[tokio::test]
    async fn test_verify_stores_voucher() {
        let store = Arc::new(MemoryVoucherStore::new());
        let service = service(store.clone());
        let (body, signer) = signed_request(1_000_000, "n1").await;

        let verified = service.verify(parse(body)).await.unwrap();
        assert_eq!(verified.state, VerifyState::VerifiedStored);
        assert_eq!(verified.signer, signer.address());
        assert_eq!(verified.record.amount, U256::from(1_000_000u64));
        assert!(!verified.record.settled);
        assert!(store.get_by_nonce("n1", Network::Celo).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_same_nonce_is_duplicate_even_with_other_fields_changed() {
        let store = Arc::new(MemoryVoucherStore::new());
        let service = service(store.clone());

        let (first, _) = signed_request(1_000_000, "n1").await;
        service.verify(parse(first)).await.unwrap();

        let (second, _) = signed_request(7, "n1").await;
        let err = service.verify(parse(second)).await.unwrap_err();
        assert_eq!(err.state, VerifyState::CheckingDuplicate);
        assert!(matches!(err.error, DeferredError::DuplicateNonce { .. }));

        let unsettled = store
            .get_unsettled(None, Address::repeat_byte(0xee), Network::Celo)
            .await
            .unwrap();
        assert_eq!(unsettled.len(), 1);
    }

    #[tokio::test]
    async fn test_reencoded_nonce_cannot_replay_signature() {
        let store = Arc::new(MemoryVoucherStore::new());
        let service = service(store.clone());

        let (first, _) = signed_request(1_000_000, "jb").await;
        service.verify(parse(first.clone())).await.unwrap();

        // Each spelling signs the same bytes as "jb", so the original signature still verifies.
        for spelling in ["0x6a62", "0x6A62"] {
            let mut replay = first.clone();
            replay["voucher"]["nonce"] = serde_json::json!(spelling);
            let err = service.verify(parse(replay)).await.unwrap_err();
            assert_eq!(err.state, VerifyState::CheckingDuplicate, "{spelling}");
            assert!(matches!(err.error, DeferredError::DuplicateNonce { .. }));
        }

        let unsettled = store
            .get_unsettled(None, Address::repeat_byte(0xee), Network::Celo)
            .await
            .unwrap();
        assert_eq!(unsettled.len(), 1);
    }

    #[tokio::test]
    async fn test_far_future_expiry_is_a_structure_error() {
        let service = service(Arc::new(MemoryVoucherStore::new()));
        let (mut body, _) = signed_request(1_000_000, "n1").await;
        body["voucher"]["validUntil"] = serde_json::json!(99_999_999_999_999u64);

        let err = service.verify(parse(body)).await.unwrap_err();
        assert_eq!(err.state, VerifyState::ValidatingStructure);
        assert_eq!(err.error.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_tampered_amount_fails_signature() {
        let store = Arc::new(MemoryVoucherStore::new());
        let service = service(store.clone());
        let (mut body, _) = signed_request(1_000_000, "n1").await;
        body["voucher"]["amount"] = serde_json::json!("9000000");

        let err = service.verify(parse(body)).await.unwrap_err();
        assert_eq!(err.state, VerifyState::VerifyingSignature);
        assert!(matches!(err.error, DeferredError::InvalidSignature(_)));
        assert!(store.get_by_nonce("n1", Network::Celo).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_envelope_reports_fields() {
        let service = service(Arc::new(MemoryVoucherStore::new()));
        let (mut body, _) = signed_request(1_000_000, "n1").await;
        body["voucher"]["payer"] = serde_json::json!("not-an-address");
        body["voucher"]["amount"] = serde_json::json!("0");

        let err = service.verify(parse(body)).await.unwrap_err();
        assert_eq!(err.state, VerifyState::ValidatingStructure);
        let DeferredError::InvalidStructure(report) = err.error else {
            panic!("expected a structure error");
        };
        let fields: Vec<&str> = report.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"payer"));
        assert!(fields.contains(&"amount"));
    }

    #[tokio::test]
    async fn test_network_without_domain_is_unsupported() {
        let service = service(Arc::new(MemoryVoucherStore::new()));
        let (mut body, _) = signed_request(1_000_000, "n1").await;
        body["network"] = serde_json::json!("celo-sepolia");

        let err = service.verify(parse(body)).await.unwrap_err();
        assert!(matches!(err.error, DeferredError::UnsupportedNetwork(_)));
    }
}
