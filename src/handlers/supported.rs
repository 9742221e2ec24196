use crate::app::AppContext;
use crate::models::{
    DeferredEndpoints, DeferredKindExtra, SupportedKind, SupportedResponse, DEFERRED_SCHEME,
    VOUCHER_DOMAIN_NAME, VOUCHER_DOMAIN_VERSION,
};
use axum::{extract::State, Json};
use std::sync::Arc;

const FEATURES: [&str; 5] = [
    "off_chain_voucher_storage",
    "batch_settlement",
    "eip712_signatures",
    "automatic_aggregation",
    "nonce_tracking",
];

pub async fn supported(State(ctx): State<Arc<AppContext>>) -> Json<SupportedResponse> {
    let settlement_networks = ctx.settlement.settlement_networks();

    let kinds = ctx
        .config
        .networks
        .iter()
        .map(|network| SupportedKind {
            scheme: DEFERRED_SCHEME.to_string(),
            network_id: network.network,
            extra: DeferredKindExtra {
                name: VOUCHER_DOMAIN_NAME.to_string(),
                version: VOUCHER_DOMAIN_VERSION.to_string(),
                chain_id: network.network.chain_id(),
                verifying_contract: network.token_address,
                min_settlement_amount: ctx.config.min_settlement_amount,
                max_voucher_validity_seconds: ctx.config.max_voucher_validity_secs,
                settlement_enabled: settlement_networks.contains(&network.network),
                endpoints: DeferredEndpoints {
                    verify: "/deferred/verify".to_string(),
                    settle: "/deferred/settle".to_string(),
                    balance: "/deferred/balance/:payee".to_string(),
                },
                features: FEATURES.iter().map(|f| f.to_string()).collect(),
            },
        })
        .collect();

    Json(SupportedResponse { x402_version: 1, kinds })
}
