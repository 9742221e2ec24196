use crate::app::AppContext;
use crate::error::{DeferredError, StateError};
use crate::models::{
    BalanceResponse, Network, PayerBalance, SettleResponse, SettlementRequest, VerifyRequest,
    VerifyResponse, DEFERRED_SCHEME,
};
use crate::services::{SettlementState, VerifyState};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    Json,
};
use ethers::types::Address;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;

pub async fn verify_voucher(
    State(ctx): State<Arc<AppContext>>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Json<VerifyResponse>, StateError<VerifyState>> {
    let Json(request) = payload.map_err(|rejection| {
        StateError::new(
            VerifyState::Pending,
            DeferredError::InvalidRequest(rejection.body_text()),
        )
    })?;

    let verified = ctx.verification.verify(request).await?;

    Ok(Json(VerifyResponse {
        success: true,
        verified: true,
        voucher_id: verified.record.id,
        signer: verified.signer,
        expires_at: verified.record.valid_until,
        warnings: verified.warnings,
        authorization_state: verified.state.to_string(),
        scheme: DEFERRED_SCHEME.to_string(),
    }))
}

/// Settlement runs on its own task so that a dropped connection cannot abandon it
/// between broadcast and bookkeeping.
pub async fn settle_vouchers(
    State(ctx): State<Arc<AppContext>>,
    payload: Result<Json<SettlementRequest>, JsonRejection>,
) -> Result<Json<SettleResponse>, StateError<SettlementState>> {
    let Json(request) = payload.map_err(|rejection| {
        StateError::new(
            SettlementState::Pending,
            DeferredError::InvalidRequest(rejection.body_text()),
        )
    })?;

    let orchestrator = ctx.settlement.clone();
    let outcome = tokio::spawn(async move { orchestrator.settle(request).await })
        .await
        .map_err(|e| {
            StateError::new(
                SettlementState::Error,
                DeferredError::InternalError(format!("settlement task failed: {e}")),
            )
        })??;

    let settlement = outcome.settlement;
    Ok(Json(SettleResponse {
        success: true,
        tx_hash: settlement.tx_hash,
        total_amount: settlement.total_amount,
        voucher_count: settlement.voucher_count,
        settlement_id: settlement.id,
        voucher_ids: settlement.voucher_ids,
        block_number: settlement.block_number,
        explorer: outcome.explorer_url,
        authorization_state: outcome.state.to_string(),
        scheme: DEFERRED_SCHEME.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct BalanceParams {
    pub network: Option<String>,
}

pub async fn get_balance(
    State(ctx): State<Arc<AppContext>>,
    Path(payee): Path<String>,
    Query(params): Query<BalanceParams>,
) -> Result<Json<BalanceResponse>, DeferredError> {
    let payee = Address::from_str(&payee)
        .map_err(|_| DeferredError::InvalidRequest(format!("invalid payee address: {payee}")))?;
    let network = match params.network.as_deref() {
        Some(network) => Network::from_str(network)?,
        None => Network::Celo,
    };

    let balance = ctx
        .balances
        .balance(payee, network)
        .await
        .map_err(|e| DeferredError::InternalError(e.to_string()))?;

    Ok(Json(BalanceResponse {
        success: true,
        payee: balance.payee,
        network: balance.network,
        total_balance: balance.total,
        balances_by_payer: balance
            .by_payer
            .into_iter()
            .map(|b| PayerBalance {
                payer: b.payer,
                amount: b.total_amount,
                voucher_count: b.voucher_count,
                voucher_ids: b.voucher_ids,
            })
            .collect(),
    }))
}
