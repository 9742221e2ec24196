use crate::models::DEFERRED_SCHEME;
use crate::services::validator::ValidationReport;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DeferredError {
    #[error("Invalid envelope structure")]
    InvalidStructure(ValidationReport),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Voucher already exists for nonce {nonce}")]
    DuplicateNonce { nonce: String },

    #[error("No unsettled vouchers found")]
    NoUnsettledVouchers,

    #[error("Cannot aggregate vouchers: {0}")]
    AggregationInvalid(String),

    #[error("Total amount {total} below minimum threshold {minimum}")]
    BelowMinimumThreshold { total: U256, minimum: U256 },

    #[error("Settlement reverted: {reason}")]
    SettlementReverted { reason: String, tx_hash: Option<H256> },

    #[error("Settlement transaction {tx_hash:?} is still pending on-chain")]
    SettlementInFlight { tx_hash: H256 },

    #[error("Settlement transaction {tx_hash:?} not confirmed within {timeout_secs}s")]
    SettlementTimeout { tx_hash: H256, timeout_secs: u64 },

    #[error("Reconciliation required for transaction {tx_hash:?}: {reason}")]
    ReconciliationRequired {
        tx_hash: H256,
        attempted: Vec<Uuid>,
        settled: Vec<Uuid>,
        reason: String,
    },

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl DeferredError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DeferredError::InvalidStructure(_) => StatusCode::BAD_REQUEST,
            DeferredError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            DeferredError::DuplicateNonce { .. } => StatusCode::CONFLICT,
            DeferredError::NoUnsettledVouchers => StatusCode::NOT_FOUND,
            DeferredError::AggregationInvalid(_) => StatusCode::BAD_REQUEST,
            DeferredError::BelowMinimumThreshold { .. } => StatusCode::BAD_REQUEST,
            DeferredError::SettlementReverted { .. } => StatusCode::BAD_GATEWAY,
            DeferredError::SettlementInFlight { .. } => StatusCode::CONFLICT,
            DeferredError::SettlementTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DeferredError::UnsupportedNetwork(_) | DeferredError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            DeferredError::ReconciliationRequired { .. } | DeferredError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            DeferredError::InvalidStructure(_) => "INVALID_STRUCTURE",
            DeferredError::InvalidSignature(_) => "INVALID_SIGNATURE",
            DeferredError::DuplicateNonce { .. } => "DUPLICATE_NONCE",
            DeferredError::NoUnsettledVouchers => "NO_UNSETTLED_VOUCHERS",
            DeferredError::AggregationInvalid(_) => "AGGREGATION_INVALID",
            DeferredError::BelowMinimumThreshold { .. } => "BELOW_MINIMUM_THRESHOLD",
            DeferredError::SettlementReverted { .. } => "SETTLEMENT_REVERTED",
            DeferredError::SettlementInFlight { .. } => "SETTLEMENT_IN_FLIGHT",
            DeferredError::SettlementTimeout { .. } => "SETTLEMENT_TIMEOUT",
            DeferredError::ReconciliationRequired { .. } => "RECONCILIATION_REQUIRED",
            DeferredError::UnsupportedNetwork(_) => "UNSUPPORTED_NETWORK",
            DeferredError::InvalidRequest(_) => "INVALID_REQUEST",
            DeferredError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the same request may simply be sent again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeferredError::SettlementReverted { .. }
                | DeferredError::SettlementInFlight { .. }
                | DeferredError::SettlementTimeout { .. }
                | DeferredError::InternalError(_)
        )
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            DeferredError::InvalidStructure(report) => serde_json::to_value(&report.errors).ok(),
            DeferredError::InvalidSignature(reason) | DeferredError::AggregationInvalid(reason) => {
                Some(serde_json::Value::String(reason.clone()))
            }
            DeferredError::DuplicateNonce { nonce } => Some(serde_json::json!({
                "duplicate": true,
                "nonce": nonce,
            })),
            DeferredError::BelowMinimumThreshold { total, minimum } => Some(serde_json::json!({
                "totalAmount": total.to_string(),
                "minAmount": minimum.to_string(),
            })),
            DeferredError::SettlementReverted { reason, tx_hash } => Some(serde_json::json!({
                "reason": reason,
                "txHash": tx_hash,
            })),
            DeferredError::SettlementInFlight { tx_hash }
            | DeferredError::SettlementTimeout { tx_hash, .. } => {
                Some(serde_json::json!({ "txHash": tx_hash }))
            }
            DeferredError::ReconciliationRequired { tx_hash, attempted, settled, .. } => {
                Some(serde_json::json!({
                    "txHash": tx_hash,
                    "attemptedVoucherIds": attempted,
                    "settledVoucherIds": settled,
                }))
            }
            _ => None,
        }
    }

    fn warnings(&self) -> Option<Vec<String>> {
        match self {
            DeferredError::InvalidStructure(report) => Some(report.warnings.clone()),
            _ => None,
        }
    }
}

/// A failure together with the lifecycle state the request was in when it stopped.
#[derive(Debug)]
pub struct StateError<S> {
    pub state: S,
    pub error: DeferredError,
}

impl<S> StateError<S> {
    pub fn new(state: S, error: DeferredError) -> Self {
        Self { state, error }
    }
}

impl<S: fmt::Display> fmt::Display for StateError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (authorization_state: {})", self.error, self.state)
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_state: Option<String>,
    pub retryable: bool,
    pub scheme: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub request_id: String,
}

fn error_response(error: &DeferredError, state: Option<String>) -> Response {
    let status = error.status_code();
    let body = ErrorResponse {
        success: false,
        error: error.to_string(),
        error_code: error.error_code().to_string(),
        details: error.details(),
        warnings: error.warnings(),
        authorization_state: state,
        retryable: error.is_retryable(),
        scheme: DEFERRED_SCHEME.to_string(),
        timestamp: Utc::now(),
        request_id: Uuid::new_v4().to_string(),
    };

    if status.is_server_error() {
        tracing::error!(error = ?error, error_code = body.error_code, "Request failed");
    } else {
        tracing::debug!(error = %error, error_code = body.error_code, "Request rejected");
    }

    (status, Json(body)).into_response()
}

impl IntoResponse for DeferredError {
    fn into_response(self) -> Response {
        error_response(&self, None)
    }
}

impl<S: fmt::Display> IntoResponse for StateError<S> {
    fn into_response(self) -> Response {
        error_response(&self.error, Some(self.state.to_string()))
    }
}
