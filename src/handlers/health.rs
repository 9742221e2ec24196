use crate::{app::AppContext, models::HealthStatus};
use axum::{extract::State, Json};
use chrono::Utc;
use std::sync::Arc;

pub async fn health_check(State(ctx): State<Arc<AppContext>>) -> Json<HealthStatus> {
    let store_ok = ctx.store.ping().await;
    let settlement_networks = ctx.settlement.settlement_networks();

    let status = if !store_ok {
        "unhealthy"
    } else if settlement_networks.is_empty() {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthStatus {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: store_ok,
        settlement_networks,
        uptime_seconds: ctx.analytics.uptime_seconds(),
        timestamp: Utc::now(),
    })
}
