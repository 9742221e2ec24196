use crate::{app::AppContext, models::Stats};
use axum::{extract::State, Json};
use std::sync::Arc;

pub async fn get_stats(State(ctx): State<Arc<AppContext>>) -> Json<Stats> {
    Json(ctx.analytics.get_stats())
}
