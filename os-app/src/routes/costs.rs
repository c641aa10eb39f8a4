use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/costs", get(get_costs))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_costs(
    Extension(state): Extension<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let now = Utc::now();
    let budget = match state.router.costs().budget_status(now) {
        Ok(budget) => budget,
        Err(e) => {
            tracing::error!(error = %e, "budget status unavailable");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
            );
        }
    };
    let breakdown = match state.store.cost_breakdown(now) {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(error = %e, "cost breakdown unavailable");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "status": "error", "error": format!("{e:#}") })),
            );
        }
    };
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "month": now.format("%Y-%m").to_string(),
            "budget": budget,
            "within_budget": state.router.costs().is_within_budget(now),
            "breakdown": breakdown,
        })),
    )
}
