use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/skills", get(list_skills))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_skills(
    Extension(state): Extension<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(gateway) = state.gateway.as_ref() else {
        return super::not_ready();
    };
    (
        StatusCode::OK,
        Json(serde_json::json!({ "skills": gateway.registry().list() })),
    )
}
