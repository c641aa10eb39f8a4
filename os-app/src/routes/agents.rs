use crate::server::AppState;
use axum::routing::post;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/agents/reload", post(reload_agents))
}

#[tracing::instrument(level = "info", skip_all)]
async fn reload_agents(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let agents = state.router.agents();
    let bindings = agents.reload();
    Json(serde_json::json!({
        "status": "ok",
        "path": agents.path().map(|p| p.display().to_string()),
        "bindings": bindings,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::routes::test_util::{body_json, json_request};
    use crate::server::test_support;
    use axum::http::StatusCode;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn reload_without_backing_file_keeps_bindings() {
        let (state, _rx) = test_support::state(SecurityConfig::default());
        let response = router()
            .layer(Extension(state))
            .oneshot(json_request("POST", "/api/v1/agents/reload", serde_json::json!({})))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert!(body["path"].is_null());
        assert_eq!(body["bindings"], 0);
    }
}
