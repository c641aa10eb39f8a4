use crate::overseer::approvals::{ApprovalError, ApprovalStatus};
use crate::server::AppState;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

const API_APPROVER: &str = "api";

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    status: Option<ApprovalStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct ResolveRequest {
    #[serde(default)]
    by: Option<String>,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/approvals", get(list_approvals))
        .route("/api/v1/approvals/{id}/approve", post(approve))
        .route("/api/v1/approvals/{id}/reject", post(reject))
}

fn approver(body: Option<Json<ResolveRequest>>) -> String {
    body.and_then(|Json(req)| req.by)
        .map(|by| by.trim().to_string())
        .filter(|by| !by.is_empty())
        .unwrap_or_else(|| API_APPROVER.to_string())
}

fn error_response(error: &ApprovalError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match error {
        ApprovalError::NotFound(_) => StatusCode::NOT_FOUND,
        ApprovalError::AlreadyResolved { .. } => StatusCode::CONFLICT,
    };
    (
        status,
        Json(serde_json::json!({ "status": "error", "error": error.to_string() })),
    )
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_approvals(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let approvals: Vec<_> = state
        .overseer
        .approvals()
        .list()
        .into_iter()
        .filter(|req| query.status.is_none_or(|status| req.status == status))
        .map(|req| req.redacted())
        .collect();
    Json(serde_json::json!({ "approvals": approvals }))
}

#[tracing::instrument(level = "info", skip_all, fields(approval_id = %id))]
async fn approve(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ResolveRequest>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let by = approver(body);
    match state.overseer.approve_request(&id, &by).await {
        Ok(message) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "approved",
                "message": message,
                "approval": state.overseer.approvals().get(&id).map(|req| req.redacted()),
            })),
        ),
        Err(error) => error_response(&error),
    }
}

#[tracing::instrument(level = "info", skip_all, fields(approval_id = %id))]
async fn reject(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ResolveRequest>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let by = approver(body);
    match state.overseer.reject_request(&id, &by) {
        Ok(message) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "rejected", "message": message })),
        ),
        Err(error) => error_response(&error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::overseer::approvals::ApprovalKind;
    use crate::routes::test_util::{body_json, get, json_request};
    use crate::server::test_support;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn approve_applies_once_then_conflicts() {
        let (state, _rx) = test_support::state(SecurityConfig::default());
        let request = state.overseer.create_approval(
            ApprovalKind::PromptChange,
            "Change security prompt",
            serde_json::json!({ "new_prompt": "Audit everything twice." }),
            "42",
        );
        let app = router().layer(Extension(state.clone()));

        let uri = format!("/api/v1/approvals/{}/approve", request.id);
        let response = app
            .clone()
            .oneshot(json_request("POST", &uri, serde_json::json!({ "by": "ops" })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "approved");
        assert_eq!(body["approval"]["resolved_by"], "ops");
        assert_eq!(state.overseer.policy().prompt, "Audit everything twice.");

        let response = app
            .oneshot(json_request("POST", &uri, serde_json::json!({})))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_id_is_404() {
        let (state, _rx) = test_support::state(SecurityConfig::default());
        let response = router()
            .layer(Extension(state))
            .oneshot(json_request(
                "POST",
                "/api/v1/approvals/nope/reject",
                serde_json::json!({}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listing_redacts_staged_secrets_and_filters_by_status() {
        let (state, _rx) = test_support::state(SecurityConfig::default());
        state.overseer.create_approval(
            ApprovalKind::KeyAdd,
            "Add key for github",
            serde_json::json!({ "service": "github", "value": "ghp_secret" }),
            "42",
        );
        let rejected = state.overseer.create_approval(
            ApprovalKind::PromptChange,
            "Change security prompt",
            serde_json::json!({ "new_prompt": "x" }),
            "42",
        );
        state
            .overseer
            .reject_request(&rejected.id, "42")
            .expect("reject");
        let app = router().layer(Extension(state));

        let body = body_json(
            app.clone()
                .oneshot(get("/api/v1/approvals"))
                .await
                .expect("response"),
        )
        .await;
        let all = body["approvals"].as_array().expect("list");
        assert_eq!(all.len(), 2);
        assert!(!body.to_string().contains("ghp_secret"));

        let body = body_json(
            app.oneshot(get("/api/v1/approvals?status=pending"))
                .await
                .expect("response"),
        )
        .await;
        let pending = body["approvals"].as_array().expect("list");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["payload"]["value"], "<redacted>");
    }
}
