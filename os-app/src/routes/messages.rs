use crate::http_auth::ControlAccess;
use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json};
use os_channels::{Channel, InboundMessage, MessageType};
use serde::Deserialize;
use std::sync::Arc;

/// Identity for HTTP callers that did not present the control key.
pub(crate) const ANONYMOUS_SENDER: &str = "anonymous";

#[derive(Debug, Deserialize)]
struct MessageRequest {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    sender_id: Option<String>,
    content: String,
    #[serde(default)]
    message_type: MessageType,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/message", post(post_message))
}

#[tracing::instrument(level = "info", skip_all)]
async fn post_message(
    Extension(state): Extension<Arc<AppState>>,
    access: Option<Extension<ControlAccess>>,
    Json(req): Json<MessageRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(gateway) = state.gateway.as_ref() else {
        return super::not_ready();
    };

    let access = access.map(|Extension(a)| a);
    let channel = match (access.is_some_and(|a| a.verified), req.channel.as_deref()) {
        (true, Some(channel)) => Channel::parse_lenient(channel),
        _ => Channel::Api,
    };
    let sender = ControlAccess::sender(access, req.sender_id, ANONYMOUS_SENDER);
    let mut message = InboundMessage::text(channel, sender, req.content);
    message.message_type = req.message_type;
    message.conversation_id = req.conversation_id.filter(|id| !id.trim().is_empty());
    message.metadata = req.metadata.unwrap_or(serde_json::Value::Null);

    let response = gateway.handle_message(message).await;
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "text": response.text,
            "metadata": response.metadata,
            "error": response.error,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::routes::test_util::{body_json, json_request};
    use crate::server::test_support;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn runs_the_pipeline_and_persists() {
        let (state, _rx) = test_support::state(SecurityConfig::default());
        let store = state.store.clone();
        let response = router()
            .layer(Extension(state))
            .oneshot(json_request(
                "POST",
                "/api/v1/message",
                serde_json::json!({ "sender_id": "u1", "content": "hi there", "conversation_id": "c1" }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["text"], "hello from the local tier");
        assert!(body["error"].is_null());
        assert_eq!(store.conversation_history("c1", 10).expect("history").len(), 2);
    }

    #[tokio::test]
    async fn unverified_channel_is_api() {
        let (state, _rx) = test_support::state(SecurityConfig::default());
        let response = router()
            .layer(Extension(state))
            .oneshot(json_request(
                "POST",
                "/api/v1/message",
                serde_json::json!({ "channel": "carrier-pigeon", "content": "/start" }),
            ))
            .await
            .expect("response");
        let body = body_json(response).await;
        assert!(body["text"].as_str().expect("text").starts_with("Hello! I'm Jarvis"));
    }

    #[tokio::test]
    async fn answers_503_without_a_gateway() {
        let (state, _rx) = test_support::state_without_gateway();
        let response = router()
            .layer(Extension(state))
            .oneshot(json_request(
                "POST",
                "/api/v1/message",
                serde_json::json!({ "content": "hello" }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    mod control_key {
        use super::*;
        use crate::http_auth::{ControlAuth, require_control_auth};
        use crate::overseer::approvals::{ApprovalKind, ApprovalStatus};
        use axum::middleware;

        fn admin_security() -> SecurityConfig {
            SecurityConfig {
                admin_user_ids: vec!["42".to_string()],
                ..SecurityConfig::default()
            }
        }

        fn app(state: Arc<AppState>, key: Option<&str>) -> axum::Router {
            router()
                .layer(middleware::from_fn(require_control_auth))
                .layer(Extension(ControlAuth::new(key.map(str::to_string))))
                .layer(Extension(state))
        }

        fn pending_prompt_change(state: &AppState) -> String {
            state
                .overseer
                .create_approval(
                    ApprovalKind::PromptChange,
                    "Change security prompt",
                    serde_json::json!({ "new_prompt": "attacker prompt" }),
                    "42",
                )
                .id
        }

        fn approve_body(id: &str) -> serde_json::Value {
            serde_json::json!({ "sender_id": "42", "content": format!("overseer approve {id}") })
        }

        #[tokio::test]
        async fn claimed_admin_id_cannot_approve_without_key() {
            let (state, _rx) = test_support::state(admin_security());
            let id = pending_prompt_change(&state);

            let response = app(state.clone(), None)
                .oneshot(json_request("POST", "/api/v1/message", approve_body(&id)))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["error"], "insufficient_tier");

            let request = state.overseer.approvals().get(&id).expect("request");
            assert_eq!(request.status, ApprovalStatus::Pending);
            assert_ne!(state.overseer.policy().prompt, "attacker prompt");
        }

        #[tokio::test]
        async fn configured_key_is_required() {
            let (state, _rx) = test_support::state(admin_security());
            let id = pending_prompt_change(&state);

            let response = app(state.clone(), Some("s3cret"))
                .oneshot(json_request("POST", "/api/v1/message", approve_body(&id)))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(
                state.overseer.approvals().get(&id).expect("request").status,
                ApprovalStatus::Pending
            );
        }

        #[tokio::test]
        async fn key_holder_acts_as_named_admin() {
            let (state, _rx) = test_support::state(admin_security());
            let id = pending_prompt_change(&state);

            let mut request = json_request("POST", "/api/v1/message", approve_body(&id));
            request
                .headers_mut()
                .insert("authorization", "Bearer s3cret".parse().expect("header"));
            let response = app(state.clone(), Some("s3cret"))
                .oneshot(request)
                .await
                .expect("response");
            let body = body_json(response).await;
            assert_eq!(body["text"], "Approved: Security prompt updated to version 2.");
            assert_eq!(state.overseer.policy().prompt, "attacker prompt");
        }
    }
}
