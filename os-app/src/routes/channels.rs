use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json};
use os_channels::{Channel, WhatsAppInbound};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/channels/whatsapp/inbound", post(whatsapp_inbound))
}

/// The bridge posts each WhatsApp message here. Replies go back out through
/// the bridge adapter once the gateway has handled the message.
#[tracing::instrument(level = "info", skip_all)]
async fn whatsapp_inbound(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<WhatsAppInbound>,
) -> (StatusCode, Json<serde_json::Value>) {
    if !state.adapters.contains_key(&Channel::Whatsapp) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "status": "error", "error": "whatsapp channel is not enabled" })),
        );
    }
    let Some(message) = payload.into_inbound() else {
        return (StatusCode::OK, Json(serde_json::json!({ "status": "ignored" })));
    };
    let message_id = message.message_id.to_string();
    if let Err(e) = state.inbound_tx.send(message).await {
        tracing::error!(error = %e, "inbound queue closed; dropping whatsapp message");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "error", "error": "gateway is shutting down" })),
        );
    }
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "queued", "message_id": message_id })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::routes::test_util::{body_json, json_request};
    use crate::server::test_support;
    use os_channels::{ChannelAdapter, WhatsAppBridgeAdapter};
    use std::collections::HashMap;
    use tower::util::ServiceExt;

    fn whatsapp_adapters() -> HashMap<Channel, Arc<dyn ChannelAdapter>> {
        let adapter = WhatsAppBridgeAdapter::new("http://localhost:3001").expect("adapter");
        HashMap::from([(Channel::Whatsapp, Arc::new(adapter) as Arc<dyn ChannelAdapter>)])
    }

    #[tokio::test]
    async fn disabled_channel_is_404() {
        let (state, _rx) = test_support::state(SecurityConfig::default());
        let response = router()
            .layer(Extension(state))
            .oneshot(json_request(
                "POST",
                "/api/v1/channels/whatsapp/inbound",
                serde_json::json!({ "from": "15551234", "message": "hi" }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn queues_messages_for_the_gateway() {
        let (state, mut rx) =
            test_support::state_with_adapters(SecurityConfig::default(), whatsapp_adapters());
        let app = router().layer(Extension(state));

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/channels/whatsapp/inbound",
                serde_json::json!({ "from": "15551234", "body": "what's up", "pushName": "Sam" }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let queued = rx.recv().await.expect("queued message");
        assert_eq!(queued.channel, Channel::Whatsapp);
        assert_eq!(queued.content, "what's up");
        assert_eq!(queued.conversation_id.as_deref(), Some("wa-15551234"));

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/channels/whatsapp/inbound",
                serde_json::json!({ "from": "15551234", "message": "   " }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ignored");
    }
}
