use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let health = state.router.health().await;
    let budget = match &health.budget {
        Some(b) => format!("${:.4}/{:.2}", b.spent_usd, b.budget_usd),
        None => "unavailable".to_string(),
    };
    let mut services = serde_json::json!({
        "ollama": if health.ollama_healthy { "ok" } else { "down" },
        "openrouter": if health.openrouter_available { "ok" } else { "unconfigured" },
        "budget": budget,
    });
    if let Some(voice) = &state.voice {
        services["voice"] = serde_json::json!(if voice.is_healthy().await { "ok" } else { "down" });
    }
    let mut channels: Vec<&str> = state.adapters.keys().map(|c| c.as_str()).collect();
    channels.sort_unstable();

    Json(serde_json::json!({
        "status": if state.gateway.is_some() { "ok" } else { "starting" },
        "version": env!("CARGO_PKG_VERSION"),
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "channels": channels,
        "services": services,
    }))
}
