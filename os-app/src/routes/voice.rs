//! `/ws/voice`: binary 16-bit PCM in; JSON transcriptions and replies out,
//! each reply followed by a binary WAV frame of the spoken answer.

use crate::http_auth::ControlAccess;
use crate::server::AppState;
use axum::extract::Query;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json};
use os_channels::voice::{DEFAULT_SAMPLE_RATE, pcm_to_wav};
use os_channels::{
    AudioSegment, AudioSegmenter, Channel, InboundMessage, MessageType, SegmenterConfig,
    VoiceGatewayClient,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

const VOICE_SENDER: &str = "voice";

#[derive(Debug, Deserialize)]
struct VoiceQuery {
    #[serde(default)]
    sender_id: Option<String>,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/ws/voice", get(voice_socket))
}

async fn voice_socket(
    Extension(state): Extension<Arc<AppState>>,
    access: Option<Extension<ControlAccess>>,
    Query(query): Query<VoiceQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(voice) = state.voice.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "error", "error": "voice channel is not enabled" })),
        )
            .into_response();
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    let sender = ControlAccess::sender(access.map(|Extension(a)| a), query.sender_id, VOICE_SENDER);
    upgrade.on_upgrade(move |socket| handle_socket(state, voice, sender, socket))
}

#[tracing::instrument(level = "info", skip_all, fields(sender = %sender))]
async fn handle_socket(
    state: Arc<AppState>,
    voice: VoiceGatewayClient,
    sender: String,
    mut socket: WebSocket,
) {
    tracing::info!("voice session opened");
    let mut segmenter = AudioSegmenter::new(SegmenterConfig::default(), Instant::now());

    while let Some(frame) = socket.recv().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "voice socket receive failed");
                break;
            }
        };
        match frame {
            Message::Binary(chunk) => {
                if let Some(segment) = segmenter.feed(&chunk, Instant::now()) {
                    if !process_segment(&state, &voice, &sender, segment, &mut socket).await {
                        return;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(segment) = segmenter.close(Instant::now()) {
        process_segment(&state, &voice, &sender, segment, &mut socket).await;
    }
    tracing::info!("voice session closed");
}

/// Returns false once the client is gone.
async fn process_segment(
    state: &AppState,
    voice: &VoiceGatewayClient,
    sender: &str,
    segment: AudioSegment,
    socket: &mut WebSocket,
) -> bool {
    let wav = pcm_to_wav(&segment.pcm, DEFAULT_SAMPLE_RATE);
    let transcription = match voice.transcribe(wav, "segment.wav").await {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(error = %e, "voice segment transcription failed");
            let payload = serde_json::json!({ "type": "error", "message": e.to_string() });
            return send_json(socket, payload).await;
        }
    };
    let payload = serde_json::json!({
        "type": "transcription",
        "text": transcription.text,
        "language": transcription.language,
        "duration": transcription.duration,
    });
    if !send_json(socket, payload).await {
        return false;
    }

    let text = transcription.text.trim();
    let Some(gateway) = state.gateway.as_ref() else {
        return true;
    };
    if text.is_empty() {
        return true;
    }
    let mut message = InboundMessage::text(Channel::Voice, sender, text);
    message.message_type = MessageType::Voice;
    message.audio_duration = Some(segment.duration_secs);
    let response = gateway.handle_message(message).await;
    let payload = serde_json::json!({
        "type": "reply",
        "text": response.text,
        "error": response.error,
    });
    if !send_json(socket, payload).await {
        return false;
    }
    if response.text.trim().is_empty() {
        return true;
    }
    match voice.synthesize(&response.text, &state.tts_voice).await {
        Ok(audio) => socket.send(Message::Binary(audio)).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "reply synthesis failed; sent text only");
            true
        }
    }
}

async fn send_json(socket: &mut WebSocket, payload: serde_json::Value) -> bool {
    match socket.send(Message::Text(payload.to_string().into())).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "voice socket send failed");
            false
        }
    }
}
