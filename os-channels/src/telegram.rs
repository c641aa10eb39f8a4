use crate::traits::ChannelAdapter;
use crate::types::{Channel, InboundMessage, MessageType, OutboundMessage};
use crate::voice::VoiceGatewayClient;
use anyhow::{Result, anyhow};
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message"]"#;
const TELEGRAM_NON_TEXT_PLACEHOLDER: &str = "[telegram non-text message]";
const TELEGRAM_VOICE_FAILED_REPLY: &str =
    "Sorry, I couldn't transcribe that voice message. Please try again or send text.";
/// Telegram rejects longer `sendMessage` texts.
const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
    voice: Option<VoiceGatewayClient>,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let bot_token = bot_token.trim();
        if bot_token.is_empty() {
            return Err(anyhow!("telegram bot token is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            voice: None,
        })
    }

    /// Voice notes are transcribed through the voice gateway when set.
    pub fn with_voice_gateway(mut self, voice: VoiceGatewayClient) -> Self {
        self.voice = Some(voice);
        self
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{TELEGRAM_API_BASE}/bot{}/{}",
            self.bot_token, method
        ))?)
    }

    fn file_url(&self, file_path: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{TELEGRAM_API_BASE}/file/bot{}/{}",
            self.bot_token, file_path
        ))?)
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<()> {
        let url = self.api_url("sendMessage")?;
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let resp = self.http.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow!("telegram send failed: status={status} body={text}"));
        }
        Ok(())
    }

    /// Resolves a voice note's `file_id`, downloads it and transcribes it.
    #[tracing::instrument(level = "info", skip_all)]
    async fn transcribe_voice(&self, voice: &VoiceGatewayClient, file_id: &str) -> Result<String> {
        let url = self.api_url("getFile")?;
        let resp = self
            .http
            .get(url)
            .query(&[("file_id", file_id)])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("telegram getFile failed: status={status} body={body}"));
        }
        let file: TelegramGetFileResponse = resp.json().await?;
        let file_path = file
            .result
            .and_then(|f| f.file_path)
            .ok_or_else(|| anyhow!("telegram getFile returned no file_path"))?;

        let audio = self
            .http
            .get(self.file_url(&file_path)?)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let transcription = voice.transcribe(audio.to_vec(), "voice.ogg").await?;
        let text = transcription.text.trim().to_string();
        if text.is_empty() {
            return Err(anyhow!("voice transcription was empty"));
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        for chunk in split_message(&message.content, TELEGRAM_MAX_MESSAGE_CHARS) {
            self.send_text(recipient_id, chunk).await?;
        }
        Ok(())
    }

    async fn typing(&self, recipient_id: &str) -> Result<()> {
        let url = self.api_url("sendChatAction")?;
        let body = serde_json::json!({ "chat_id": recipient_id, "action": "typing" });
        let resp = self.http.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(anyhow!("telegram sendChatAction failed: status={status}"));
        }
        Ok(())
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response.json::<TelegramGetUpdatesResponse>().await {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result;
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                let Some(mut inbound) = build_message_inbound(update.update_id, update.message.as_ref())
                else {
                    continue;
                };
                if let Some(file_id) = voice_file_id(update.message.as_ref()) {
                    if !self.resolve_voice(&mut inbound, file_id).await {
                        continue;
                    }
                }
                tx.send(inbound)
                    .await
                    .map_err(|e| anyhow!("telegram inbound queue closed: {e}"))?;
            }
        }
    }
}

impl TelegramAdapter {
    /// Replaces the placeholder content with a transcript. Returns false when
    /// the message should be dropped (the user has already been told why).
    async fn resolve_voice(&self, inbound: &mut InboundMessage, file_id: &str) -> bool {
        let Some(voice) = self.voice.as_ref() else {
            return true;
        };
        match self.transcribe_voice(voice, file_id).await {
            Ok(text) => {
                inbound.content = text;
                true
            }
            Err(error) => {
                tracing::warn!(%error, "telegram voice transcription failed");
                if let Err(error) = self
                    .send_text(inbound.reply_target(), TELEGRAM_VOICE_FAILED_REPLY)
                    .await
                {
                    tracing::warn!(%error, "telegram voice failure notice not delivered");
                }
                false
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn build_message_inbound(
    update_id: i64,
    message: Option<&TelegramMessage>,
) -> Option<InboundMessage> {
    let message = message?;
    let chat = message.chat.as_ref()?;
    let content = extract_message_content(message)?;
    let sender_id = message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| format!("chat:{}", chat.id));
    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{update_id}:message"));
    let message_type = if message.voice.is_some() {
        MessageType::Voice
    } else if content.starts_with('/') {
        MessageType::Command
    } else if !message.photo.is_empty() {
        MessageType::Image
    } else {
        MessageType::Text
    };

    Some(InboundMessage {
        message_id: message_id.into(),
        channel: Channel::Telegram,
        sender_id: sender_id.into(),
        thread_id: Some(chat.id.to_string().into()),
        is_group: chat.r#type != "private",
        content,
        message_type,
        conversation_id: Some(format!("tg-{}", chat.id)),
        reply_to: None,
        audio_url: None,
        audio_duration: message.voice.as_ref().and_then(|v| v.duration),
        metadata: serde_json::to_value(message).unwrap_or(serde_json::Value::Null),
        received_at: Utc::now(),
    })
}

fn voice_file_id(message: Option<&TelegramMessage>) -> Option<&str> {
    message?
        .voice
        .as_ref()
        .map(|voice| voice.file_id.as_str())
        .filter(|id| !id.is_empty())
}

/// Splits on char boundaries, preferring the last newline inside each window.
fn split_message(text: &str, max_chars: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = text;
    while rest.chars().count() > max_chars {
        let hard_end = rest
            .char_indices()
            .nth(max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let end = match rest[..hard_end].rfind('\n') {
            Some(idx) if idx > 0 => idx,
            _ => hard_end,
        };
        out.push(&rest[..end]);
        rest = rest[end..].trim_start_matches('\n');
    }
    if !rest.is_empty() || out.is_empty() {
        out.push(rest);
    }
    out
}

fn extract_message_content(message: &TelegramMessage) -> Option<String> {
    if let Some(text) = message.text.as_deref().map(str::trim) {
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    if let Some(caption) = message.caption.as_deref().map(str::trim) {
        if !caption.is_empty() {
            return Some(caption.to_string());
        }
    }
    if message.has_non_text_payload() {
        return Some(TELEGRAM_NON_TEXT_PLACEHOLDER.to_string());
    }
    None
}

#[derive(Debug, Deserialize)]
struct TelegramGetUpdatesResponse {
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramGetFileResponse {
    #[serde(default)]
    result: Option<TelegramFile>,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    #[serde(default)]
    file_path: Option<String>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<serde_json::Value>,
    #[serde(default)]
    sticker: Option<serde_json::Value>,
    #[serde(default)]
    animation: Option<serde_json::Value>,
    #[serde(default)]
    audio: Option<serde_json::Value>,
    #[serde(default)]
    document: Option<serde_json::Value>,
    #[serde(default)]
    video: Option<serde_json::Value>,
    #[serde(default)]
    voice: Option<TelegramVoice>,
    #[serde(default)]
    video_note: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct TelegramVoice {
    file_id: String,
    #[serde(default)]
    duration: Option<f64>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    r#type: String,
}

impl TelegramMessage {
    fn has_non_text_payload(&self) -> bool {
        !self.photo.is_empty()
            || self.sticker.is_some()
            || self.animation.is_some()
            || self.audio.is_some()
            || self.document.is_some()
            || self.video.is_some()
            || self.voice.is_some()
            || self.video_note.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        TELEGRAM_NON_TEXT_PLACEHOLDER, TelegramChat, TelegramMessage, TelegramUser, TelegramVoice,
        build_message_inbound, extract_message_content, split_message, transient_retry_delay,
        voice_file_id,
    };
    use crate::types::{Channel, MessageType};

    fn message(chat_type: &str) -> TelegramMessage {
        TelegramMessage {
            message_id: Some(5),
            from: None,
            chat: Some(TelegramChat {
                id: 10,
                r#type: chat_type.to_string(),
            }),
            text: None,
            caption: None,
            photo: vec![],
            sticker: None,
            animation: None,
            audio: None,
            document: None,
            video: None,
            voice: None,
            video_note: None,
        }
    }

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        assert_eq!(transient_retry_delay(1).as_millis(), 250);
        assert_eq!(transient_retry_delay(2).as_millis(), 500);
        assert_eq!(transient_retry_delay(3).as_millis(), 1000);
        assert_eq!(transient_retry_delay(20).as_millis(), 30000);
    }

    #[test]
    fn message_content_prefers_text_then_caption_then_non_text_placeholder() {
        let mut message = message("private");
        message.text = Some(" hello ".to_string());
        message.caption = Some("caption".to_string());
        assert_eq!(extract_message_content(&message).as_deref(), Some("hello"));

        message.text = None;
        assert_eq!(extract_message_content(&message).as_deref(), Some("caption"));

        message.caption = None;
        message.photo = vec![serde_json::json!({"file_id":"abc"})];
        assert_eq!(
            extract_message_content(&message).as_deref(),
            Some(TELEGRAM_NON_TEXT_PLACEHOLDER)
        );
    }

    #[test]
    fn inbound_uses_chat_scoped_conversation_and_sender_fallback() {
        let mut msg = message("group");
        msg.message_id = None;
        msg.text = Some("/skills".to_string());
        let inbound = build_message_inbound(100, Some(&msg)).expect("inbound");

        assert_eq!(inbound.channel, Channel::Telegram);
        assert_eq!(inbound.sender_id.as_str(), "chat:10");
        assert_eq!(inbound.message_id.as_str(), "update:100:message");
        assert_eq!(inbound.conversation_id.as_deref(), Some("tg-10"));
        assert_eq!(inbound.message_type, MessageType::Command);
        assert!(inbound.is_group);
        assert_eq!(inbound.reply_target(), "10");
    }

    #[test]
    fn voice_notes_are_flagged_for_transcription() {
        let mut msg = message("private");
        msg.from = Some(TelegramUser { id: 42 });
        msg.voice = Some(TelegramVoice {
            file_id: "voice-file".to_string(),
            duration: Some(3.0),
        });
        let inbound = build_message_inbound(1, Some(&msg)).expect("inbound");
        assert_eq!(inbound.message_type, MessageType::Voice);
        assert_eq!(inbound.content, TELEGRAM_NON_TEXT_PLACEHOLDER);
        assert_eq!(inbound.audio_duration, Some(3.0));
        assert_eq!(voice_file_id(Some(&msg)), Some("voice-file"));
        assert_eq!(voice_file_id(None), None);
    }

    #[test]
    fn messages_without_chat_or_content_are_skipped() {
        let mut msg = message("private");
        assert!(build_message_inbound(1, Some(&msg)).is_none());
        msg.chat = None;
        msg.text = Some("hi".to_string());
        assert!(build_message_inbound(1, Some(&msg)).is_none());
        assert!(build_message_inbound(1, None).is_none());
    }

    #[test]
    fn long_replies_split_on_newlines() {
        let text = format!("{}\n{}", "a".repeat(6), "b".repeat(6));
        assert_eq!(split_message(&text, 8), vec!["aaaaaa", "bbbbbb"]);
        assert_eq!(split_message("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
        assert_eq!(split_message("", 4), vec![""]);
    }
}
