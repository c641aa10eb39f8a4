use crate::backend::ChatBackend;
use crate::error::{LlmError, Result};
use crate::types::{CallOptions, ChatMessage, Completion, ProviderKind, Usage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CHAT_TIMEOUT: Duration = Duration::from_secs(120);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_NUM_PREDICT: u32 = 1024;

/// Local tier: an Ollama server's `/api/chat`.
#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(base_url: &str, model: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(CHAT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ChatBackend for OllamaClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn is_available(&self) -> bool {
        true
    }

    #[tracing::instrument(level = "debug", skip_all, fields(base_url = %self.base_url))]
    async fn is_healthy(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.http.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(%e, "ollama health probe failed");
                false
            }
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(model))]
    async fn chat(&self, messages: &[ChatMessage], opts: CallOptions<'_>) -> Result<Completion> {
        let model = opts.model.unwrap_or(&self.model);
        tracing::Span::current().record("model", model);
        let req = OllamaChatRequest::new(model, messages, &opts);

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "ollama chat status={status} body={body}"
            )));
        }

        let parsed: OllamaChatResponse = serde_json::from_str(&body)?;
        Ok(parsed.into_completion(model))
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

impl<'a> OllamaChatRequest<'a> {
    fn new(model: &'a str, messages: &'a [ChatMessage], opts: &CallOptions<'a>) -> Self {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = opts.system.filter(|s| !s.trim().is_empty()) {
            out.push(OllamaMessage {
                role: "system",
                content: system,
            });
        }
        out.extend(messages.iter().map(|m| OllamaMessage {
            role: m.role.as_str(),
            content: m.content.as_str(),
        }));
        Self {
            model,
            messages: out,
            stream: false,
            options: OllamaOptions {
                temperature: opts.temperature,
                num_predict: opts.max_tokens.unwrap_or(DEFAULT_NUM_PREDICT),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

impl OllamaChatResponse {
    fn into_completion(self, model: &str) -> Completion {
        Completion {
            text: self.message.map(|m| m.content).unwrap_or_default(),
            provider: ProviderKind::Ollama,
            model: model.to_string(),
            usage: Usage {
                prompt_tokens: self.prompt_eval_count,
                completion_tokens: self.eval_count,
            },
            cost_usd: 0.0,
        }
    }
}
