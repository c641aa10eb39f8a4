use crate::backend::ChatBackend;
use crate::error::{LlmError, Result};
use crate::types::{CallOptions, ChatMessage, Completion, ProviderKind, Usage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const APP_REFERER: &str = "https://github.com/openclaw";
const APP_TITLE: &str = "OpenClaw";

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn cost(&self, usage: Usage) -> f64 {
        (f64::from(usage.prompt_tokens) * self.input_per_million
            + f64::from(usage.completion_tokens) * self.output_per_million)
            / 1_000_000.0
    }
}

/// Cloud tier: OpenRouter's OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    pricing: HashMap<String, ModelPricing>,
}

impl OpenRouterClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            base_url: OPENROUTER_BASE_URL.to_string(),
            api_key: api_key.trim().to_string(),
            model: model.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            pricing: HashMap::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_pricing(mut self, pricing: HashMap<String, ModelPricing>) -> Self {
        self.pricing = pricing;
        self
    }

    /// Free-tier and unknown models are priced at zero.
    pub fn estimate_cost(&self, model: &str, usage: Usage) -> f64 {
        self.pricing
            .get(model)
            .map(|p| p.cost(usage))
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl ChatBackend for OpenRouterClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenRouter
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    #[tracing::instrument(level = "info", skip_all, fields(model))]
    async fn chat(&self, messages: &[ChatMessage], opts: CallOptions<'_>) -> Result<Completion> {
        if !self.is_available() {
            return Err(LlmError::Unavailable(
                "openrouter api key not configured".to_string(),
            ));
        }
        let model = opts.model.unwrap_or(&self.model);
        tracing::Span::current().record("model", model);
        let req = OpenRouterChatRequest::new(model, messages, &opts, self.max_tokens);

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", APP_REFERER)
            .header("X-Title", APP_TITLE)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "openrouter chat status={status} body={body}"
            )));
        }

        let parsed: OpenRouterChatResponse = serde_json::from_str(&body)?;
        let mut completion = parsed.into_completion(model)?;
        completion.cost_usd = self.estimate_cost(model, completion.usage);
        Ok(completion)
    }
}

#[derive(Debug, Serialize)]
struct OpenRouterChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenRouterMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct OpenRouterMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> OpenRouterChatRequest<'a> {
    fn new(
        model: &'a str,
        messages: &'a [ChatMessage],
        opts: &CallOptions<'a>,
        default_max_tokens: u32,
    ) -> Self {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = opts.system.filter(|s| !s.trim().is_empty()) {
            out.push(OpenRouterMessage {
                role: "system",
                content: system,
            });
        }
        out.extend(messages.iter().map(|m| OpenRouterMessage {
            role: m.role.as_str(),
            content: m.content.as_str(),
        }));
        Self {
            model,
            messages: out,
            temperature: opts.temperature,
            max_tokens: opts.max_tokens.unwrap_or(default_max_tokens),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenRouterChatResponse {
    #[serde(default)]
    choices: Vec<OpenRouterChoice>,
    #[serde(default)]
    usage: Option<OpenRouterUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterChoice {
    message: OpenRouterChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenRouterChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl OpenRouterChatResponse {
    fn into_completion(self, requested_model: &str) -> Result<Completion> {
        let choice = self.choices.into_iter().next().ok_or_else(|| {
            LlmError::ResponseFormat("openrouter response missing choices".to_string())
        })?;
        let usage = self
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            provider: ProviderKind::OpenRouter,
            model: self
                .model
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| requested_model.to_string()),
            usage,
            cost_usd: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_is_per_million_tokens() {
        let client = OpenRouterClient::new("key", "m").with_pricing(HashMap::from([(
            "anthropic/claude-3.5-sonnet".to_string(),
            ModelPricing {
                input_per_million: 3.0,
                output_per_million: 15.0,
            },
        )]));
        let usage = Usage {
            prompt_tokens: 1_000,
            completion_tokens: 2_000,
        };
        let cost = client.estimate_cost("anthropic/claude-3.5-sonnet", usage);
        assert!((cost - 0.033).abs() < 1e-9, "cost={cost}");
        assert_eq!(client.estimate_cost("google/gemma-3-27b-it:free", usage), 0.0);
    }

    #[test]
    fn blank_key_is_unavailable() {
        assert!(!OpenRouterClient::new("   ", "m").is_available());
        assert!(OpenRouterClient::new("sk-or-1", "m").is_available());
    }

    #[test]
    fn response_without_choices_is_a_format_error() {
        let parsed: OpenRouterChatResponse =
            serde_json::from_str(r#"{"choices":[]}"#).expect("parse");
        let err = parsed.into_completion("m").expect_err("no choices");
        assert!(matches!(err, LlmError::ResponseFormat(_)));
    }

    #[test]
    fn request_uses_default_max_tokens() {
        let messages = vec![ChatMessage::user("explain rust lifetimes")];
        let opts = CallOptions {
            system: None,
            temperature: 0.7,
            max_tokens: None,
            model: None,
        };
        let req = OpenRouterChatRequest::new("m", &messages, &opts, 4096);
        let value = serde_json::to_value(&req).expect("serialize");
        assert_eq!(value["max_tokens"], serde_json::json!(4096));
        assert_eq!(value["messages"].as_array().map(Vec::len), Some(1));
    }
}
