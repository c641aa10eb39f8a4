//! Dual-tier inference routing.
//!
//! Requests from a sender bound to an agent try that agent's models on the
//! cloud tier in order. Everything else, including an exhausted agent
//! cascade, goes through the generic selection: a complexity score picks a
//! tier, an ineligible cloud tier (no key or over the monthly budget) is
//! swapped for the local one, and a failing tier gets one retry on the other.

use crate::agents::AgentBindings;
use crate::backend::ChatBackend;
use crate::cost::{BudgetStatus, CostTracker};
use crate::error::{LlmError, Result};
use crate::types::{CallOptions, ChatRequest, Completion, ProviderKind};
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, LazyLock};

pub const DEFAULT_COMPLEXITY_THRESHOLD: f64 = 0.6;

static COMPLEX_PATTERNS: LazyLock<Vec<(Regex, f64)>> = LazyLock::new(|| {
    [
        (
            r"\b(analyze|explain|compare|summarize|write.*code|debug|refactor)\b",
            0.3,
        ),
        (r"\b(multi.?step|complex|detailed|comprehensive)\b", 0.2),
        (r"```", 0.3),
        (r"\b(why|how does|what if)\b", 0.15),
    ]
    .into_iter()
    .map(|(pattern, weight)| (Regex::new(pattern).expect("valid complexity regex"), weight))
    .collect()
});

static SIMPLE_PATTERNS: LazyLock<Vec<(Regex, f64)>> = LazyLock::new(|| {
    [
        (r"^(hi|hello|hey|thanks|ok|yes|no|sure)\b", -0.4),
        (r"^(what time|what day|what date)\b", -0.3),
        (r"\b(turn on|turn off|set|toggle)\b", -0.2),
    ]
    .into_iter()
    .map(|(pattern, weight)| (Regex::new(pattern).expect("valid complexity regex"), weight))
    .collect()
});

/// Heuristic in `[0, 1]`; higher means the cloud tier is worth it.
pub fn score_complexity(text: &str) -> f64 {
    let text = text.trim().to_lowercase();
    let mut score: f64 = 0.5;

    let words = text.split_whitespace().count();
    if words > 100 {
        score += 0.2;
    } else if words < 10 {
        score -= 0.15;
    }

    for (re, weight) in COMPLEX_PATTERNS.iter().chain(SIMPLE_PATTERNS.iter()) {
        if re.is_match(&text) {
            score += weight;
        }
    }

    score.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterHealth {
    pub ollama_healthy: bool,
    pub openrouter_available: bool,
    pub budget: Option<BudgetStatus>,
}

pub struct InferenceRouter {
    local: Arc<dyn ChatBackend>,
    cloud: Arc<dyn ChatBackend>,
    costs: CostTracker,
    agents: Arc<AgentBindings>,
    complexity_threshold: f64,
}

impl InferenceRouter {
    pub fn new(
        local: Arc<dyn ChatBackend>,
        cloud: Arc<dyn ChatBackend>,
        costs: CostTracker,
        agents: Arc<AgentBindings>,
    ) -> Self {
        Self {
            local,
            cloud,
            costs,
            agents,
            complexity_threshold: DEFAULT_COMPLEXITY_THRESHOLD,
        }
    }

    pub fn with_complexity_threshold(mut self, threshold: f64) -> Self {
        self.complexity_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn costs(&self) -> &CostTracker {
        &self.costs
    }

    pub fn agents(&self) -> &Arc<AgentBindings> {
        &self.agents
    }

    pub fn backend(&self, kind: ProviderKind) -> &Arc<dyn ChatBackend> {
        match kind {
            ProviderKind::Ollama => &self.local,
            ProviderKind::OpenRouter => &self.cloud,
        }
    }

    /// Configured and under the monthly budget.
    pub fn cloud_eligible(&self) -> bool {
        self.cloud.is_available() && self.costs.is_within_budget(Utc::now())
    }

    pub fn select_provider(&self, text: &str) -> ProviderKind {
        let score = score_complexity(text);
        let provider = if score >= self.complexity_threshold && self.cloud_eligible() {
            ProviderKind::OpenRouter
        } else {
            ProviderKind::Ollama
        };
        tracing::debug!(score, provider = %provider, "complexity routing");
        provider
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(sender_id = req.sender_id.as_deref().unwrap_or(""), forced = ?req.force_provider)
    )]
    pub async fn chat(&self, req: &ChatRequest) -> Result<Completion> {
        if req.force_provider.is_none() {
            if let Some(sender_id) = req.sender_id.as_deref() {
                if let Some(completion) = self.try_agent_cascade(sender_id, req).await {
                    return Ok(completion);
                }
            }
        }

        let mut provider = req
            .force_provider
            .unwrap_or_else(|| self.select_provider(req.last_user_message()));
        if provider == ProviderKind::OpenRouter && !self.cloud_eligible() {
            tracing::info!("cloud tier ineligible; using local tier");
            provider = ProviderKind::Ollama;
        }

        match self.call(provider, req, None).await {
            Ok(completion) => {
                self.costs.record_completion(&completion);
                Ok(completion)
            }
            Err(err) => {
                let fallback = provider.other();
                if fallback == ProviderKind::OpenRouter && !self.cloud_eligible() {
                    return Err(err);
                }
                tracing::warn!(%err, failed = %provider, fallback = %fallback, "provider failed; trying fallback");
                let completion = self.call(fallback, req, None).await?;
                self.costs.record_completion(&completion);
                Ok(completion)
            }
        }
    }

    /// Single-prompt convenience over [`InferenceRouter::chat`].
    pub async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        force_provider: Option<ProviderKind>,
        temperature: f32,
    ) -> Result<Completion> {
        let mut req = ChatRequest::prompt(prompt).with_temperature(temperature);
        req.system = system.map(str::to_string);
        req.force_provider = force_provider;
        self.chat(&req).await
    }

    pub async fn health(&self) -> RouterHealth {
        let budget = match self.costs.budget_status(Utc::now()) {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!(%e, "budget status unavailable");
                None
            }
        };
        RouterHealth {
            ollama_healthy: self.local.is_healthy().await,
            openrouter_available: self.cloud.is_available(),
            budget,
        }
    }

    /// `None` when the sender has no agent, the cloud tier is ineligible, or
    /// every candidate model failed.
    async fn try_agent_cascade(&self, sender_id: &str, req: &ChatRequest) -> Option<Completion> {
        let (agent, models) = self.agents.models_for(sender_id)?;
        if !self.cloud_eligible() {
            tracing::info!(%agent, "cloud tier ineligible; skipping agent models");
            return None;
        }

        for (attempt, model) in models.iter().enumerate() {
            match self
                .call(ProviderKind::OpenRouter, req, Some(model.as_str()))
                .await
            {
                Ok(completion) => {
                    tracing::info!(%agent, %model, attempt, "agent model succeeded");
                    self.costs.record_completion(&completion);
                    return Some(completion);
                }
                Err(err) => {
                    tracing::warn!(%agent, %model, attempt, %err, "agent model failed");
                }
            }
        }

        tracing::warn!(%agent, tried = models.len(), "all agent models failed; using generic routing");
        None
    }

    async fn call(
        &self,
        provider: ProviderKind,
        req: &ChatRequest,
        model: Option<&str>,
    ) -> Result<Completion> {
        let backend = self.backend(provider);
        if !backend.is_available() {
            return Err(LlmError::Unavailable(provider.to_string()));
        }
        let opts = CallOptions {
            system: req.system.as_deref(),
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            model,
        };
        backend.chat(&req.messages, opts).await
    }
}
