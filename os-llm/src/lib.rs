//! LLM inference for OpenClaw.
//!
//! Two tiers (a local Ollama model and OpenRouter in the cloud), a cost
//! ledger with a monthly budget gate, per-sender agent model bindings, and the
//! router that ties them together.

mod agents;
mod backend;
mod cost;
mod error;
mod ollama;
mod openrouter;
mod router;
mod types;

pub use agents::{AgentBindings, AgentModelConfig};
pub use backend::ChatBackend;
pub use cost::{BudgetStatus, CostEntry, CostLedger, CostTracker, InMemoryCostLedger};
pub use error::{LlmError, Result};
pub use ollama::OllamaClient;
pub use openrouter::{ModelPricing, OPENROUTER_BASE_URL, OpenRouterClient};
pub use router::{DEFAULT_COMPLEXITY_THRESHOLD, InferenceRouter, RouterHealth, score_complexity};
pub use types::{
    CallOptions, ChatMessage, ChatRequest, Completion, DEFAULT_TEMPERATURE, ProviderKind, Role,
    Usage,
};
