use crate::error::Result;
use crate::types::{CallOptions, ChatMessage, Completion, ProviderKind};
use async_trait::async_trait;

/// One inference tier as seen by the router.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn default_model(&self) -> &str;

    /// Whether the backend is configured well enough to attempt a call.
    fn is_available(&self) -> bool;

    /// Network probe. Defaults to `is_available`.
    async fn is_healthy(&self) -> bool {
        self.is_available()
    }

    async fn chat(&self, messages: &[ChatMessage], opts: CallOptions<'_>) -> Result<Completion>;
}
