use crate::types::{Channel, InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One messaging platform. Adapters only move messages; the gateway decides
/// what to say.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// Runs until the platform connection ends, pushing each inbound message
    /// into `tx`. Webhook-fed adapters have nothing to poll and return at once.
    async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;

    /// Best-effort "typing..." indicator while a reply is being generated.
    async fn typing(&self, _recipient_id: &str) -> Result<()> {
        Ok(())
    }

    /// Plain text with no reply threading, for alerts and one-shot sends.
    async fn notify(&self, recipient_id: &str, text: &str) -> Result<()> {
        self.send(recipient_id, OutboundMessage::text(text)).await
    }
}
