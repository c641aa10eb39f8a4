use crate::traits::ChannelAdapter;
use crate::types::{Channel, InboundMessage, OutboundMessage};
use anyhow::{Result, anyhow};
use reqwest::Url;
use serde::Deserialize;

/// Outbound side of the WhatsApp bridge sidecar. Inbound messages arrive on
/// the gateway's webhook route instead of through `start`.
#[derive(Clone)]
pub struct WhatsAppBridgeAdapter {
    http: reqwest::Client,
    bridge_url: String,
}

impl WhatsAppBridgeAdapter {
    pub fn new(bridge_url: &str) -> Result<Self> {
        let bridge_url = bridge_url.trim().trim_end_matches('/');
        if bridge_url.is_empty() {
            return Err(anyhow!("whatsapp bridge url is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bridge_url: bridge_url.to_string(),
        })
    }

    fn send_url(&self) -> Result<Url> {
        Url::parse(&format!("{}/send", self.bridge_url))
            .map_err(|e| anyhow!("invalid whatsapp bridge URL: {e}"))
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WhatsAppBridgeAdapter {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let to = recipient_id.trim();
        if to.is_empty() {
            return Err(anyhow!("recipient_id (phone number) is required"));
        }
        let text = message.content.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let payload = serde_json::json!({ "to": to, "message": text });
        let response = self
            .http
            .post(self.send_url()?)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "whatsapp bridge send failed: status={status} body={body}"
            ));
        }
        Ok(())
    }
}

/// Payload the bridge posts for each inbound WhatsApp message.
#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppInbound {
    pub from: String,
    #[serde(default, alias = "body", alias = "text")]
    pub message: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "isGroup")]
    pub is_group: bool,
    #[serde(default, alias = "pushName")]
    pub name: Option<String>,
}

impl WhatsAppInbound {
    /// `None` when there is nothing to answer.
    pub fn into_inbound(self) -> Option<InboundMessage> {
        let from = self.from.trim();
        let content = self.message.trim();
        if from.is_empty() || content.is_empty() {
            return None;
        }
        let mut inbound = InboundMessage::text(Channel::Whatsapp, from, content);
        if let Some(id) = self.id.filter(|id| !id.trim().is_empty()) {
            inbound.message_id = id.into();
        }
        inbound.is_group = self.is_group;
        inbound.conversation_id = Some(format!("wa-{from}"));
        if let Some(name) = self.name {
            inbound.metadata = serde_json::json!({ "name": name });
        }
        Some(inbound)
    }
}
