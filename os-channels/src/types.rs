use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(SenderId);
id_newtype!(ThreadId);

/// Where a message entered the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Telegram,
    Whatsapp,
    Api,
    Voice,
    /// Internal producer for scheduled overseer notifications.
    Scheduler,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Whatsapp => "whatsapp",
            Self::Api => "api",
            Self::Voice => "voice",
            Self::Scheduler => "scheduler",
        }
    }

    /// Unknown names fall back to the HTTP API channel.
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or(Self::Api)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telegram" => Ok(Self::Telegram),
            "whatsapp" => Ok(Self::Whatsapp),
            "api" => Ok(Self::Api),
            "voice" => Ok(Self::Voice),
            "scheduler" => Ok(Self::Scheduler),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Voice,
    Image,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub channel: Channel,
    pub sender_id: SenderId,
    /// Reply target when it differs from the sender (Telegram chat id).
    pub thread_id: Option<ThreadId>,
    pub is_group: bool,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    /// Explicit conversation key; derived from channel and sender when absent.
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub audio_duration: Option<f64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn text(channel: Channel, sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            message_id: MessageId::new(ulid::Ulid::new().to_string()),
            channel,
            sender_id: SenderId::new(sender_id),
            thread_id: None,
            is_group: false,
            content: content.into(),
            message_type: MessageType::Text,
            conversation_id: None,
            reply_to: None,
            audio_url: None,
            audio_duration: None,
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    /// Where replies go: the thread when present, otherwise the sender.
    pub fn reply_target(&self) -> &str {
        self.thread_id
            .as_deref()
            .unwrap_or_else(|| self.sender_id.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
    #[serde(default)]
    pub audio_url: Option<String>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_channels_fall_back_to_api() {
        assert_eq!(Channel::parse_lenient("Telegram"), Channel::Telegram);
        assert_eq!(Channel::parse_lenient("carrier-pigeon"), Channel::Api);
    }

    #[test]
    fn reply_target_prefers_thread() {
        let mut msg = InboundMessage::text(Channel::Telegram, "user-1", "hi");
        assert_eq!(msg.reply_target(), "user-1");
        msg.thread_id = Some(ThreadId::new("chat-9"));
        assert_eq!(msg.reply_target(), "chat-9");
    }

    #[test]
    fn inbound_defaults_deserialize() {
        let msg: InboundMessage = serde_json::from_value(serde_json::json!({
            "message_id": "m1",
            "channel": "whatsapp",
            "sender_id": "+15550001",
            "thread_id": null,
            "is_group": false,
            "content": "hello",
            "received_at": "2026-02-10T09:00:00Z"
        }))
        .expect("deserialize");
        assert_eq!(msg.message_type, MessageType::Text);
        assert_eq!(msg.channel, Channel::Whatsapp);
        assert!(msg.conversation_id.is_none());
    }
}
