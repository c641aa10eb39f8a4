//! Channel adapters for OpenClaw.
//!
//! Adapters are pure I/O: they convert platform messages to/from
//! `InboundMessage` / `OutboundMessage`. Routing, access control and replies
//! live in the gateway.

mod telegram;
mod traits;
mod types;
pub mod voice;
mod whatsapp;

pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    Channel, InboundMessage, MessageId, MessageType, OutboundMessage, SenderId, ThreadId,
};
pub use voice::{AudioSegment, AudioSegmenter, SegmenterConfig, Transcription, VoiceGatewayClient};
pub use whatsapp::{WhatsAppBridgeAdapter, WhatsAppInbound};
