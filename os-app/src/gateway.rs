//! Message pipeline shared by every channel.
//!
//! Rate limit, DM gate, slash commands, conversation context, intent, tier
//! check, skill, persistence and audit, in that order. Channel adapters feed
//! one inbound queue; replies go back through the adapter the message came
//! from.

use crate::access::{self, RateLimiter, SharedSecurity};
use crate::commands::{self, CommandContext};
use crate::intent::{self, SkillMatch};
use crate::pairing::{GateDecision, PairingGate};
use crate::skills::{SkillContext, SkillRegistry, SkillResponse, truncate_chars};
use crate::store::{ConversationContext, MemoryStore, build_conversation_id};
use chrono::Utc;
use os_channels::{Channel, ChannelAdapter, InboundMessage, OutboundMessage};
use os_llm::{InferenceRouter, Role};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REGISTRY_CONFIDENCE: f64 = 0.7;
const LLM_CONFIDENCE: f64 = 0.5;
const FALLBACK_SKILL: &str = "conversation";
const AUDIT_DETAIL_CHARS: usize = 200;

pub struct Gateway {
    store: Arc<MemoryStore>,
    router: Arc<InferenceRouter>,
    registry: SkillRegistry,
    security: SharedSecurity,
    pairing: PairingGate,
    rate_limiter: RateLimiter,
    assistant_name: String,
}

impl Gateway {
    pub fn new(
        store: Arc<MemoryStore>,
        router: Arc<InferenceRouter>,
        registry: SkillRegistry,
        security: SharedSecurity,
        assistant_name: &str,
    ) -> Self {
        let (per_minute, per_hour) = {
            let security = security.read().unwrap_or_else(|p| p.into_inner());
            (security.rate_limit_per_minute, security.rate_limit_per_hour)
        };
        Self {
            store,
            router,
            registry,
            pairing: PairingGate::new(security.clone()),
            security,
            rate_limiter: RateLimiter::new(per_minute, per_hour),
            assistant_name: assistant_name.to_string(),
        }
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    pub fn router(&self) -> &Arc<InferenceRouter> {
        &self.router
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    fn sender_tier(&self, sender_id: &str) -> u8 {
        let security = self.security.read().unwrap_or_else(|p| p.into_inner());
        access::user_tier(&security, sender_id)
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(channel = message.channel.as_str(), sender_id = %message.sender_id.as_str())
    )]
    pub async fn handle_message(&self, message: InboundMessage) -> SkillResponse {
        let sender = message.sender_id.as_str().to_string();
        let channel = message.channel.as_str();
        let now = Utc::now();

        if !self.rate_limiter.check(&sender, Instant::now()) {
            return rejection("You're sending messages too fast. Please slow down.", "rate_limited");
        }

        match self.pairing.evaluate(message.channel, &sender, now) {
            GateDecision::Allowed => {}
            GateDecision::Denied => {
                tracing::info!("message dropped by dm policy");
                return rejection("", "dm_denied");
            }
            decision => {
                let text = decision.reply().unwrap_or_default();
                return rejection(&text, "pairing_required");
            }
        }

        let tier = self.sender_tier(&sender);
        let command_ctx = CommandContext {
            assistant_name: &self.assistant_name,
            registry: &self.registry,
            router: &self.router,
            pairing: &self.pairing,
        };
        if let Some(reply) = commands::handle_command(&command_ctx, tier, &message.content, now) {
            return SkillResponse::reply(reply).with_metadata(json!({"command": true}));
        }

        let conversation_id = message
            .conversation_id
            .clone()
            .unwrap_or_else(|| build_conversation_id(channel, &sender));
        if let Err(error) = self
            .store
            .get_or_create_conversation(&conversation_id, channel, &sender, now)
        {
            tracing::warn!(%error, "failed to record conversation");
        }
        let context = self
            .store
            .context_for(&conversation_id, &sender, &message.content)
            .unwrap_or_else(|error| {
                tracing::warn!(%error, "failed to load conversation context");
                ConversationContext::default()
            });

        let matched = self.classify(&message.content).await;
        tracing::info!(
            skill = %matched.skill_name,
            confidence = matched.confidence,
            "intent classified"
        );

        let Some(skill) = self
            .registry
            .get(&matched.skill_name)
            .or_else(|| self.registry.get(FALLBACK_SKILL))
        else {
            return rejection("No skill is available to handle that.", "no_skill");
        };
        if !access::authorize(&self.store, &sender, tier, skill.min_tier(), now) {
            return rejection(
                &format!("Sorry, you need tier {} access for this action.", skill.min_tier()),
                "insufficient_tier",
            );
        }

        let skill_name = skill.name();
        let ctx = SkillContext {
            message,
            matched,
            user_tier: tier,
            history: context.history,
            memories: context.memories,
        };
        let response = match skill.execute(&ctx).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%error, skill = skill_name, "skill failed");
                SkillResponse {
                    text: "Sorry, something went wrong processing your request.".to_string(),
                    error: Some(format!("{error:#}")),
                    ..SkillResponse::default()
                }
            }
        };

        self.persist(&conversation_id, &ctx, skill_name, &response);
        response
    }

    async fn classify(&self, text: &str) -> SkillMatch {
        let names = self.registry.names();
        let mut matched = intent::classify(text, &names);
        if matched.confidence < REGISTRY_CONFIDENCE {
            if let Some(candidate) = self.registry.find_best_match(text) {
                if candidate.confidence > matched.confidence {
                    matched = candidate;
                }
            }
        }
        if matched.confidence < LLM_CONFIDENCE {
            matched = intent::classify_with_llm(
                &self.router,
                text,
                &self.registry.descriptions(),
                &names,
            )
            .await;
        }
        matched
    }

    fn persist(&self, conversation_id: &str, ctx: &SkillContext, skill: &str, response: &SkillResponse) {
        let now = Utc::now();
        let channel = ctx.message.channel.as_str();
        let user_meta = json!({"message_type": ctx.message.message_type});
        let assistant_meta = json!({"skill": skill, "confidence": ctx.matched.confidence});
        let stored = self
            .store
            .add_message(conversation_id, Role::User, ctx.text(), Some(channel), &user_meta, now)
            .and_then(|_| {
                self.store.add_message(
                    conversation_id,
                    Role::Assistant,
                    &response.text,
                    Some(channel),
                    &assistant_meta,
                    now,
                )
            });
        if let Err(error) = stored {
            tracing::warn!(%error, "failed to persist messages");
        }

        let detail = truncate_chars(ctx.text(), AUDIT_DETAIL_CHARS);
        if let Err(error) = self.store.log_audit(
            ctx.sender(),
            &format!("skill:{skill}"),
            Some(detail),
            ctx.user_tier,
            now,
        ) {
            tracing::warn!(%error, "failed to audit skill use");
        }
    }

    /// Consumes adapter traffic until the queue closes or `shutdown` fires.
    pub fn spawn_inbound_loop(
        self: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("gateway inbound loop received shutdown signal");
                        break;
                    }
                    message = inbound_rx.recv() => message,
                };
                let Some(message) = message else {
                    tracing::info!("gateway inbound queue closed");
                    break;
                };
                if let Err(error) = self.deliver(message, &adapters).await {
                    tracing::warn!(%error, "failed to answer inbound message");
                }
            }
        })
    }

    async fn deliver(
        &self,
        message: InboundMessage,
        adapters: &HashMap<Channel, Arc<dyn ChannelAdapter>>,
    ) -> anyhow::Result<()> {
        let adapter = adapters
            .get(&message.channel)
            .ok_or_else(|| anyhow::anyhow!("no adapter for channel {}", message.channel.as_str()))?
            .clone();
        let target = message.reply_target().to_string();
        let reply_to = message.message_id.clone();

        if let Err(error) = adapter.typing(&target).await {
            tracing::debug!(%error, "typing indicator not sent");
        }
        let response = self.handle_message(message).await;
        if response.text.trim().is_empty() {
            return Ok(());
        }
        adapter
            .send(
                &target,
                OutboundMessage {
                    content: response.text,
                    reply_to_message_id: Some(reply_to),
                    audio_url: None,
                },
            )
            .await
    }
}

fn rejection(text: &str, error: &str) -> SkillResponse {
    SkillResponse {
        text: text.to_string(),
        error: Some(error.to_string()),
        ..SkillResponse::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DmPolicy, GovernanceConfig, SecurityConfig};
    use crate::overseer::OverseerAgent;
    use crate::overseer::keyvault::KeyVault;
    use crate::skills::{ConversationSkill, MemorySkill, OverseerSkill};
    use crate::testing::{FakeRunner, local_router};
    use os_tools::CommandPolicy;
    use std::sync::RwLock;

    fn gateway_with(security: SecurityConfig) -> Gateway {
        let store = Arc::new(MemoryStore::open_in_memory().expect("store"));
        let router = Arc::new(local_router("Happy to help."));
        let security: SharedSecurity = Arc::new(RwLock::new(security));
        let overseer = Arc::new(OverseerAgent::new(
            store.clone(),
            router.clone(),
            Arc::new(FakeRunner::new()),
            security.clone(),
            Arc::new(RwLock::new(GovernanceConfig::default())),
            Arc::new(RwLock::new(CommandPolicy::default())),
            KeyVault::empty(store.clone()),
        ));
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(ConversationSkill::new(router.clone(), "Jarvis")));
        registry.register(Arc::new(MemorySkill::new(store.clone())));
        registry.register(Arc::new(OverseerSkill::new(overseer)));
        Gateway::new(store, router, registry, security, "Jarvis")
    }

    fn gateway() -> Gateway {
        gateway_with(SecurityConfig {
            admin_user_ids: vec!["admin".to_string()],
            ..SecurityConfig::default()
        })
    }

    #[tokio::test]
    async fn conversation_turns_are_persisted_and_audited() {
        let gw = gateway();
        let response = gw
            .handle_message(InboundMessage::text(Channel::Api, "u1", "tell me a story"))
            .await;
        assert_eq!(response.text, "Happy to help.");
        assert!(response.ok());

        let conversation_id = build_conversation_id("api", "u1");
        let history = gw
            .store()
            .conversation_history(&conversation_id, 10)
            .expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "tell me a story");

        let audits = gw
            .store()
            .recent_audit(1, Some("skill:conversation"), Utc::now())
            .expect("audit");
        assert_eq!(audits.len(), 1);
    }

    #[tokio::test]
    async fn low_tier_senders_are_refused_and_audited() {
        let gw = gateway();
        let response = gw
            .handle_message(InboundMessage::text(Channel::Api, "u1", "overseer status"))
            .await;
        assert_eq!(response.text, "Sorry, you need tier 3 access for this action.");
        assert_eq!(response.error.as_deref(), Some("insufficient_tier"));
        let denied = gw
            .store()
            .recent_audit(1, Some("access_denied"), Utc::now())
            .expect("audit");
        assert_eq!(denied.len(), 1);

        let admin = gw
            .handle_message(InboundMessage::text(Channel::Api, "admin", "overseer status"))
            .await;
        assert!(admin.text.contains("**Overseer Check-In**"));
    }

    #[tokio::test]
    async fn telegram_strangers_hit_the_dm_gate() {
        let gw = gateway_with(SecurityConfig {
            dm_policy: DmPolicy::Pairing,
            ..SecurityConfig::default()
        });
        let response = gw
            .handle_message(InboundMessage::text(Channel::Telegram, "stranger", "hi"))
            .await;
        assert_eq!(response.error.as_deref(), Some("pairing_required"));
        assert!(response.text.contains("pairing code"));

        let api = gw
            .handle_message(InboundMessage::text(Channel::Api, "stranger", "hi"))
            .await;
        assert!(api.ok());
    }

    #[tokio::test]
    async fn rate_limit_applies_before_everything_else() {
        let gw = gateway_with(SecurityConfig {
            rate_limit_per_minute: 1,
            ..SecurityConfig::default()
        });
        assert!(gw.handle_message(InboundMessage::text(Channel::Api, "u1", "/start")).await.ok());
        let limited = gw
            .handle_message(InboundMessage::text(Channel::Api, "u1", "/start"))
            .await;
        assert_eq!(limited.error.as_deref(), Some("rate_limited"));
    }

    #[tokio::test]
    async fn slash_commands_skip_the_pipeline() {
        let gw = gateway();
        let response = gw
            .handle_message(InboundMessage::text(Channel::Api, "u1", "/skills"))
            .await;
        assert!(response.text.contains("`overseer` tier 3 (locked)"));
        assert!(!gw.store().has_conversation(&build_conversation_id("api", "u1")).expect("lookup"));
    }
}
