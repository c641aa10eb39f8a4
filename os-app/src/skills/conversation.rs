use super::{Skill, SkillContext, SkillResponse};
use anyhow::Result;
use async_trait::async_trait;
use os_llm::{ChatMessage, ChatRequest, InferenceRouter};
use std::sync::Arc;

/// General chat through the router, seeded with remembered facts.
pub struct ConversationSkill {
    router: Arc<InferenceRouter>,
    assistant_name: String,
}

impl ConversationSkill {
    pub fn new(router: Arc<InferenceRouter>, assistant_name: &str) -> Self {
        Self {
            router,
            assistant_name: assistant_name.to_string(),
        }
    }

    fn system_prompt(&self, memories: &[String]) -> String {
        let mut prompt = format!(
            "You are {}, a highly capable AI personal assistant. You are helpful, \
             concise, and proactive. You speak naturally and adapt your tone to the context: \
             professional when needed, casual when appropriate.\n\n\
             Key traits:\n\
             - Direct and efficient in responses\n\
             - Proactively suggest actions when relevant\n\
             - Remember context from the conversation\n\
             - Admit when you don't know something\n\
             - Keep responses concise unless detail is requested\n",
            self.assistant_name
        );
        if !memories.is_empty() {
            prompt.push_str("\nRelevant things you remember about this user:\n");
            for memory in memories {
                prompt.push_str("- ");
                prompt.push_str(memory);
                prompt.push('\n');
            }
        }
        prompt
    }
}

#[async_trait]
impl Skill for ConversationSkill {
    fn name(&self) -> &'static str {
        "conversation"
    }

    fn description(&self) -> &'static str {
        "General conversation and questions"
    }

    fn min_tier(&self) -> u8 {
        0
    }

    fn examples(&self) -> &'static [&'static str] {
        &["Hello", "What do you think about...", "Help me brainstorm..."]
    }

    /// Baseline so chat always has a home; stays below the registry threshold.
    fn can_handle(&self, _text: &str) -> f64 {
        0.1
    }

    #[tracing::instrument(level = "info", skip_all, fields(history = ctx.history.len(), memories = ctx.memories.len()))]
    async fn execute(&self, ctx: &SkillContext) -> Result<SkillResponse> {
        let mut messages = ctx.history.clone();
        messages.push(ChatMessage::user(ctx.text()));
        let req = ChatRequest::new(messages)
            .with_system(self.system_prompt(&ctx.memories))
            .with_sender(ctx.sender());

        match self.router.chat(&req).await {
            Ok(completion) => Ok(SkillResponse::reply(completion.text).with_metadata(
                serde_json::json!({
                    "provider": completion.provider.as_str(),
                    "model": completion.model,
                }),
            )),
            Err(error) => {
                tracing::warn!(%error, "conversation inference failed");
                Ok(SkillResponse::error(format!(
                    "Sorry, I'm having trouble thinking right now: {error}"
                )))
            }
        }
    }
}
