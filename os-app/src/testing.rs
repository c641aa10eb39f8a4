//! Scripted stand-ins for inference tiers and the host shell.

use async_trait::async_trait;
use os_llm::{
    AgentBindings, CallOptions, ChatBackend, ChatMessage, Completion, CostTracker,
    InMemoryCostLedger, InferenceRouter, LlmError, ProviderKind, Usage,
};
use os_tools::{CommandOutput, CommandRunner, ToolError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

pub struct FakeBackend {
    kind: ProviderKind,
    available: bool,
    fail: bool,
    reply: Option<String>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeBackend {
    fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            available: true,
            fail: false,
            reply: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn local() -> Self {
        Self::new(ProviderKind::Ollama)
    }

    pub fn cloud() -> Self {
        Self::new(ProviderKind::OpenRouter)
    }

    pub fn replying(mut self, text: &str) -> Self {
        self.reply = Some(text.to_string());
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn default_model(&self) -> &str {
        match self.kind {
            ProviderKind::Ollama => "local-model",
            ProviderKind::OpenRouter => "cloud-model",
        }
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        opts: CallOptions<'_>,
    ) -> os_llm::Result<Completion> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            system: opts.system.map(str::to_string),
            messages: messages.to_vec(),
            temperature: opts.temperature,
        });
        if self.fail {
            return Err(LlmError::Http("backend down".to_string()));
        }
        let text = match &self.reply {
            Some(reply) => reply.clone(),
            None => format!(
                "echo: {}",
                messages.last().map(|m| m.content.as_str()).unwrap_or("")
            ),
        };
        Ok(Completion {
            text,
            provider: self.kind,
            model: self.default_model().to_string(),
            usage: Usage {
                prompt_tokens: 3,
                completion_tokens: 2,
            },
            cost_usd: 0.0,
        })
    }
}

pub fn router_with(local: Arc<FakeBackend>, cloud: Arc<FakeBackend>) -> InferenceRouter {
    InferenceRouter::new(
        local,
        cloud,
        CostTracker::new(Arc::new(InMemoryCostLedger::new()), 50.0),
        Arc::new(AgentBindings::empty()),
    )
}

/// Local-only router that answers with `reply`.
pub fn local_router(reply: &str) -> InferenceRouter {
    router_with(
        Arc::new(FakeBackend::local().replying(reply)),
        Arc::new(FakeBackend::cloud().unavailable()),
    )
}

/// Replies keyed by the joined argv. Unscripted commands are reported as
/// missing programs.
#[derive(Default)]
pub struct FakeRunner {
    outputs: HashMap<String, CommandOutput>,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, command_line: &str, stdout: &str) -> Self {
        self.outputs.insert(
            command_line.to_string(),
            CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: 0,
            },
        );
        self
    }

    pub fn with_failure(mut self, command_line: &str, stderr: &str, exit_code: i32) -> Self {
        self.outputs.insert(
            command_line.to_string(),
            CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code,
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn ran(&self, command_line: &str) -> bool {
        self.calls().iter().any(|c| c == command_line)
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, argv: &[&str], _timeout: Duration) -> os_tools::Result<CommandOutput> {
        let line = argv.join(" ");
        self.calls.lock().expect("calls lock").push(line.clone());
        self.outputs
            .get(&line)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(argv.first().unwrap_or(&"").to_string()))
    }

    async fn exists(&self, program: &str) -> bool {
        self.outputs
            .keys()
            .any(|line| line.split_whitespace().next() == Some(program))
    }
}
