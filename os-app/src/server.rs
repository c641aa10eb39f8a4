//! OpenClaw server.
//!
//! Wires the store, inference router, overseer, skills and channel adapters
//! into a [`Gateway`] and mounts the HTTP API on top.

use crate::access::SharedSecurity;
use crate::config::OpenClawConfig;
use crate::gateway::Gateway;
use crate::http_auth;
use crate::overseer::OverseerAgent;
use crate::overseer::keyvault::KeyVault;
use crate::overseer::scheduler::OverseerScheduler;
use crate::routes;
use crate::skills::{
    ConversationSkill, DailyBriefingSkill, MemorySkill, NotionDatabases, OverseerSkill,
    SecurityMonitorSkill, SkillRegistry, SmartHomeSkill, SshHardeningSkill, SystemAdminSkill,
    WebSearchSkill,
};
use crate::store::MemoryStore;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use os_channels::{
    Channel, ChannelAdapter, InboundMessage, TelegramAdapter, VoiceGatewayClient,
    WhatsAppBridgeAdapter,
};
use os_llm::{AgentBindings, CostTracker, InferenceRouter, OllamaClient, OpenRouterClient};
use os_tools::{CommandPolicy, CommandRunner, HostCommandRunner};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Shared state handed to every route through `Extension`.
pub struct AppState {
    /// `None` until the pipeline is wired; message routes answer 503.
    pub gateway: Option<Arc<Gateway>>,
    pub overseer: Arc<OverseerAgent>,
    pub router: Arc<InferenceRouter>,
    pub store: Arc<MemoryStore>,
    pub adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    pub inbound_tx: mpsc::Sender<InboundMessage>,
    pub voice: Option<VoiceGatewayClient>,
    /// Synthesizer voice for spoken replies on `/ws/voice`.
    pub tts_voice: String,
    pub started_at: Instant,
}

/// Everything the pipeline needs, minus network listeners.
pub(crate) struct Runtime {
    pub store: Arc<MemoryStore>,
    pub router: Arc<InferenceRouter>,
    pub overseer: Arc<OverseerAgent>,
    pub gateway: Arc<Gateway>,
    pub security: SharedSecurity,
}

pub(crate) fn build_runtime(cfg: &OpenClawConfig) -> Result<Runtime> {
    let db_path = cfg.db_path();
    let store = Arc::new(MemoryStore::open(&db_path)?);
    tracing::info!(db_path = %db_path.display(), "memory store opened");

    let router = Arc::new(build_router(cfg, store.clone()));

    let security: SharedSecurity = Arc::new(RwLock::new(cfg.security.clone()));
    let governance = Arc::new(RwLock::new(cfg.governance.clone()));
    let command_policy = Arc::new(RwLock::new(CommandPolicy::new(
        cfg.governance.blocked_commands.iter().cloned(),
    )));
    let runner: Arc<dyn CommandRunner> = Arc::new(HostCommandRunner::new(command_policy.clone()));

    let vault = KeyVault::from_env(store.clone(), |key| std::env::var(key).ok());
    tracing::info!(keys = vault.len(), "key vault initialized");
    let overseer = Arc::new(OverseerAgent::new(
        store.clone(),
        router.clone(),
        runner.clone(),
        security.clone(),
        governance,
        command_policy,
        vault,
    ));

    let registry = build_registry(cfg, &store, &router, &runner, &overseer)?;
    tracing::info!(skills = ?registry.names(), "skill registry built");

    let gateway = Arc::new(Gateway::new(
        store.clone(),
        router.clone(),
        registry,
        security.clone(),
        &cfg.general.assistant_name,
    ));

    Ok(Runtime {
        store,
        router,
        overseer,
        gateway,
        security,
    })
}

fn build_router(cfg: &OpenClawConfig, store: Arc<MemoryStore>) -> InferenceRouter {
    let inference = &cfg.inference;
    let local = OllamaClient::new(&inference.ollama_base_url, &inference.ollama_model);
    let mut cloud = OpenRouterClient::new(cfg.openrouter_api_key(), &inference.openrouter_model)
        .with_max_tokens(inference.openrouter_max_tokens)
        .with_pricing(inference.pricing.clone());
    if let Some(base_url) = inference.openrouter_base_url.as_deref() {
        cloud = cloud.with_base_url(base_url);
    }
    let costs = CostTracker::new(store, inference.monthly_budget_usd);
    let agents = Arc::new(AgentBindings::load(&inference.agents_config_path));
    tracing::info!(
        ollama_model = %inference.ollama_model,
        openrouter_model = %inference.openrouter_model,
        openrouter_configured = !cfg.openrouter_api_key().is_empty(),
        monthly_budget_usd = inference.monthly_budget_usd,
        agent_bindings = agents.binding_count(),
        "inference router configured"
    );
    InferenceRouter::new(Arc::new(local), Arc::new(cloud), costs, agents)
        .with_complexity_threshold(inference.complexity_threshold)
}

fn build_registry(
    cfg: &OpenClawConfig,
    store: &Arc<MemoryStore>,
    router: &Arc<InferenceRouter>,
    runner: &Arc<dyn CommandRunner>,
    overseer: &Arc<OverseerAgent>,
) -> Result<SkillRegistry> {
    let name = cfg.general.assistant_name.as_str();
    let integrations = &cfg.integrations;
    let mut registry = SkillRegistry::new();
    registry.register(Arc::new(ConversationSkill::new(router.clone(), name)));
    registry.register(Arc::new(MemorySkill::new(store.clone())));
    registry.register(Arc::new(SystemAdminSkill::new(runner.clone())));
    registry.register(Arc::new(SecurityMonitorSkill::new(runner.clone())));
    registry.register(Arc::new(DailyBriefingSkill::new(
        router.clone(),
        integrations.notion_token.as_deref(),
        NotionDatabases {
            calendar: integrations.notion_calendar_db.clone(),
            tasks: integrations.notion_tasks_db.clone(),
            projects: integrations.notion_projects_db.clone(),
        },
        name,
    )?));
    registry.register(Arc::new(WebSearchSkill::new(
        router.clone(),
        integrations.search_api_key.as_deref(),
        integrations.search_engine_id.as_deref(),
        name,
    )?));
    registry.register(Arc::new(SmartHomeSkill::new(
        integrations.home_assistant_url.as_deref(),
        integrations.home_assistant_token.as_deref(),
    )?));
    registry.register(Arc::new(OverseerSkill::new(overseer.clone())));
    registry.register(Arc::new(SshHardeningSkill::new(
        runner.clone(),
        overseer.clone(),
    )));
    Ok(registry)
}

fn voice_client(cfg: &OpenClawConfig) -> Result<Option<VoiceGatewayClient>> {
    let voice = &cfg.channels.voice;
    if !voice.enabled || voice.gateway_url.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(VoiceGatewayClient::new(&voice.gateway_url)?))
}

fn build_adapters(
    cfg: &OpenClawConfig,
    voice: Option<&VoiceGatewayClient>,
) -> Result<HashMap<Channel, Arc<dyn ChannelAdapter>>> {
    let mut adapters: HashMap<Channel, Arc<dyn ChannelAdapter>> = HashMap::new();
    if cfg.channels.telegram.enabled {
        let mut telegram = TelegramAdapter::new(&cfg.channels.telegram.bot_token)?;
        if let Some(voice) = voice {
            telegram = telegram.with_voice_gateway(voice.clone());
        }
        adapters.insert(Channel::Telegram, Arc::new(telegram));
    }
    if cfg.channels.whatsapp.enabled {
        adapters.insert(
            Channel::Whatsapp,
            Arc::new(WhatsAppBridgeAdapter::new(&cfg.channels.whatsapp.bridge_url)?),
        );
    }
    Ok(adapters)
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = OpenClawConfig::load(config_path).await?;
    let runtime = build_runtime(&cfg)?;
    let health = runtime.router.health().await;
    let voice_healthy = match voice_client(&cfg)? {
        Some(voice) => Some(voice.is_healthy().await),
        None => None,
    };
    tracing::info!(
        assistant_name = %cfg.general.assistant_name,
        db_path = %cfg.db_path().display(),
        ollama_healthy = health.ollama_healthy,
        openrouter_available = health.openrouter_available,
        budget = ?health.budget,
        voice_healthy = ?voice_healthy,
        telegram_enabled = cfg.channels.telegram.enabled,
        whatsapp_enabled = cfg.channels.whatsapp.enabled,
        skills = runtime.gateway.registry().len(),
        "config ok"
    );
    if !health.ollama_healthy {
        tracing::warn!(
            ollama_base_url = %cfg.inference.ollama_base_url,
            "local inference tier is unreachable"
        );
    }
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = OpenClawConfig::load(config_path).await?;
    let runtime = build_runtime(&cfg)?;
    let health = runtime.router.health().await;
    let check_in = runtime.overseer.check_in();
    tracing::info!(
        ollama_healthy = health.ollama_healthy,
        openrouter_available = health.openrouter_available,
        budget = ?health.budget,
        agent_state = check_in.agent_state.as_str(),
        pending_approvals = check_in.pending_approvals,
        "status ok"
    );
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    channel: &str,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let cfg = OpenClawConfig::load(config_path).await?;
    let channel: Channel = channel.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let adapter: Arc<dyn ChannelAdapter> = match channel {
        Channel::Telegram => Arc::new(TelegramAdapter::new(&cfg.channels.telegram.bot_token)?),
        Channel::Whatsapp => Arc::new(WhatsAppBridgeAdapter::new(
            &cfg.channels.whatsapp.bridge_url,
        )?),
        other => return Err(anyhow::anyhow!("channel {other} cannot send one-shot messages")),
    };
    adapter.notify(recipient, message).await?;
    tracing::info!(channel = %channel, recipient, "one-shot message sent");
    Ok(())
}

/// Runs one message through the full pipeline and prints the reply.
pub async fn ask(config_path: Option<PathBuf>, sender: &str, message: &str) -> Result<()> {
    let cfg = OpenClawConfig::load(config_path).await?;
    let runtime = build_runtime(&cfg)?;
    let response = runtime
        .gateway
        .handle_message(InboundMessage::text(Channel::Api, sender, message))
        .await;
    println!("{}", response.text);
    if let Some(error) = response.error {
        return Err(anyhow::anyhow!("pipeline error: {error}"));
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = OpenClawConfig::load(config_path).await?;
    let started_at = Instant::now();
    let addr: SocketAddr = cfg
        .server
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server.bind {:?}: {e}", cfg.server.bind))?;
    tracing::info!(
        bind_addr = %addr,
        assistant_name = %cfg.general.assistant_name,
        data_dir = %cfg.general.data_dir.display(),
        max_concurrent_requests = cfg.server.max_concurrent_requests,
        request_timeout_secs = cfg.server.request_timeout_secs,
        control_api_auth_configured = cfg.server.control_api_key.is_some(),
        telegram_enabled = cfg.channels.telegram.enabled,
        whatsapp_enabled = cfg.channels.whatsapp.enabled,
        voice_enabled = cfg.channels.voice.enabled,
        overseer_enabled = cfg.overseer.enabled,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let runtime = build_runtime(&cfg)?;
    let voice = voice_client(&cfg)?;
    let adapters = build_adapters(&cfg, voice.as_ref())?;

    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    for (channel, adapter) in &adapters {
        let adapter = adapter.clone();
        let tx = inbound_tx.clone();
        let channel = *channel;
        tokio::spawn(async move {
            if let Err(e) = adapter.start(tx).await {
                tracing::error!(channel = %channel, error = %e, "channel adapter stopped");
            }
        });
    }

    let shutdown = CancellationToken::new();
    let gateway_handle = runtime.gateway.clone().spawn_inbound_loop(
        inbound_rx,
        adapters.clone(),
        shutdown.child_token(),
    );
    tracing::info!(
        channel_count = adapters.len(),
        channels = ?adapters.keys().collect::<Vec<_>>(),
        "gateway started"
    );

    let mut scheduler = OverseerScheduler::new(
        runtime.overseer.clone(),
        runtime.store.clone(),
        runtime.security.clone(),
        cfg.overseer.clone(),
    );
    if let Some(channel) = cfg.overseer.notify_channel {
        match adapters.get(&channel) {
            Some(adapter) => scheduler = scheduler.with_notifier(adapter.clone()),
            None => tracing::warn!(
                channel = %channel,
                "overseer notify channel is not enabled; alerts are stored only"
            ),
        }
    }
    let scheduler_handles = Arc::new(scheduler).spawn(&shutdown)?;

    let state = Arc::new(AppState {
        gateway: Some(runtime.gateway.clone()),
        overseer: runtime.overseer.clone(),
        router: runtime.router.clone(),
        store: runtime.store.clone(),
        adapters,
        inbound_tx,
        voice,
        tts_voice: cfg.channels.voice.voice.clone(),
        started_at,
    });
    let auth = http_auth::ControlAuth::new(cfg.server.control_api_key.clone());
    if !auth.is_configured() {
        tracing::warn!(
            "server.control_api_key is not set; control endpoints are unauthenticated and \
             message API callers act as an anonymous tier 1 sender"
        );
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(axum::middleware::from_fn(http_auth::require_control_auth))
        .layer(Extension(auth))
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(
            cfg.server.max_concurrent_requests,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.request_timeout_secs),
        ))
        .layer(CorsLayer::permissive())
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "openclaw serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    for handle in scheduler_handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "overseer task join failed during shutdown");
        }
    }
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }

    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::{GovernanceConfig, SecurityConfig};
    use crate::testing::{FakeRunner, local_router};

    /// State backed by in-memory fakes; the gateway runs the conversation,
    /// memory and overseer skills.
    pub fn state(security: SecurityConfig) -> (Arc<AppState>, mpsc::Receiver<InboundMessage>) {
        state_with_adapters(security, HashMap::new())
    }

    pub fn state_with_adapters(
        security: SecurityConfig,
        adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    ) -> (Arc<AppState>, mpsc::Receiver<InboundMessage>) {
        let (state, rx) = build(security, adapters);
        (Arc::new(state), rx)
    }

    pub fn state_without_gateway() -> (Arc<AppState>, mpsc::Receiver<InboundMessage>) {
        let (mut state, rx) = build(SecurityConfig::default(), HashMap::new());
        state.gateway = None;
        (Arc::new(state), rx)
    }

    fn build(
        security: SecurityConfig,
        adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    ) -> (AppState, mpsc::Receiver<InboundMessage>) {
        let store = Arc::new(MemoryStore::open_in_memory().expect("store"));
        let router = Arc::new(local_router("hello from the local tier"));
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
        registry.register(Arc::new(OverseerSkill::new(overseer.clone())));
        let gateway = Arc::new(Gateway::new(
            store.clone(),
            router.clone(),
            registry,
            security,
            "Jarvis",
        ));
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let state = AppState {
            gateway: Some(gateway),
            overseer,
            router,
            store,
            adapters,
            inbound_tx,
            voice: None,
            tts_voice: "default".to_string(),
            started_at: Instant::now(),
        };
        (state, inbound_rx)
    }
}
