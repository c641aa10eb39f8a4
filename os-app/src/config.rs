//! OpenClaw configuration loader.
//!
//! Values come from `~/.openclaw/config.toml` (every field optional), then
//! from the process environment, which always wins.

use os_channels::Channel;
use os_llm::ModelPricing;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OpenClawConfig {
    pub general: GeneralConfig,
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub channels: ChannelsConfig,
    pub security: SecurityConfig,
    pub governance: GovernanceConfig,
    pub integrations: IntegrationsConfig,
    pub overseer: OverseerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/openclaw.db`.
    pub db_path: Option<PathBuf>,
    pub assistant_name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: default_data_dir(),
            db_path: None,
            assistant_name: "Jarvis".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Bearer token required by the approval routes when set.
    pub control_api_key: Option<String>,
    pub max_concurrent_requests: usize,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            control_api_key: None,
            max_concurrent_requests: 64,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub openrouter_max_tokens: u32,
    pub openrouter_base_url: Option<String>,
    pub complexity_threshold: f64,
    pub monthly_budget_usd: f64,
    pub agents_config_path: PathBuf,
    /// USD per million tokens, keyed by OpenRouter model id.
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            ollama_base_url: "http://localhost:11434".to_string(),
            ollama_model: "qwen2.5:3b".to_string(),
            openrouter_api_key: None,
            openrouter_model: "google/gemma-3-27b-it:free".to_string(),
            openrouter_max_tokens: 4096,
            openrouter_base_url: None,
            complexity_threshold: os_llm::DEFAULT_COMPLEXITY_THRESHOLD,
            monthly_budget_usd: 50.0,
            agents_config_path: default_config_root().join("agents.json"),
            pricing: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub telegram: TelegramConfig,
    pub whatsapp: WhatsAppConfig,
    pub voice: VoiceConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    pub enabled: bool,
    pub bridge_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub enabled: bool,
    pub gateway_url: String,
    /// Voice name passed to the synthesizer.
    pub voice: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gateway_url: String::new(),
            voice: "en_US-lessac-medium".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    Open,
    #[default]
    Allowlist,
    Pairing,
}

impl DmPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Allowlist => "allowlist",
            Self::Pairing => "pairing",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "allowlist" => Some(Self::Allowlist),
            "pairing" => Some(Self::Pairing),
            _ => None,
        }
    }
}

impl std::fmt::Display for DmPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub admin_user_ids: Vec<String>,
    pub rate_limit_per_minute: usize,
    pub rate_limit_per_hour: usize,
    pub dm_policy: DmPolicy,
    pub allow_from: Vec<String>,
    pub sandbox: String,
    pub workspace: String,
    pub workspace_access: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            admin_user_ids: Vec::new(),
            rate_limit_per_minute: 30,
            rate_limit_per_hour: 200,
            dm_policy: DmPolicy::Allowlist,
            allow_from: Vec::new(),
            sandbox: "all".to_string(),
            workspace: "./openclaw-workspace".to_string(),
            workspace_access: "rw".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub approval_required: Vec<String>,
    pub blocked_commands: Vec<String>,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            approval_required: ["shell-command", "file-delete", "git-push", "ssh-hardening"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            blocked_commands: os_tools::DEFAULT_BLOCKED_COMMANDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IntegrationsConfig {
    pub notion_token: Option<String>,
    pub notion_calendar_db: Option<String>,
    pub notion_tasks_db: Option<String>,
    pub notion_projects_db: Option<String>,
    pub home_assistant_url: Option<String>,
    pub home_assistant_token: Option<String>,
    pub search_api_key: Option<String>,
    pub search_engine_id: Option<String>,
}

/// Upper bound for the overseer audit and check-in periods (one year).
pub const MAX_INTERVAL_HOURS: u64 = 24 * 365;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverseerConfig {
    pub enabled: bool,
    pub audit_enabled: bool,
    pub cron_hour: u32,
    pub cron_minute: u32,
    /// Replaces the daily cron when set.
    pub interval_hours: Option<u64>,
    pub check_in_interval_hours: u64,
    /// Channel used to push alerts to admins. Alerts are only stored when unset.
    pub notify_channel: Option<Channel>,
}

impl Default for OverseerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            audit_enabled: true,
            cron_hour: 6,
            cron_minute: 0,
            interval_hours: None,
            check_in_interval_hours: 8,
            notify_channel: None,
        }
    }
}

impl OpenClawConfig {
    /// Loads the config file (a missing default file means all defaults),
    /// then applies environment overrides and validates.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let explicit = path
            .or_else(|| non_empty_env("OPENCLAW_CONFIG").map(PathBuf::from));
        let path = explicit.clone().unwrap_or_else(default_config_path);

        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::from_toml(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => {
                tracing::info!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn apply_env_overrides<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OPENCLAW_LOG_LEVEL") {
            self.general.log_level = v.to_ascii_lowercase();
        }
        if let Some(v) = get("DATA_DIR") {
            self.general.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("DB_PATH") {
            self.general.db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("OLLAMA_BASE_URL") {
            self.inference.ollama_base_url = v;
        }
        if let Some(v) = get("OLLAMA_MODEL") {
            self.inference.ollama_model = v;
        }
        if let Some(v) = get("OPENROUTER_API_KEY") {
            self.inference.openrouter_api_key = Some(v);
        }
        if let Some(v) = get("OPENROUTER_MODEL") {
            self.inference.openrouter_model = v;
        }
        if let Some(v) = get("OPENROUTER_MAX_TOKENS") {
            match v.trim().parse() {
                Ok(n) => self.inference.openrouter_max_tokens = n,
                Err(e) => tracing::warn!(%e, value = %v, "ignoring invalid OPENROUTER_MAX_TOKENS"),
            }
        }
        if let Some(v) = get("INFERENCE_COMPLEXITY_THRESHOLD") {
            match v.trim().parse() {
                Ok(n) => self.inference.complexity_threshold = n,
                Err(e) => tracing::warn!(%e, value = %v, "ignoring invalid INFERENCE_COMPLEXITY_THRESHOLD"),
            }
        }
        if let Some(v) = get("INFERENCE_MONTHLY_BUDGET_USD") {
            match v.trim().parse() {
                Ok(n) => self.inference.monthly_budget_usd = n,
                Err(e) => tracing::warn!(%e, value = %v, "ignoring invalid INFERENCE_MONTHLY_BUDGET_USD"),
            }
        }
        if let Some(v) = get("AGENTS_CONFIG_PATH") {
            self.inference.agents_config_path = PathBuf::from(v);
        }
        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.channels.telegram.bot_token = v;
            self.channels.telegram.enabled = true;
        }
        if let Some(v) = get("WHATSAPP_BRIDGE_URL") {
            self.channels.whatsapp.bridge_url = v;
            self.channels.whatsapp.enabled = true;
        }
        if let Some(v) = get("VOICE_GATEWAY_URL") {
            self.channels.voice.gateway_url = v;
            self.channels.voice.enabled = true;
        }
        let integrations = &mut self.integrations;
        for (key, slot) in [
            ("NOTION_TOKEN", &mut integrations.notion_token),
            ("NOTION_CALENDAR_DB", &mut integrations.notion_calendar_db),
            ("NOTION_TASKS_DB", &mut integrations.notion_tasks_db),
            ("NOTION_PROJECTS_DB", &mut integrations.notion_projects_db),
            ("HOME_ASSISTANT_URL", &mut integrations.home_assistant_url),
            ("HOME_ASSISTANT_TOKEN", &mut integrations.home_assistant_token),
            ("SEARCH_API_KEY", &mut integrations.search_api_key),
            ("SEARCH_ENGINE_ID", &mut integrations.search_engine_id),
        ] {
            if let Some(v) = get(key) {
                *slot = Some(v);
            }
        }
        if let Some(v) = get("ADMIN_USER_IDS") {
            self.security.admin_user_ids = parse_id_list(&v);
        }
        if let Some(v) = get("OPENCLAW_CONTROL_API_KEY") {
            self.server.control_api_key = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.bind.trim().is_empty() {
            return Err(anyhow::anyhow!("server.bind is required"));
        }
        if self.server.max_concurrent_requests == 0 {
            return Err(anyhow::anyhow!("server.max_concurrent_requests must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.inference.complexity_threshold) {
            return Err(anyhow::anyhow!(
                "inference.complexity_threshold must be within 0..=1, got {}",
                self.inference.complexity_threshold
            ));
        }
        if self.inference.monthly_budget_usd < 0.0 {
            return Err(anyhow::anyhow!(
                "inference.monthly_budget_usd must be >= 0"
            ));
        }
        if self.security.rate_limit_per_minute == 0 || self.security.rate_limit_per_hour == 0 {
            return Err(anyhow::anyhow!("security rate limits must be > 0"));
        }
        if self.overseer.cron_hour > 23 || self.overseer.cron_minute > 59 {
            return Err(anyhow::anyhow!(
                "overseer cron time {:02}:{:02} is out of range",
                self.overseer.cron_hour,
                self.overseer.cron_minute
            ));
        }
        let intervals = [
            self.overseer.interval_hours.unwrap_or(1),
            self.overseer.check_in_interval_hours,
        ];
        if intervals.iter().any(|h| *h == 0 || *h > MAX_INTERVAL_HOURS) {
            return Err(anyhow::anyhow!(
                "overseer intervals must be between 1 and {MAX_INTERVAL_HOURS} hours"
            ));
        }
        if self.channels.telegram.enabled && self.channels.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "channels.telegram.bot_token is required when telegram is enabled"
            ));
        }
        if self.channels.whatsapp.enabled && self.channels.whatsapp.bridge_url.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "channels.whatsapp.bridge_url is required when whatsapp is enabled"
            ));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.general
            .db_path
            .clone()
            .unwrap_or_else(|| self.general.data_dir.join("openclaw.db"))
    }

    pub fn openrouter_api_key(&self) -> &str {
        self.inference.openrouter_api_key.as_deref().unwrap_or("")
    }

    pub fn is_admin(&self, sender_id: &str) -> bool {
        self.security.admin_user_ids.iter().any(|id| id == sender_id)
    }
}

/// Accepts a JSON list (`["1","2"]`, numbers allowed) or a comma list.
pub fn parse_id_list(raw: &str) -> Vec<String> {
    if let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(raw) {
        return values
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s.trim().to_string()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect();
    }
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn default_config_root() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".openclaw")
}

pub fn default_config_path() -> PathBuf {
    default_config_root().join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    default_config_root().join("data")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = OpenClawConfig::from_toml("").expect("empty config parses");
        assert_eq!(cfg.server.bind, "127.0.0.1:8000");
        assert_eq!(cfg.security.rate_limit_per_minute, 30);
        assert_eq!(cfg.security.rate_limit_per_hour, 200);
        assert_eq!(cfg.security.dm_policy, DmPolicy::Allowlist);
        assert_eq!(cfg.overseer.cron_hour, 6);
        assert_eq!(cfg.overseer.check_in_interval_hours, 8);
        assert_eq!(cfg.inference.monthly_budget_usd, 50.0);
        assert_eq!(cfg.governance.blocked_commands.len(), 4);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn toml_sections_and_pricing_parse() {
        let cfg = OpenClawConfig::from_toml(
            r#"
[server]
bind = "0.0.0.0:9000"

[inference]
monthly_budget_usd = 10.0

[inference.pricing."anthropic/claude-sonnet-4"]
input_per_million = 3.0
output_per_million = 15.0

[security]
dm_policy = "pairing"
admin_user_ids = ["42"]

[overseer]
notify_channel = "telegram"
"#,
        )
        .expect("config parses");
        assert_eq!(cfg.server.bind, "0.0.0.0:9000");
        assert_eq!(cfg.security.dm_policy, DmPolicy::Pairing);
        assert!(cfg.is_admin("42"));
        assert_eq!(cfg.overseer.notify_channel, Some(Channel::Telegram));
        let pricing = cfg
            .inference
            .pricing
            .get("anthropic/claude-sonnet-4")
            .expect("pricing entry");
        assert_eq!(pricing.output_per_million, 15.0);
    }

    #[test]
    fn env_overrides_win_and_enable_channels() {
        let mut cfg = OpenClawConfig::default();
        cfg.apply_env_overrides(env_of(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("OPENROUTER_API_KEY", "sk-or"),
            ("INFERENCE_MONTHLY_BUDGET_USD", "12.5"),
            ("INFERENCE_COMPLEXITY_THRESHOLD", "not-a-number"),
            ("ADMIN_USER_IDS", "[\"7\", 8]"),
            ("NOTION_TOKEN", "secret_x"),
            ("DB_PATH", "/tmp/oc.db"),
            ("OLLAMA_MODEL", "   "),
        ]));
        assert!(cfg.channels.telegram.enabled);
        assert_eq!(cfg.openrouter_api_key(), "sk-or");
        assert_eq!(cfg.inference.monthly_budget_usd, 12.5);
        assert_eq!(cfg.inference.complexity_threshold, 0.6);
        assert_eq!(cfg.security.admin_user_ids, vec!["7", "8"]);
        assert_eq!(cfg.integrations.notion_token.as_deref(), Some("secret_x"));
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/oc.db"));
        assert_eq!(cfg.inference.ollama_model, "qwen2.5:3b");
    }

    #[test]
    fn id_lists_accept_comma_form() {
        assert_eq!(parse_id_list(" 1, 2 ,,3"), vec!["1", "2", "3"]);
        assert!(parse_id_list("[]").is_empty());
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let mut cfg = OpenClawConfig::default();
        cfg.inference.complexity_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = OpenClawConfig::default();
        cfg.overseer.cron_hour = 24;
        assert!(cfg.validate().is_err());

        let mut cfg = OpenClawConfig::default();
        cfg.security.rate_limit_per_hour = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = OpenClawConfig::default();
        cfg.channels.telegram.enabled = true;
        assert!(cfg.validate().is_err());

        let mut cfg = OpenClawConfig::default();
        cfg.overseer.interval_hours = Some(u64::MAX);
        assert!(cfg.validate().is_err());

        let mut cfg = OpenClawConfig::default();
        cfg.overseer.check_in_interval_hours = MAX_INTERVAL_HOURS + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = OpenClawConfig::default();
        cfg.overseer.check_in_interval_hours = MAX_INTERVAL_HOURS;
        assert!(cfg.validate().is_ok());
    }
}
