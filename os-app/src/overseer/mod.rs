//! Human-in-the-loop overseer.
//!
//! Owns the security policy, the approval ledger, the key vault and the
//! protocol auditor. Every sensitive change is created here as a pending
//! approval and only takes effect when a human approves it.

pub mod approvals;
pub mod keyvault;
pub mod policy;
pub mod protocol;
pub mod scheduler;

use crate::access::SharedSecurity;
use crate::config::DmPolicy;
use crate::store::MemoryStore;
use approvals::{ApprovalError, ApprovalKind, ApprovalLedger, ApprovalRequest};
use chrono::Utc;
use keyvault::{KeyVault, VaultCommand, mask};
use os_llm::InferenceRouter;
use os_tools::hardening::{self, HardeningPrecondition};
use os_tools::{CommandPolicy, CommandRunner, SharedCommandPolicy, optional_string_list};
use os_tools::{run_report, run_text};
use policy::{AgentState, SecurityPolicy, SharedGovernance};
use protocol::{AuditInputs, AuditReport, SecurityProtocolAgent, Severity};
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

const OVERSEER_USER: &str = "overseer:agent1";
const ADMIN_TIER: u8 = 5;
const HARDENING_TIMEOUT: Duration = Duration::from_secs(60);
const CONFIG_FIELDS: &[&str] = &["blocked_commands", "approval_required", "allow_from", "dm_policy"];

static APPROVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bapprove\b(?:\s+(\S+))?").expect("valid approve regex"));
static REJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\breject\b(?:\s+(\S+))?").expect("valid reject regex"));

const HELP: &str = "**OpenClaw Overseer Commands:**
  - `overseer status` -- Check Agent 2 status and overview
  - `overseer audit` -- Run a security audit now
  - `overseer last report` -- View the latest audit report
  - `overseer start/stop/pause agent` -- Control Agent 2
  - `overseer pending` -- View pending approval requests
  - `overseer approve <id>` -- Approve a pending request
  - `overseer reject <id>` -- Reject a pending request
  - `overseer policy` -- View current security policy
  - `overseer change prompt: <text>` -- Request prompt change (requires approval)
  - `overseer change config: <json>` -- Request config change (requires approval)

**KeyVault Commands:**
  - `overseer keyvault list` -- List all registered API keys (masked)
  - `overseer keyvault <service>` -- Request access to a key (requires approval)
  - `overseer api key notion` -- Request a specific key (requires approval)
";

const VAULT_HELP: &str = "**KeyVault Commands:**
  - `overseer keyvault list` -- List all registered API keys (masked)
  - `overseer keyvault <service>` -- Request access to a specific key
    Services: notion, anthropic, telegram, home_assistant, search_api
  - `overseer keyvault get <key_id>` -- Request access by key ID
  - `overseer keyvault add <service> <ENV_VAR> <value>` -- Request a new key
  - `overseer keyvault remove <key_id>` -- Request key removal

All key reveals require your explicit approval.";

/// Snapshot sent to the human on status requests and scheduled check-ins.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckIn {
    pub agent_state: AgentState,
    pub last_audit_summary: Option<String>,
    pub pending_approvals: usize,
    pub critical_findings: usize,
    pub uptime_hours: f64,
}

impl CheckIn {
    pub fn needs_attention(&self) -> bool {
        self.critical_findings > 0 || self.pending_approvals > 0
    }
}

pub struct OverseerAgent {
    store: Arc<MemoryStore>,
    runner: Arc<dyn CommandRunner>,
    security: SharedSecurity,
    governance: SharedGovernance,
    command_policy: SharedCommandPolicy,
    policy: RwLock<SecurityPolicy>,
    approvals: ApprovalLedger,
    vault: KeyVault,
    protocol: SecurityProtocolAgent,
}

impl OverseerAgent {
    pub fn new(
        store: Arc<MemoryStore>,
        router: Arc<InferenceRouter>,
        runner: Arc<dyn CommandRunner>,
        security: SharedSecurity,
        governance: SharedGovernance,
        command_policy: SharedCommandPolicy,
        vault: KeyVault,
    ) -> Self {
        let protocol = SecurityProtocolAgent::new(runner.clone(), store.clone(), router);
        Self {
            store,
            runner,
            security,
            governance,
            command_policy,
            policy: RwLock::new(SecurityPolicy::base(Utc::now())),
            approvals: ApprovalLedger::new(),
            vault,
            protocol,
        }
    }

    pub fn approvals(&self) -> &ApprovalLedger {
        &self.approvals
    }

    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    pub fn protocol(&self) -> &SecurityProtocolAgent {
        &self.protocol
    }

    pub fn policy(&self) -> SecurityPolicy {
        self.policy
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn audit(&self, user: &str, action: &str, detail: &str) {
        if let Err(error) = self
            .store
            .log_audit(user, action, Some(detail), ADMIN_TIER, Utc::now())
        {
            tracing::warn!(%error, action, "failed to write overseer audit entry");
        }
    }

    // Protocol agent control

    fn set_agent_state(&self, state: AgentState, action: &str, verb: &str) -> String {
        self.protocol.set_state(state);
        self.audit(OVERSEER_USER, action, &format!("Agent 2 {verb} by Agent 1"));
        format!("Security Protocol Agent (Agent 2) has been {verb}.")
    }

    pub fn start_agent(&self) -> String {
        self.set_agent_state(AgentState::Running, "agent2_start", "started")
    }

    pub fn stop_agent(&self) -> String {
        self.set_agent_state(AgentState::Stopped, "agent2_stop", "stopped")
    }

    pub fn pause_agent(&self) -> String {
        self.set_agent_state(AgentState::Paused, "agent2_pause", "paused")
    }

    // Audits

    fn audit_inputs(&self) -> AuditInputs {
        let workspace = self
            .security
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .workspace
            .clone();
        let governance = self
            .governance
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        AuditInputs {
            workspace,
            blocked_commands: governance.blocked_commands,
            approval_required: governance.approval_required,
            policy: self.policy(),
        }
    }

    pub async fn request_audit(&self, trigger: &str) -> AuditReport {
        let report = self.protocol.run_audit(trigger, &self.audit_inputs()).await;
        let detail = json!({
            "report_id": report.id,
            "trigger": trigger,
            "findings": report.findings.len(),
            "critical": report.critical_count(),
        });
        self.audit(OVERSEER_USER, "audit_requested", &detail.to_string());
        report
    }

    pub fn format_report(&self, report: &AuditReport) -> String {
        let mut lines = vec![
            format!("**Security Audit Report** (ID: {})", report.id),
            format!(
                "Triggered by: {} | Duration: {}s",
                report.trigger, report.duration_secs
            ),
            format!(
                "Findings: {} total ({} critical, {} warnings)",
                report.findings.len(),
                report.critical_count(),
                report.warning_count()
            ),
            String::new(),
        ];
        if !report.summary.is_empty() {
            lines.push(format!("**Summary:** {}", report.summary));
            lines.push(String::new());
        }
        for severity in [Severity::Critical, Severity::Warning, Severity::Info] {
            let matching: Vec<_> = report
                .findings
                .iter()
                .filter(|f| f.severity == severity)
                .collect();
            if matching.is_empty() {
                continue;
            }
            lines.push(format!("**{}:**", severity.label()));
            for finding in matching {
                lines.push(format!("  - [{}] {}", finding.check_name, finding.summary));
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }

    pub fn check_in(&self) -> CheckIn {
        let last = self.protocol.last_report();
        CheckIn {
            agent_state: self.protocol.state(),
            last_audit_summary: last.as_ref().map(|r| r.summary.clone()),
            pending_approvals: self.approvals.pending().len(),
            critical_findings: last.as_ref().map_or(0, AuditReport::critical_count),
            uptime_hours: self.protocol.uptime_hours(),
        }
    }

    pub fn format_check_in(&self, check_in: &CheckIn) -> String {
        let mut lines = vec![
            "**Overseer Check-In**".to_string(),
            format!("Agent 2 status: {}", check_in.agent_state.as_str()),
            format!("Uptime: {:.1} hours", check_in.uptime_hours),
        ];
        if let Some(summary) = check_in.last_audit_summary.as_deref().filter(|s| !s.is_empty()) {
            lines.push(format!("Last audit: {summary}"));
        }
        if check_in.critical_findings > 0 {
            lines.push(format!(
                "**{} critical finding(s) require attention.**",
                check_in.critical_findings
            ));
        }
        if check_in.pending_approvals > 0 {
            lines.push(format!(
                "**{} pending approval(s) awaiting your decision.**",
                check_in.pending_approvals
            ));
        }
        if !check_in.needs_attention() {
            lines.push("All clear. No issues require your attention.".to_string());
        }
        lines.join("\n")
    }

    // Approvals

    pub fn create_approval(
        &self,
        kind: ApprovalKind,
        description: &str,
        payload: Value,
        requested_by: &str,
    ) -> ApprovalRequest {
        let request = self
            .approvals
            .create(kind, description, payload, requested_by, Utc::now());
        let detail = json!({
            "request_id": request.id,
            "type": kind.as_str(),
            "description": description,
        });
        self.audit(OVERSEER_USER, "approval_created", &detail.to_string());
        tracing::info!(request_id = %request.id, kind = kind.as_str(), "approval request created");
        request
    }

    /// Approves a pending request and applies its effect right away.
    #[tracing::instrument(level = "info", skip_all, fields(request_id = %id, approver = %by))]
    pub async fn approve_request(&self, id: &str, by: &str) -> Result<String, ApprovalError> {
        let request = self.approvals.approve(id, by, Utc::now())?;
        let result = self.apply(&request, by).await;
        // The secret goes back to the approver once; the ledger and audit
        // log only keep the fact that it was revealed.
        let recorded = redact_reveal(&result);
        self.approvals.record_outcome(&request.id, &recorded);
        let detail = json!({
            "request_id": request.id,
            "type": request.kind.as_str(),
            "result": recorded,
        });
        self.audit(by, "approval_approved", &detail.to_string());
        Ok(format!("Approved: {result}"))
    }

    #[tracing::instrument(level = "info", skip_all, fields(request_id = %id, approver = %by))]
    pub fn reject_request(&self, id: &str, by: &str) -> Result<String, ApprovalError> {
        let request = self.approvals.reject(id, by, Utc::now())?;
        let detail = json!({"request_id": request.id, "type": request.kind.as_str()});
        self.audit(by, "approval_rejected", &detail.to_string());
        Ok(format!(
            "Request {} has been rejected. No changes applied.",
            request.id
        ))
    }

    async fn apply(&self, request: &ApprovalRequest, by: &str) -> String {
        let payload = &request.payload;
        let field = |key: &str| payload_str(payload, key);
        let now = Utc::now();

        match request.kind {
            ApprovalKind::PromptChange => match field("new_prompt") {
                Some(prompt) => {
                    let version = self
                        .policy
                        .write()
                        .unwrap_or_else(|p| p.into_inner())
                        .replace_prompt(prompt, by, now);
                    format!("Security prompt updated to version {version}.")
                }
                None => "No new_prompt in proposed change.".to_string(),
            },
            ApprovalKind::ConfigChange => self.apply_config_change(payload),
            ApprovalKind::KeyAccess => match field("key_id") {
                Some(key_id) => match self.vault.reveal(key_id, by, now) {
                    Some(value) => format!("Key revealed: `{value}`"),
                    None => "Key not found in vault.".to_string(),
                },
                None => "No key_id in proposed change.".to_string(),
            },
            ApprovalKind::KeyAdd => match (field("service"), field("value")) {
                (Some(service), Some(value)) => {
                    let env_var = field("env_var").unwrap_or_default();
                    let entry = self.vault.add(service, env_var, value, by, now);
                    format!("Key added for {} [{}].", entry.service, entry.key_id)
                }
                _ => "Missing service or value in proposed change.".to_string(),
            },
            ApprovalKind::KeyRemove => match field("key_id") {
                Some(key_id) if self.vault.remove(key_id, by, now) => "Key removed.".to_string(),
                Some(key_id) => format!("Key {key_id} not found."),
                None => "No key_id in proposed change.".to_string(),
            },
            ApprovalKind::Hardening => match field("step_id") {
                Some(step_id) => self.apply_hardening(step_id, by).await,
                None => "No step_id in proposed change.".to_string(),
            },
        }
    }

    fn apply_config_change(&self, payload: &Value) -> String {
        let list = |key: &str| optional_string_list(payload, key).ok().flatten();
        let mut applied = Vec::new();

        {
            let mut governance = self.governance.write().unwrap_or_else(|p| p.into_inner());
            if let Some(blocked) = list("blocked_commands") {
                *self
                    .command_policy
                    .write()
                    .unwrap_or_else(|p| p.into_inner()) = CommandPolicy::new(blocked.clone());
                governance.blocked_commands = blocked;
                applied.push("blocked_commands");
            }
            if let Some(required) = list("approval_required") {
                governance.approval_required = required;
                applied.push("approval_required");
            }
        }
        {
            let mut security = self.security.write().unwrap_or_else(|p| p.into_inner());
            if let Some(allow_from) = list("allow_from") {
                security.allow_from = allow_from;
                applied.push("allow_from");
            }
            let dm_policy = payload
                .get("dm_policy")
                .and_then(Value::as_str)
                .and_then(DmPolicy::parse);
            if let Some(dm_policy) = dm_policy {
                security.dm_policy = dm_policy;
                applied.push("dm_policy");
            }
        }

        if applied.is_empty() {
            "No recognized config fields in proposed change.".to_string()
        } else {
            tracing::info!(fields = ?applied, "config change applied");
            format!("Config updated: {}", applied.join(", "))
        }
    }

    /// Runs a catalog step by id with the sshd backup and firewall lockout
    /// guards, then asks for a verification audit.
    async fn apply_hardening(&self, step_id: &str, by: &str) -> String {
        let Some(step) = hardening::find_step(step_id) else {
            return format!("Unknown hardening step '{step_id}'.");
        };

        if step.precondition == Some(HardeningPrecondition::UfwAllowsSsh) {
            let status = run_text(self.runner.as_ref(), &["ufw", "status"], HARDENING_TIMEOUT).await;
            if !hardening::ufw_allows_ssh(&status) {
                return "Cannot enable UFW: SSH (port 22) is not allowed. \
                        Apply `ufw_allow_ssh` first to prevent lockout."
                    .to_string();
            }
        }
        if step.edits_sshd_config() {
            let backup = run_report(
                self.runner.as_ref(),
                &["cp", hardening::SSHD_CONFIG_PATH, hardening::SSHD_CONFIG_BACKUP_PATH],
                HARDENING_TIMEOUT,
            )
            .await;
            tracing::info!(backup = %backup, "sshd_config backed up");
        }

        let command_line = step.command_line();
        self.audit(
            &format!("ssh_hardening:{by}"),
            "hardening_applied",
            &format!("Applying {}: {command_line}", step.id),
        );
        let output = run_report(self.runner.as_ref(), step.command, HARDENING_TIMEOUT).await;

        let report = self.request_audit("ssh_hardening").await;
        format!(
            "Applied {}: `{command_line}`\n```\n{output}\n```\nVerification audit {}: {} finding(s), {} critical.",
            step.id,
            report.id,
            report.findings.len(),
            report.critical_count()
        )
    }

    // Chat commands

    /// Handles an `overseer ...` message and returns the reply text.
    #[tracing::instrument(level = "info", skip_all, fields(sender_id = %sender))]
    pub async fn handle_command(&self, text: &str, sender: &str) -> String {
        let lower = text.trim().to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["change prompt", "modify prompt", "update prompt"]) {
            return self.request_prompt_change(text, sender);
        }
        if has(&["change config", "modify config", "update config"]) {
            return self.request_config_change(text, sender);
        }

        if has(&["start agent", "start security"]) {
            return self.start_agent();
        }
        if has(&["stop agent", "stop security"]) {
            return self.stop_agent();
        }
        if has(&["pause agent", "pause security"]) {
            return self.pause_agent();
        }

        if let Some(caps) = APPROVE.captures(&lower) {
            return match caps.get(1) {
                Some(id) => self
                    .approve_request(id.as_str(), sender)
                    .await
                    .unwrap_or_else(|e| e.to_string()),
                None => "Specify the approval ID. Use 'overseer pending' to see pending requests."
                    .to_string(),
            };
        }
        if let Some(caps) = REJECT.captures(&lower) {
            return match caps.get(1) {
                Some(id) => self
                    .reject_request(id.as_str(), sender)
                    .unwrap_or_else(|e| e.to_string()),
                None => "Specify the request ID to reject.".to_string(),
            };
        }

        if lower.contains("status") {
            return self.format_check_in(&self.check_in());
        }
        if has(&["audit", "scan", "security check"]) {
            let report = self.request_audit("manual").await;
            return self.format_report(&report);
        }
        if has(&["last report", "latest report", "findings"]) {
            return match self.protocol.last_report() {
                Some(report) => self.format_report(&report),
                None => "No audit reports yet. Run one with: 'overseer audit'".to_string(),
            };
        }
        if has(&["pending", "approval"]) {
            return self.format_pending();
        }
        if has(&["keyvault", "key vault", "api key"]) {
            return self.handle_vault_command(text, sender);
        }
        if has(&["policy", "prompt", "config"]) {
            let policy = self.policy();
            return format!(
                "**Current Security Policy** (v{})\nLast modified: {}\nModified by: {}\n\n```\n{}\n```",
                policy.version,
                policy.last_modified.to_rfc3339(),
                policy.modified_by,
                policy.prompt
            );
        }
        HELP.to_string()
    }

    fn format_pending(&self) -> String {
        let pending = self.approvals.pending();
        if pending.is_empty() {
            return "No pending approval requests.".to_string();
        }
        let mut lines = vec!["**Pending Approvals:**".to_string()];
        for request in &pending {
            lines.push(format!(
                "  - [{}] {}: {}",
                request.id,
                request.kind.as_str(),
                request.description
            ));
        }
        lines.push("\nUse 'overseer approve <id>' or 'overseer reject <id>' to act.".to_string());
        lines.join("\n")
    }

    fn request_prompt_change(&self, text: &str, sender: &str) -> String {
        let new_prompt = text
            .split_once(':')
            .map(|(_, rest)| rest.trim())
            .filter(|p| !p.is_empty());
        let Some(new_prompt) = new_prompt else {
            return "To request a prompt change, use:\n  overseer change prompt: <your new prompt text>"
                .to_string();
        };
        let preview: String = new_prompt.chars().take(80).collect();
        let request = self.create_approval(
            ApprovalKind::PromptChange,
            &format!("Change security prompt to: {preview}..."),
            json!({ "new_prompt": new_prompt }),
            sender,
        );
        format!(
            "Prompt change request created (ID: {id}).\n\
             This requires your explicit approval.\n\
             Use 'overseer approve {id}' to apply, or 'overseer reject {id}' to discard.",
            id = request.id
        )
    }

    fn request_config_change(&self, text: &str, sender: &str) -> String {
        const USAGE: &str = "To request a config change, use:\n  \
            overseer change config: {\"allow_from\": [\"<id>\"], \"dm_policy\": \"pairing\"}\n\
            Fields: blocked_commands, approval_required, allow_from, dm_policy";

        let changes = text
            .split_once(':')
            .and_then(|(_, rest)| serde_json::from_str::<Value>(rest.trim()).ok())
            .filter(Value::is_object);
        let Some(changes) = changes else {
            return USAGE.to_string();
        };
        let fields: Vec<&str> = CONFIG_FIELDS
            .iter()
            .copied()
            .filter(|f| changes.get(f).is_some())
            .collect();
        if fields.is_empty() {
            return USAGE.to_string();
        }
        let request = self.create_approval(
            ApprovalKind::ConfigChange,
            &format!("Change config: {}", fields.join(", ")),
            changes,
            sender,
        );
        format!(
            "Config change request created (ID: {id}).\n\
             This requires your explicit approval.\n\
             Use 'overseer approve {id}' to apply, or 'overseer reject {id}' to discard.",
            id = request.id
        )
    }

    fn handle_vault_command(&self, text: &str, sender: &str) -> String {
        match self.vault.parse_command(text) {
            VaultCommand::List => self.vault.format_key_list(),
            VaultCommand::Reveal {
                key_id,
                service,
                masked,
            } => {
                self.audit(
                    sender,
                    "keyvault_reveal_requested",
                    &json!({"key_id": key_id, "service": service}).to_string(),
                );
                let request = self.create_approval(
                    ApprovalKind::KeyAccess,
                    &format!("Reveal API key for {service} (masked: {masked})"),
                    json!({"key_id": key_id, "service": service}),
                    sender,
                );
                format!(
                    "**Key access request created** (ID: {id})\n\
                     Service: {service} | Masked: `{masked}`\n\n\
                     This requires your explicit approval.\n\
                     Use `overseer approve {id}` to reveal the key, or `overseer reject {id}` to deny.",
                    id = request.id
                )
            }
            VaultCommand::Add {
                service,
                env_var,
                value,
            } => {
                let masked = mask(&value);
                let request = self.create_approval(
                    ApprovalKind::KeyAdd,
                    &format!("Add API key for {service} ({env_var}, masked: {masked})"),
                    json!({"service": service, "env_var": env_var, "value": value}),
                    sender,
                );
                format!(
                    "**Key add request created** (ID: {id})\n\
                     Service: {service} | Masked: `{masked}`\n\n\
                     Use `overseer approve {id}` to store the key, or `overseer reject {id}` to discard.",
                    id = request.id
                )
            }
            VaultCommand::AddUsage => "To add a key, provide:\n  \
                `overseer keyvault add <service> <ENV_VAR> <value>`\n\
                This will create an approval request before the key is stored."
                .to_string(),
            VaultCommand::Remove { key_id } => {
                let Some(entry) = self.vault.get(&key_id) else {
                    return format!("Key {key_id} not found.");
                };
                let request = self.create_approval(
                    ApprovalKind::KeyRemove,
                    &format!("Remove API key for {} [{}]", entry.service, entry.key_id),
                    json!({"key_id": entry.key_id, "service": entry.service}),
                    sender,
                );
                format!(
                    "**Key removal request created** (ID: {id})\n\
                     Use `overseer approve {id}` to delete the key, or `overseer reject {id}` to keep it.",
                    id = request.id
                )
            }
            VaultCommand::RemoveUsage => "To remove a key, provide:\n  \
                `overseer keyvault remove <key_id>`\n\
                This will create an approval request before the key is deleted."
                .to_string(),
            VaultCommand::Help => VAULT_HELP.to_string(),
        }
    }
}

fn payload_str<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Revealed secrets never reach the audit log or the approval ledger.
fn redact_reveal(result: &str) -> String {
    if result.starts_with("Key revealed:") {
        "Key revealed.".to_string()
    } else {
        result.to_string()
    }
}
