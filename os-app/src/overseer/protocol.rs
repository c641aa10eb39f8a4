//! Security protocol auditor.
//!
//! Runs read-only checks across four domains (identity and access,
//! execution isolation, command governance, network exposure) plus a prompt
//! integrity check. It never changes configuration; findings go back to the
//! overseer, which decides what to surface.

use super::policy::{AgentState, SecurityPolicy};
use crate::store::MemoryStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use os_llm::{InferenceRouter, ProviderKind};
use os_tools::{CommandRunner, run_text};
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);
const RAW_OUTPUT_LIMIT: usize = 500;
const AUDITOR_USER: &str = "overseer:agent2";
const EXTERNAL_CONNECTION_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditFinding {
    pub check_name: String,
    pub severity: Severity,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

impl AuditFinding {
    fn new(check_name: &str, severity: Severity, summary: impl Into<String>) -> Self {
        Self {
            check_name: check_name.to_string(),
            severity,
            summary: summary.into(),
            detail: None,
            raw_output: None,
        }
    }

    fn with_raw(mut self, raw: &str) -> Self {
        self.raw_output = Some(raw.chars().take(RAW_OUTPUT_LIMIT).collect());
        self
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub id: String,
    pub run_at: DateTime<Utc>,
    pub trigger: String,
    pub findings: Vec<AuditFinding>,
    pub summary: String,
    pub duration_secs: f64,
}

impl AuditReport {
    fn count(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }

    pub fn critical_count(&self) -> usize {
        self.count(Severity::Critical)
    }

    pub fn warning_count(&self) -> usize {
        self.count(Severity::Warning)
    }

    pub fn info_count(&self) -> usize {
        self.count(Severity::Info)
    }
}

/// Settings an audit checks against, captured when the audit starts.
#[derive(Debug, Clone)]
pub struct AuditInputs {
    pub workspace: String,
    pub blocked_commands: Vec<String>,
    pub approval_required: Vec<String>,
    pub policy: SecurityPolicy,
}

fn unavailable(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("command not found") || lower == "command timed out."
}

/// Non-empty output lines; the runner's "(no output)" marker counts as none.
fn output_lines(output: &str) -> Vec<&str> {
    if output.trim() == "(no output)" {
        return Vec::new();
    }
    output.lines().filter(|l| !l.trim().is_empty()).collect()
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub struct SecurityProtocolAgent {
    runner: Arc<dyn CommandRunner>,
    store: Arc<MemoryStore>,
    router: Arc<InferenceRouter>,
    state: Mutex<AgentState>,
    last_report: Mutex<Option<AuditReport>>,
    started_at: Instant,
}

impl SecurityProtocolAgent {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        store: Arc<MemoryStore>,
        router: Arc<InferenceRouter>,
    ) -> Self {
        Self {
            runner,
            store,
            router,
            state: Mutex::new(AgentState::Running),
            last_report: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_state(&self, state: AgentState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
        tracing::info!(state = state.as_str(), "security protocol agent state changed");
    }

    pub fn last_report(&self) -> Option<AuditReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn uptime_hours(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64() / 3600.0
    }

    async fn run(&self, argv: &[&str]) -> String {
        run_text(self.runner.as_ref(), argv, COMMAND_TIMEOUT).await
    }

    #[tracing::instrument(level = "info", skip_all, fields(trigger = %trigger))]
    pub async fn run_audit(&self, trigger: &str, inputs: &AuditInputs) -> AuditReport {
        if self.state() == AgentState::Stopped {
            return AuditReport {
                id: short_id(),
                run_at: Utc::now(),
                trigger: trigger.to_string(),
                findings: Vec::new(),
                summary: "Agent is stopped. No audit performed.".to_string(),
                duration_secs: 0.0,
            };
        }

        let started = Instant::now();
        let run_at = Utc::now();
        let mut findings = Vec::new();

        let checks = [
            ("identity_access", self.check_identity_access().await),
            ("execution_isolation", self.check_execution_isolation(inputs).await),
            ("command_governance", self.check_command_governance(inputs, run_at).await),
            ("network_security", self.check_network_security().await),
        ];
        for (name, result) in checks {
            match result {
                Ok(found) => findings.extend(found),
                Err(error) => {
                    tracing::warn!(check = name, error = %format!("{error:#}"), "audit check failed");
                    findings.push(AuditFinding::new(
                        name,
                        Severity::Warning,
                        format!("Check failed with error: {error:#}"),
                    ));
                }
            }
        }
        if let Some(finding) = prompt_integrity(&inputs.policy) {
            findings.push(finding);
        }

        let summary = self.summarize(&findings).await;
        let report = AuditReport {
            id: short_id(),
            run_at,
            trigger: trigger.to_string(),
            findings,
            summary,
            duration_secs: (started.elapsed().as_secs_f64() * 100.0).round() / 100.0,
        };

        let detail = json!({
            "report_id": report.id,
            "trigger": trigger,
            "findings_count": report.findings.len(),
            "critical": report.critical_count(),
            "warnings": report.warning_count(),
            "info": report.info_count(),
            "duration_s": report.duration_secs,
        })
        .to_string();
        if let Err(error) = self
            .store
            .log_audit(AUDITOR_USER, "security_audit", Some(&detail), 5, Utc::now())
        {
            tracing::warn!(%error, "failed to record security audit");
        }
        tracing::info!(
            report_id = %report.id,
            findings = report.findings.len(),
            critical = report.critical_count(),
            warnings = report.warning_count(),
            info = report.info_count(),
            "security audit complete"
        );

        *self.last_report.lock().unwrap_or_else(|p| p.into_inner()) = Some(report.clone());
        report
    }

    async fn check_identity_access(&self) -> Result<Vec<AuditFinding>> {
        let mut findings = Vec::new();

        let keys = self
            .run(&["find", "/root/.ssh", "-name", "authorized_keys", "-exec", "cat", "{}", ";"])
            .await;
        if !unavailable(&keys) && !keys.contains("No such file") {
            let count = output_lines(&keys)
                .iter()
                .filter(|l| !l.trim_start().starts_with('#'))
                .count();
            let severity = if count <= 2 { Severity::Info } else { Severity::Warning };
            findings.push(
                AuditFinding::new(
                    "ssh_authorized_keys",
                    severity,
                    format!("{count} SSH authorized key(s) found"),
                )
                .with_raw(&keys),
            );
        }

        let who = self.run(&["who"]).await;
        let sessions = output_lines(&who);
        if !unavailable(&who) && !sessions.is_empty() {
            let severity = if sessions.len() <= 1 { Severity::Info } else { Severity::Warning };
            findings.push(
                AuditFinding::new(
                    "active_users",
                    severity,
                    format!("{} active user session(s)", sessions.len()),
                )
                .with_raw(&who),
            );
        } else {
            findings.push(AuditFinding::new(
                "active_users",
                Severity::Info,
                "No active user sessions detected",
            ));
        }

        let uid_zero = self
            .run(&["awk", "-F:", "$3==0 {print $1}", "/etc/passwd"])
            .await;
        if !unavailable(&uid_zero) {
            let users: Vec<&str> = output_lines(&uid_zero).iter().map(|u| u.trim()).collect();
            if users.len() > 1 {
                findings.push(
                    AuditFinding::new(
                        "uid_zero_users",
                        Severity::Critical,
                        format!("Multiple UID-0 users found: {}", users.join(", ")),
                    )
                    .with_raw(&uid_zero),
                );
            }
        }

        Ok(findings)
    }

    async fn check_execution_isolation(&self, inputs: &AuditInputs) -> Result<Vec<AuditFinding>> {
        let mut findings = Vec::new();

        let ps = self
            .run(&["docker", "ps", "--format", "{{.Names}}\t{{.Status}}"])
            .await;
        let containers = output_lines(&ps);
        if !unavailable(&ps) && !ps.starts_with("Error") {
            findings.push(
                AuditFinding::new(
                    "docker_containers",
                    Severity::Info,
                    format!("Docker running, {} container(s) active", containers.len()),
                )
                .with_raw(&ps),
            );
            for line in &containers {
                let name = line.split('\t').next().unwrap_or_default().trim();
                if name.is_empty() {
                    continue;
                }
                let privileged = self
                    .run(&["docker", "inspect", "--format", "{{.HostConfig.Privileged}}", name])
                    .await;
                if privileged.trim().eq_ignore_ascii_case("true") {
                    findings.push(AuditFinding::new(
                        "privileged_container",
                        Severity::Critical,
                        format!("Container '{name}' is running in privileged mode"),
                    ));
                }
            }
        } else {
            findings.push(AuditFinding::new(
                "docker_containers",
                Severity::Warning,
                "Docker not available or not running",
            ));
        }

        let workspace = inputs.workspace.as_str();
        let listing = self.run(&["ls", "-la", workspace]).await;
        if listing.contains("No such file") {
            findings.push(AuditFinding::new(
                "workspace_exists",
                Severity::Warning,
                format!("Designated workspace {workspace} does not exist"),
            ));
        } else if !unavailable(&listing) {
            findings.push(AuditFinding::new(
                "workspace_exists",
                Severity::Info,
                format!("Workspace {workspace} exists and is accessible"),
            ));
        }

        Ok(findings)
    }

    async fn check_command_governance(
        &self,
        inputs: &AuditInputs,
        now: DateTime<Utc>,
    ) -> Result<Vec<AuditFinding>> {
        let mut findings = Vec::new();

        let recent: Vec<_> = self
            .store
            .recent_audit(24, None, now)?
            .into_iter()
            .filter(|e| ["shell", "admin", "security"].iter().any(|k| e.action.contains(k)))
            .take(50)
            .collect();
        if !recent.is_empty() {
            let sample: Vec<_> = recent
                .iter()
                .take(10)
                .map(|e| json!({"action": e.action, "user_id": e.user_id, "created_at": e.created_at}))
                .collect();
            findings.push(
                AuditFinding::new(
                    "recent_audit_events",
                    Severity::Info,
                    format!("{} security-relevant audit events in last 24h", recent.len()),
                )
                .with_detail(serde_json::Value::Array(sample).to_string()),
            );
        }

        let history = self
            .run(&[
                "bash",
                "-c",
                "history 50 2>/dev/null || cat ~/.bash_history 2>/dev/null | tail -50",
            ])
            .await;
        if !unavailable(&history) {
            let lower = history.to_lowercase();
            for pattern in &inputs.blocked_commands {
                if lower.contains(&pattern.to_lowercase()) {
                    findings.push(AuditFinding::new(
                        "blocked_command_detected",
                        Severity::Critical,
                        format!("Blocked command pattern '{pattern}' found in recent history"),
                    ));
                }
            }
        }

        if inputs.approval_required.is_empty() {
            findings.push(AuditFinding::new(
                "governance_config",
                Severity::Critical,
                "No commands require approval: governance may be misconfigured",
            ));
        }

        Ok(findings)
    }

    async fn check_network_security(&self) -> Result<Vec<AuditFinding>> {
        let mut findings = Vec::new();

        let listening = self.run(&["ss", "-tlnp"]).await;
        if !unavailable(&listening) {
            let lines = output_lines(&listening);
            for line in lines.iter().skip(1) {
                let exposed = (line.contains("0.0.0.0:") || line.contains(":::"))
                    && !line.contains("127.0.0.1");
                if exposed {
                    let shown: String = line.trim().chars().take(100).collect();
                    findings.push(
                        AuditFinding::new(
                            "open_port",
                            Severity::Warning,
                            format!("Service listening on all interfaces: {shown}"),
                        )
                        .with_raw(line),
                    );
                }
            }
            findings.push(
                AuditFinding::new(
                    "listening_ports",
                    Severity::Info,
                    format!(
                        "{} listening TCP port(s) detected",
                        lines.len().saturating_sub(1)
                    ),
                )
                .with_raw(&listening),
            );
        }

        let established = self
            .run(&["ss", "-tunp", "state", "established"])
            .await;
        if !unavailable(&established) {
            let external: Vec<&str> = output_lines(&established)
                .into_iter()
                .filter(|l| !l.contains("127.0.0.1") && !l.contains("::1"))
                .collect();
            if external.len() > EXTERNAL_CONNECTION_LIMIT {
                findings.push(
                    AuditFinding::new(
                        "external_connections",
                        Severity::Warning,
                        format!("{} external connections detected", external.len()),
                    )
                    .with_raw(&external[..10.min(external.len())].join("\n")),
                );
            }
        }

        let fail2ban = self.run(&["fail2ban-client", "status"]).await;
        if !unavailable(&fail2ban) && !fail2ban.to_lowercase().contains("error") {
            findings.push(
                AuditFinding::new("fail2ban", Severity::Info, "fail2ban is active").with_raw(&fail2ban),
            );
        } else {
            findings.push(AuditFinding::new(
                "fail2ban",
                Severity::Warning,
                "fail2ban is not installed or not running",
            ));
        }

        let ufw = self.run(&["ufw", "status"]).await.to_lowercase();
        if ufw.contains("active") && !ufw.contains("inactive") {
            findings.push(
                AuditFinding::new("firewall", Severity::Info, "UFW firewall is active").with_raw(&ufw),
            );
        } else {
            let rules = self.run(&["iptables", "-L", "-n", "--line-numbers"]).await;
            if !unavailable(&rules) && !rules.starts_with("Error") {
                let count = output_lines(&rules)
                    .iter()
                    .filter(|l| !l.starts_with("Chain") && !l.starts_with("num"))
                    .count();
                if count > 0 {
                    findings.push(AuditFinding::new(
                        "firewall",
                        Severity::Info,
                        format!("iptables has {count} rules configured"),
                    ));
                } else {
                    findings.push(AuditFinding::new(
                        "firewall",
                        Severity::Warning,
                        "No firewall rules configured",
                    ));
                }
            }
        }

        Ok(findings)
    }

    async fn summarize(&self, findings: &[AuditFinding]) -> String {
        if findings.is_empty() {
            return "No issues detected. All security checks passed.".to_string();
        }
        let listing = findings
            .iter()
            .map(|f| format!("- [{}] {}: {}", f.severity.label(), f.check_name, f.summary))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Summarize these security audit findings in 2-3 sentences. \
             Highlight any critical issues first.\n\n{listing}"
        );
        match self
            .router
            .generate(
                &prompt,
                Some("You are a security analyst. Be concise and actionable."),
                Some(ProviderKind::Ollama),
                0.3,
            )
            .await
        {
            Ok(completion) => completion.text,
            Err(error) => {
                tracing::warn!(%error, "audit summary failed; using counts");
                fallback_summary(findings)
            }
        }
    }
}

fn prompt_integrity(policy: &SecurityPolicy) -> Option<AuditFinding> {
    if policy.is_canonical() {
        return None;
    }
    Some(
        AuditFinding::new(
            "prompt_integrity",
            Severity::Critical,
            "Active security prompt differs from canonical base prompt",
        )
        .with_detail(format!(
            "Version: {}, Modified by: {}",
            policy.version, policy.modified_by
        )),
    )
}

fn fallback_summary(findings: &[AuditFinding]) -> String {
    let critical = findings.iter().filter(|f| f.severity == Severity::Critical).count();
    let warnings = findings.iter().filter(|f| f.severity == Severity::Warning).count();
    format!(
        "Audit complete: {} findings ({critical} critical, {warnings} warnings, {} info).",
        findings.len(),
        findings.len() - critical - warnings
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, FakeRunner, router_with};

    fn inputs() -> AuditInputs {
        AuditInputs {
            workspace: "/srv/workspace".to_string(),
            blocked_commands: vec!["sudo".to_string(), "rm -rf /".to_string()],
            approval_required: vec!["shell-command".to_string()],
            policy: SecurityPolicy::base(Utc::now()),
        }
    }

    fn agent(runner: FakeRunner, local: FakeBackend) -> SecurityProtocolAgent {
        let router = router_with(Arc::new(local), Arc::new(FakeBackend::cloud().unavailable()));
        SecurityProtocolAgent::new(
            Arc::new(runner),
            Arc::new(MemoryStore::open_in_memory().expect("store")),
            Arc::new(router),
        )
    }

    fn has(report: &AuditReport, check: &str, severity: Severity) -> bool {
        report
            .findings
            .iter()
            .any(|f| f.check_name == check && f.severity == severity)
    }

    #[tokio::test]
    async fn stopped_agent_skips_audit() {
        let agent = agent(FakeRunner::new(), FakeBackend::local());
        agent.set_state(AgentState::Stopped);
        let report = agent.run_audit("manual", &inputs()).await;
        assert_eq!(report.summary, "Agent is stopped. No audit performed.");
        assert!(report.findings.is_empty());
        assert!(agent.last_report().is_none());
    }

    #[tokio::test]
    async fn bare_host_yields_warnings_and_llm_summary() {
        let agent = agent(FakeRunner::new(), FakeBackend::local().replying("Mostly fine."));
        let report = agent.run_audit("manual", &inputs()).await;

        assert!(has(&report, "docker_containers", Severity::Warning));
        assert!(has(&report, "fail2ban", Severity::Warning));
        assert!(has(&report, "active_users", Severity::Info));
        assert_eq!(report.critical_count(), 0);
        assert_eq!(report.summary, "Mostly fine.");
        assert_eq!(agent.last_report().map(|r| r.id), Some(report.id.clone()));

        let logged = agent
            .store
            .recent_audit(1, Some("security_audit"), Utc::now())
            .expect("audit log");
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].user_id, "overseer:agent2");
    }

    #[tokio::test]
    async fn risky_host_is_flagged_critical() {
        let runner = FakeRunner::new()
            .with("awk -F: $3==0 {print $1} /etc/passwd", "root\ntoor")
            .with("docker ps --format {{.Names}}\t{{.Status}}", "web\tUp 2 hours")
            .with("docker inspect --format {{.HostConfig.Privileged}} web", "true")
            .with(
                "ss -tlnp",
                "State Recv-Q Send-Q Local\nLISTEN 0 128 0.0.0.0:8080 users:((\"app\"))",
            )
            .with(
                "bash -c history 50 2>/dev/null || cat ~/.bash_history 2>/dev/null | tail -50",
                "  12  sudo su",
            );
        let agent = agent(runner, FakeBackend::local().failing());
        let mut inputs = inputs();
        inputs.approval_required.clear();
        inputs.policy.replace_prompt("anything goes", "mallory", Utc::now());

        let report = agent.run_audit("manual", &inputs).await;
        for check in [
            "uid_zero_users",
            "privileged_container",
            "blocked_command_detected",
            "governance_config",
            "prompt_integrity",
        ] {
            assert!(has(&report, check, Severity::Critical), "missing {check}");
        }
        assert!(has(&report, "open_port", Severity::Warning));
        assert!(report.summary.starts_with("Audit complete: "));
        assert!(report.summary.contains("(5 critical,"));
    }

    #[test]
    fn fallback_summary_counts_each_severity() {
        let findings = vec![
            AuditFinding::new("a", Severity::Critical, "x"),
            AuditFinding::new("b", Severity::Warning, "y"),
            AuditFinding::new("c", Severity::Info, "z"),
            AuditFinding::new("d", Severity::Info, "z"),
        ];
        assert_eq!(
            fallback_summary(&findings),
            "Audit complete: 4 findings (1 critical, 1 warnings, 2 info)."
        );
    }
}
