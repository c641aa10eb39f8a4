use super::{Skill, SkillContext, SkillResponse};
use crate::overseer::OverseerAgent;
use crate::overseer::approvals::{ApprovalKind, ApprovalStatus};
use anyhow::Result;
use async_trait::async_trait;
use os_tools::hardening::{self, HardeningCategory, HardeningPrecondition, HardeningStep};
use os_tools::{CommandRunner, run_text};
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

const SSHD_EFFECTIVE: &[&str] = &["sshd", "-T"];
const LISTENING: &[&str] = &["ss", "-tlnp"];
const UFW_VERBOSE: &[&str] = &["ufw", "status", "verbose"];
const FAIL2BAN: &[&str] = &["fail2ban-client", "status"];
const FAIL2BAN_SSHD: &[&str] = &["fail2ban-client", "status", "sshd"];
const ROOT_KEYS: &[&str] = &["test", "-s", "/root/.ssh/authorized_keys"];
const USER_KEYS: &[&str] = &["sh", "-c", "ls /home/*/.ssh/authorized_keys 2>/dev/null"];

const TUNNEL_KEYS: &[&str] = &["gatewayports", "allowtcpforwarding", "allowagentforwarding"];
const VERIFY_KEYS: &[&str] = &[
    "permitrootlogin",
    "passwordauthentication",
    "pubkeyauthentication",
    "ciphers",
    "clientaliveinterval",
    "clientalivecountmax",
    "maxauthtries",
];

const PROPOSAL_FOOTER: &str = "Review with: `overseer pending`\n\
    Approve with: `overseer approve <id>` (approving applies the step)\n\
    Check the result with: `ssh hardening apply <id>`";

static APPLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bapply\s+(\S+)").expect("valid apply regex"));

fn missing(output: &str) -> bool {
    output.to_lowercase().contains("command not found")
}

fn fenced(body: &str) -> String {
    format!("```\n{body}\n```")
}

/// Audits sshd, ufw and fail2ban and turns the hardening catalog into
/// approval requests. Nothing here changes the host directly.
pub struct SshHardeningSkill {
    runner: Arc<dyn CommandRunner>,
    overseer: Arc<OverseerAgent>,
}

impl SshHardeningSkill {
    pub fn new(runner: Arc<dyn CommandRunner>, overseer: Arc<OverseerAgent>) -> Self {
        Self { runner, overseer }
    }

    async fn run(&self, argv: &[&str]) -> String {
        run_text(self.runner.as_ref(), argv, COMMAND_TIMEOUT).await
    }

    async fn audit(&self) -> String {
        let mut parts = vec!["## SSH & Firewall Security Audit\n".to_string()];

        let sshd = self.run(SSHD_EFFECTIVE).await;
        if !missing(&sshd) {
            parts.push("### SSH Configuration".to_string());
            let issues = hardening::analyze_sshd(&sshd);
            if issues.is_empty() {
                parts.push("SSH configuration looks good.".to_string());
            } else {
                parts.push("**Issues found:**".to_string());
                parts.extend(issues.iter().map(|issue| format!("- {issue}")));
            }
            parts.push(String::new());
        }

        parts.push("### Listening Ports".to_string());
        parts.push(format!("{}\n", fenced(&self.run(LISTENING).await)));

        let ufw = self.run(UFW_VERBOSE).await;
        parts.push("### Firewall (UFW)".to_string());
        if ufw.to_lowercase().contains("inactive") || missing(&ufw) {
            parts.push("**UFW is not active.** Run `harden firewall` to set up.".to_string());
        } else {
            parts.push(fenced(&ufw));
        }
        parts.push(String::new());

        let f2b = self.run(FAIL2BAN).await;
        parts.push("### Fail2ban".to_string());
        if missing(&f2b) || f2b.to_lowercase().contains("error") {
            parts.push("Fail2ban is not installed or not running.".to_string());
        } else {
            parts.push(fenced(&f2b));
        }

        parts.push(
            "\n---\nUse `harden ssh` or `harden firewall` to create hardening proposals."
                .to_string(),
        );
        parts.join("\n")
    }

    async fn fail2ban(&self) -> String {
        let out = self.run(FAIL2BAN).await;
        if missing(&out) || out.to_lowercase().contains("error") {
            return "Fail2ban is not installed or not running.".to_string();
        }
        let jail = self.run(FAIL2BAN_SSHD).await;
        format!(
            "**Fail2ban Status:**\n{}\n\n**SSH Jail:**\n{}",
            fenced(&out),
            fenced(&jail)
        )
    }

    async fn tunnels(&self) -> String {
        let mut parts = vec!["## SSH Tunnel Security\n".to_string()];
        let sshd = self.run(SSHD_EFFECTIVE).await;
        if !missing(&sshd) {
            for line in hardening::select_sshd_lines(&sshd, TUNNEL_KEYS) {
                parts.push(format!("- `{line}`"));
            }
        }

        let listening = self.run(LISTENING).await;
        let ssh_lines: Vec<&str> = listening
            .lines()
            .filter(|l| l.to_lowercase().contains("ssh"))
            .collect();
        if ssh_lines.is_empty() {
            parts.push("\nNo active SSH tunnels detected.".to_string());
        } else {
            parts.push("\n### Active SSH Tunnels".to_string());
            parts.push(fenced(&ssh_lines.join("\n")));
        }
        parts.join("\n")
    }

    async fn verify(&self) -> String {
        let mut parts = vec!["## Post-Hardening Verification\n".to_string()];
        let sshd = self.run(SSHD_EFFECTIVE).await;
        if !missing(&sshd) {
            parts.push("### SSH Config".to_string());
            for line in hardening::select_sshd_lines(&sshd, VERIFY_KEYS) {
                parts.push(format!("- `{line}`"));
            }
        }
        parts.push("\n### Firewall".to_string());
        parts.push(fenced(&self.run(UFW_VERBOSE).await));
        parts.push("\n### Fail2ban (SSH)".to_string());
        parts.push(fenced(&self.run(FAIL2BAN_SSHD).await));
        parts.join("\n")
    }

    /// Key-only auth is safe once root or any home directory has keys.
    async fn has_authorized_keys(&self) -> bool {
        let root_keys = matches!(
            self.runner.run(ROOT_KEYS, COMMAND_TIMEOUT).await,
            Ok(output) if output.success()
        );
        if root_keys {
            return true;
        }
        let user_keys = self.run(USER_KEYS).await;
        let user_keys = user_keys.trim();
        !user_keys.is_empty()
            && user_keys != "(no output)"
            && !missing(user_keys)
            && !user_keys.starts_with("Blocked by command policy")
    }

    fn propose(&self, step: &HardeningStep, label: &str, sender: &str) -> String {
        let request = self.overseer.create_approval(
            ApprovalKind::Hardening,
            &format!("[{label}] {}", step.description),
            json!({
                "step_id": step.id,
                "command": step.command,
                "category": step.category.as_str(),
            }),
            sender,
        );
        format!("- `{}`: {}", request.id, step.description)
    }

    async fn propose_ssh(&self, sender: &str) -> String {
        let has_keys = self.has_authorized_keys().await;
        let mut proposals = Vec::new();
        for step in hardening::steps_in(HardeningCategory::Ssh) {
            if step.precondition == Some(HardeningPrecondition::AuthorizedKeys) && !has_keys {
                proposals.push(format!(
                    "- **SKIPPED** `{}`: {}. No authorized_keys found, add SSH keys first.",
                    step.id, step.description
                ));
                continue;
            }
            proposals.push(self.propose(step, "SSH Hardening", sender));
        }
        format!(
            "## SSH Hardening Proposals\n\n\
             The following changes require your approval:\n\n{}\n\n{PROPOSAL_FOOTER}",
            proposals.join("\n")
        )
    }

    fn propose_firewall(&self, sender: &str) -> String {
        let proposals: Vec<String> = hardening::steps_in(HardeningCategory::Firewall)
            .map(|step| self.propose(step, "Firewall Hardening", sender))
            .collect();
        format!(
            "## Firewall Hardening Proposals\n\n\
             The following changes require your approval:\n\n{}\n\n\
             **Important:** SSH is allowed before enabling UFW to prevent lockout.\n\n{PROPOSAL_FOOTER}",
            proposals.join("\n")
        )
    }

    /// Reports what happened to a hardening request. Approval is what runs
    /// the step, so this never executes anything itself.
    fn apply_status(&self, id: &str) -> SkillResponse {
        let Some(request) = self.overseer.approvals().get(id) else {
            return SkillResponse::error(format!("No approval request found with ID `{id}`."));
        };
        if request.kind != ApprovalKind::Hardening {
            return SkillResponse::error(format!(
                "Request `{}` is a {} request, not a hardening step.",
                request.id,
                request.kind.as_str()
            ));
        }
        let step_id = request
            .payload
            .get("step_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        match request.status {
            ApprovalStatus::Pending => SkillResponse::error(format!(
                "Request `{id}` is **pending**, not approved. \
                 Approve first with: `overseer approve {id}`",
                id = request.id
            )),
            ApprovalStatus::Rejected => SkillResponse::error(format!(
                "Request `{}` was **rejected**. `{step_id}` was not applied.",
                request.id
            )),
            ApprovalStatus::Approved => SkillResponse::reply(format!(
                "## Applied: {step_id}\n\n{}",
                request.outcome.as_deref().unwrap_or("Still running.")
            )),
        }
    }
}

#[async_trait]
impl Skill for SshHardeningSkill {
    fn name(&self) -> &'static str {
        "ssh_hardening"
    }

    fn description(&self) -> &'static str {
        "SSH & firewall hardening: audit config, harden SSH/firewall, \
         manage tunnel security with overseer approval"
    }

    fn min_tier(&self) -> u8 {
        2
    }

    fn examples(&self) -> &'static [&'static str] {
        &[
            "ssh security audit",
            "harden ssh",
            "firewall hardening",
            "ssh tunnel check",
            "ssh hardening apply <id>",
        ]
    }

    #[tracing::instrument(level = "info", skip_all, fields(sender_id = %ctx.sender()))]
    async fn execute(&self, ctx: &SkillContext) -> Result<SkillResponse> {
        let text = ctx.text().trim().to_lowercase();
        let sender = ctx.sender();
        let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

        if let Some(caps) = APPLY.captures(&text) {
            return Ok(self.apply_status(&caps[1]));
        }
        let out = if has(&["audit", "check", "status"]) {
            self.audit().await
        } else if has(&["firewall", "ufw"]) {
            self.propose_firewall(sender)
        } else if text.contains("fail2ban") {
            self.fail2ban().await
        } else if text.contains("tunnel") {
            self.tunnels().await
        } else if has(&["harden", "secure", "ssh config", "sshd config"]) {
            self.propose_ssh(sender).await
        } else if text.contains("verify") {
            self.verify().await
        } else {
            self.audit().await
        };
        Ok(SkillResponse::reply(out))
    }
}
