use super::{Skill, SkillContext, SkillResponse};
use anyhow::Result;
use async_trait::async_trait;
use os_tools::{CommandRunner, run_text};
use std::sync::Arc;
use std::time::Duration;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

const LISTENING: &[&str] = &["ss", "-tlnp"];
const CONNECTIONS: &[&str] = &["ss", "-tunp"];
const FAIL2BAN: &[&str] = &["fail2ban-client", "status"];
const SSH_JOURNAL: &[&str] = &["journalctl", "-u", "ssh", "-n", "20", "--no-pager", "-o", "short"];
const AUTH_LOG: &[&str] = &["tail", "-20", "/var/log/auth.log"];

fn fenced(body: &str) -> String {
    format!("```\n{body}\n```")
}

fn fail2ban_missing(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("command not found") || lower.contains("error")
}

/// Keeps the header plus established sessions; `None` when only the header
/// (or nothing) is left.
fn established_lines(output: &str) -> Option<String> {
    let lines: Vec<&str> = output
        .lines()
        .filter(|line| line.contains("ESTAB") || line.starts_with("Netid"))
        .collect();
    (lines.len() > 1).then(|| lines.join("\n"))
}

/// Read-only view of ports, connections, fail2ban and SSH logins.
pub struct SecurityMonitorSkill {
    runner: Arc<dyn CommandRunner>,
}

impl SecurityMonitorSkill {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn run(&self, argv: &[&str]) -> String {
        run_text(self.runner.as_ref(), argv, COMMAND_TIMEOUT).await
    }

    async fn open_ports(&self) -> String {
        format!("**Open Ports:**\n{}", fenced(&self.run(LISTENING).await))
    }

    async fn fail2ban(&self) -> String {
        let out = self.run(FAIL2BAN).await;
        if fail2ban_missing(&out) {
            "fail2ban is not installed or not running.".to_string()
        } else {
            format!("**Fail2Ban:**\n{}", fenced(&out))
        }
    }

    async fn connections(&self) -> String {
        match established_lines(&self.run(CONNECTIONS).await) {
            Some(lines) => format!("**Active Connections:**\n{}", fenced(&lines)),
            None => "No established external connections.".to_string(),
        }
    }

    async fn recent_logins(&self) -> String {
        let mut out = self.run(SSH_JOURNAL).await;
        if out.trim().is_empty() || out.contains("No entries") || out == "(no output)" {
            out = self.run(AUTH_LOG).await;
        }
        format!("**Recent Auth:**\n{}", fenced(&out))
    }

    async fn full_report(&self) -> String {
        [
            self.open_ports().await,
            self.connections().await,
            self.fail2ban().await,
            self.recent_logins().await,
        ]
        .join("\n\n")
    }
}

#[async_trait]
impl Skill for SecurityMonitorSkill {
    fn name(&self) -> &'static str {
        "security_monitor"
    }

    fn description(&self) -> &'static str {
        "Security monitoring: open ports, connections, fail2ban, SSH logins"
    }

    fn min_tier(&self) -> u8 {
        2
    }

    fn examples(&self) -> &'static [&'static str] {
        &[
            "security check",
            "open ports",
            "fail2ban status",
            "suspicious activity",
        ]
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, ctx: &SkillContext) -> Result<SkillResponse> {
        let text = ctx.text().to_lowercase();
        let out = if text.contains("port") {
            self.open_ports().await
        } else if text.contains("fail2ban") {
            self.fail2ban().await
        } else if text.contains("connection") || text.contains("suspicious") {
            self.connections().await
        } else if text.contains("login") {
            self.recent_logins().await
        } else {
            self.full_report().await
        };
        Ok(SkillResponse::reply(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::SkillMatch;
    use crate::testing::FakeRunner;
    use os_channels::{Channel, InboundMessage};

    fn ctx(text: &str) -> SkillContext {
        SkillContext {
            message: InboundMessage::text(Channel::Telegram, "admin", text),
            matched: SkillMatch::new("security_monitor", 0.95),
            user_tier: 2,
            history: Vec::new(),
            memories: Vec::new(),
        }
    }

    const SS_TUNP: &str = "Netid State Recv-Q Send-Q Local Peer\n\
                           tcp ESTAB 0 0 10.0.0.2:22 203.0.113.9:51234\n\
                           udp UNCONN 0 0 0.0.0.0:68 0.0.0.0:*";

    #[test]
    fn established_filter_keeps_header_and_sessions() {
        let lines = established_lines(SS_TUNP).expect("one session");
        assert_eq!(lines.lines().count(), 2);
        assert!(!lines.contains("UNCONN"));
        assert!(established_lines("Netid State\n").is_none());
    }

    #[tokio::test]
    async fn missing_fail2ban_is_reported_plainly() {
        let skill = SecurityMonitorSkill::new(Arc::new(FakeRunner::new()));
        let out = skill.execute(&ctx("fail2ban status")).await.expect("execute");
        assert_eq!(out.text, "fail2ban is not installed or not running.");
    }

    #[tokio::test]
    async fn login_history_falls_back_to_auth_log() {
        let runner = Arc::new(
            FakeRunner::new()
                .with(&SSH_JOURNAL.join(" "), "-- No entries --")
                .with(&AUTH_LOG.join(" "), "Accepted publickey for root"),
        );
        let skill = SecurityMonitorSkill::new(runner.clone());
        let out = skill.execute(&ctx("recent logins")).await.expect("execute");
        assert!(out.text.contains("Accepted publickey for root"));
        assert!(runner.ran(&AUTH_LOG.join(" ")));
    }

    #[tokio::test]
    async fn full_report_has_every_section() {
        let runner = Arc::new(
            FakeRunner::new()
                .with("ss -tlnp", "LISTEN 0 128 0.0.0.0:22")
                .with("ss -tunp", SS_TUNP)
                .with("fail2ban-client status", "Number of jail: 1")
                .with(&SSH_JOURNAL.join(" "), "sshd: session opened"),
        );
        let skill = SecurityMonitorSkill::new(runner);
        let out = skill.execute(&ctx("security check")).await.expect("execute");
        for section in ["**Open Ports:**", "**Active Connections:**", "**Fail2Ban:**", "**Recent Auth:**"] {
            assert!(out.text.contains(section), "missing {section}: {}", out.text);
        }
    }
}
