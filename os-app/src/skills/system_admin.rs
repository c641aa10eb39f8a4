use super::{Skill, SkillContext, SkillResponse};
use anyhow::Result;
use async_trait::async_trait;
use os_tools::{CommandRunner, run_report};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIER: u8 = 3;

const DISK: &[&str] = &["df", "-h"];
const MEMORY: &[&str] = &["free", "-h"];
const CPU: &[&str] = &["top", "-bn1"];
const UPTIME: &[&str] = &["uptime"];
const DOCKER_PS: &[&str] = &[
    "docker",
    "ps",
    "--format",
    "table {{.Names}}\t{{.Status}}\t{{.Ports}}",
];
const DOCKER_STATS: &[&str] = &[
    "docker",
    "stats",
    "--no-stream",
    "--format",
    "table {{.Name}}\t{{.CPUPerc}}\t{{.MemUsage}}",
];
const PORTS: &[&str] = &["ss", "-tlnp"];
const SERVICES: &[&str] = &[
    "systemctl",
    "list-units",
    "--type=service",
    "--state=running",
    "--no-pager",
];

static TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:restart|stop|start|logs?)\s+(?:container\s+|service\s+)?(\w[\w.-]*)")
        .expect("valid target regex")
});

/// What a request resolved to.
#[derive(Debug, PartialEq, Eq)]
enum Plan {
    Run(Vec<String>),
    Denied(&'static str),
    Overview,
}

fn owned(argv: &[&str]) -> Plan {
    Plan::Run(argv.iter().map(|s| s.to_string()).collect())
}

fn has_word(text: &str, word: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|w| w == word)
}

fn extract_target(text: &str) -> Option<String> {
    TARGET.captures(text).map(|caps| caps[1].to_string())
}

fn lifecycle_verb(text: &str) -> &'static str {
    if has_word(text, "stop") {
        "stop"
    } else if has_word(text, "start") {
        "start"
    } else {
        "restart"
    }
}

/// Maps a request onto an allow-listed argv. Lifecycle verbs and container
/// logs need tier 3; everything else is read-only.
fn plan(text: &str, target: Option<&str>, tier: u8) -> Plan {
    let mentions = |words: &[&str]| words.iter().any(|w| text.contains(w));
    let target = target
        .map(str::to_string)
        .or_else(|| extract_target(text));

    if ["restart", "stop", "start"].iter().any(|w| has_word(text, w)) {
        if tier < WRITE_TIER {
            return Plan::Denied("This action requires tier 3 access. Ask an admin for help.");
        }
        let verb = lifecycle_verb(text);
        if mentions(&["docker", "container"]) {
            if let Some(name) = &target {
                return owned(&["docker", verb, name]);
            }
        }
        if text.contains("service") {
            if let Some(name) = &target {
                return owned(&["systemctl", verb, name]);
            }
        }
    }

    if text.contains("docker") && text.contains("log") {
        if tier < WRITE_TIER {
            return Plan::Denied("Docker logs require tier 3 access.");
        }
        return match &target {
            Some(name) => owned(&["docker", "logs", "--tail", "50", name]),
            None => owned(DOCKER_PS),
        };
    }

    if mentions(&["disk", "storage", "space", "df"]) {
        owned(DISK)
    } else if mentions(&["memory", "ram", "mem", "free"]) {
        owned(MEMORY)
    } else if mentions(&["cpu", "load", "top"]) {
        owned(CPU)
    } else if text.contains("uptime") {
        owned(UPTIME)
    } else if text.contains("docker") && mentions(&["stat", "resource"]) {
        owned(DOCKER_STATS)
    } else if mentions(&["docker", "container"]) {
        owned(DOCKER_PS)
    } else if mentions(&["port", "listen"]) {
        owned(PORTS)
    } else if mentions(&["service", "systemctl", "unit"]) {
        owned(SERVICES)
    } else {
        Plan::Overview
    }
}

/// Host monitoring through fixed commands.
pub struct SystemAdminSkill {
    runner: Arc<dyn CommandRunner>,
}

impl SystemAdminSkill {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn overview(&self) -> String {
        let mut checks: Vec<(&str, &[&str])> =
            vec![("Disk", DISK), ("Memory", MEMORY), ("Uptime", UPTIME)];
        if self.runner.exists("docker").await {
            checks.push(("Docker", DOCKER_PS));
        }
        let mut parts = Vec::with_capacity(checks.len());
        for (label, argv) in checks {
            let out = run_report(self.runner.as_ref(), argv, COMMAND_TIMEOUT).await;
            parts.push(format!("**{label}:**\n```\n{out}\n```"));
        }
        parts.join("\n")
    }
}

#[async_trait]
impl Skill for SystemAdminSkill {
    fn name(&self) -> &'static str {
        "system_admin"
    }

    fn description(&self) -> &'static str {
        "Server monitoring: disk, CPU, memory, Docker, services"
    }

    fn min_tier(&self) -> u8 {
        1
    }

    fn examples(&self) -> &'static [&'static str] {
        &[
            "check disk space",
            "docker status",
            "system health",
            "restart container nginx",
        ]
    }

    #[tracing::instrument(level = "info", skip_all, fields(tier = ctx.user_tier))]
    async fn execute(&self, ctx: &SkillContext) -> Result<SkillResponse> {
        let text = ctx.text().trim().to_lowercase();
        match plan(&text, ctx.matched.entity("target"), ctx.user_tier) {
            Plan::Denied(message) => Ok(SkillResponse::error(message)),
            Plan::Overview => Ok(SkillResponse::reply(self.overview().await)),
            Plan::Run(argv) => {
                let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
                tracing::info!(command = %argv.join(" "), "running system command");
                let out = run_report(self.runner.as_ref(), &argv, COMMAND_TIMEOUT).await;
                Ok(SkillResponse::reply(format!("```\n{out}\n```")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::classify;
    use crate::testing::FakeRunner;
    use os_channels::{Channel, InboundMessage};

    fn argv(plan: Plan) -> String {
        match plan {
            Plan::Run(argv) => argv.join(" "),
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[test]
    fn read_only_requests_map_to_safe_commands() {
        assert_eq!(argv(plan("check disk space", None, 1)), "df -h");
        assert_eq!(argv(plan("memory usage", None, 1)), "free -h");
        assert_eq!(argv(plan("docker stats please", None, 1)), DOCKER_STATS.join(" "));
        assert_eq!(argv(plan("any open port?", None, 1)), "ss -tlnp");
        assert_eq!(plan("system health", None, 1), Plan::Overview);
    }

    #[test]
    fn lifecycle_needs_tier_three() {
        assert!(matches!(
            plan("restart container nginx", None, 1),
            Plan::Denied(_)
        ));
        assert_eq!(
            argv(plan("restart container nginx", None, 3)),
            "docker restart nginx"
        );
        assert_eq!(
            argv(plan("stop service redis", Some("redis"), 5)),
            "systemctl stop redis"
        );
        assert_eq!(
            argv(plan("docker logs web", None, 3)),
            "docker logs --tail 50 web"
        );
        assert!(matches!(plan("docker logs web", None, 2), Plan::Denied(_)));
    }

    #[tokio::test]
    async fn overview_includes_docker_when_present() {
        let runner = Arc::new(
            FakeRunner::new()
                .with("df -h", "/dev/sda1 40G")
                .with("free -h", "Mem: 8G")
                .with("uptime", "up 3 days")
                .with(&DOCKER_PS.join(" "), "web Up"),
        );
        let skill = SystemAdminSkill::new(runner.clone());
        let text = "system status";
        let ctx = SkillContext {
            message: InboundMessage::text(Channel::Api, "u1", text),
            matched: classify(text, &[]),
            user_tier: 1,
            history: Vec::new(),
            memories: Vec::new(),
        };
        let out = skill.execute(&ctx).await.expect("execute");
        assert!(out.text.contains("**Disk:**\n```\n/dev/sda1 40G\n```"));
        assert!(out.text.contains("**Docker:**"));
        assert_eq!(runner.calls().len(), 4);
    }
}
