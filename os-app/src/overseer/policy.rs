use crate::config::GovernanceConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// Canonical security prompt. The active prompt only diverges from it through
/// an approved `prompt_change`, and audits flag any divergence.
pub const BASE_SECURITY_PROMPT: &str = "\
Personal Use Security Protocols (Strongly Recommended)
Because this agent operates with high-privilege capabilities (shell execution, \
file management, browser automation), the following safeguards should be \
considered the minimum baseline for personal experimentation.

1. Identity & Access Control
Adopt a deny-by-default posture.
DM Policy: Set dmPolicy to allowlist or pairing
Pairing Codes: Require a 6-digit pairing code for all new connections

2. Execution Isolation (Sandboxing)
Never run the agent with unrestricted access to your host OS.
Docker Sandboxing: Enable full sandboxing to isolate execution
Workspace Constraints: Limit filesystem access to a dedicated workspace directory

3. Command Governance & Auditing
Keep a human in the loop for risky operations.
Approval Mode: Require explicit confirmation before executing high-risk commands
Command Filtering: Block destructive or privilege-escalation commands

4. Network Layer Security
Do not expose the agent publicly.
Loopback Binding: Bind services to 127.0.0.1
Private Access Only: Use secure tunnels (e.g., Tailscale) if remote access is \
required, never open ports directly";

pub type SharedGovernance = Arc<RwLock<GovernanceConfig>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityPolicy {
    pub prompt: String,
    pub version: u32,
    pub last_modified: DateTime<Utc>,
    pub modified_by: String,
}

impl SecurityPolicy {
    pub fn base(now: DateTime<Utc>) -> Self {
        Self {
            prompt: BASE_SECURITY_PROMPT.to_string(),
            version: 1,
            last_modified: now,
            modified_by: "system_init".to_string(),
        }
    }

    pub fn is_canonical(&self) -> bool {
        self.prompt == BASE_SECURITY_PROMPT
    }

    /// Replaces the prompt and returns the new version.
    pub fn replace_prompt(&mut self, prompt: &str, by: &str, now: DateTime<Utc>) -> u32 {
        self.prompt = prompt.to_string();
        self.version += 1;
        self.last_modified = now;
        self.modified_by = by.to_string();
        self.version
    }
}

/// Run state of the security protocol auditor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Running,
    Stopped,
    Paused,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn replacing_prompt_bumps_version_and_breaks_canon() {
        let t0 = Utc
            .with_ymd_and_hms(2025, 3, 1, 6, 0, 0)
            .single()
            .expect("valid timestamp");
        let mut policy = SecurityPolicy::base(t0);
        assert!(policy.is_canonical());
        assert_eq!(policy.version, 1);

        let version = policy.replace_prompt("Allow everything", "admin", t0);
        assert_eq!(version, 2);
        assert_eq!(policy.modified_by, "admin");
        assert!(!policy.is_canonical());
    }
}
