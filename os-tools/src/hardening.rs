//! SSH and firewall hardening catalog.
//!
//! Steps are fixed argv commands. Approvals only ever reference a step by id,
//! so nothing outside this table can be executed through the hardening flow.

use serde::Serialize;
use std::collections::HashMap;

pub const SSHD_CONFIG_PATH: &str = "/etc/ssh/sshd_config";
pub const SSHD_CONFIG_BACKUP_PATH: &str = "/etc/ssh/sshd_config.bak";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HardeningCategory {
    Ssh,
    Firewall,
}

impl HardeningCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Firewall => "firewall",
        }
    }
}

/// Precondition checked before a step is proposed or applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HardeningPrecondition {
    /// At least one `authorized_keys` file exists, so key-only auth cannot
    /// lock everyone out.
    AuthorizedKeys,
    /// The firewall already admits SSH.
    UfwAllowsSsh,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HardeningStep {
    pub id: &'static str,
    pub description: &'static str,
    pub command: &'static [&'static str],
    pub category: HardeningCategory,
    pub precondition: Option<HardeningPrecondition>,
}

impl HardeningStep {
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    /// sshd_config edits are backed up first; restarting the daemon is not an edit.
    pub fn edits_sshd_config(&self) -> bool {
        self.category == HardeningCategory::Ssh && self.command.contains(&SSHD_CONFIG_PATH)
    }
}

pub const HARDENING_STEPS: &[HardeningStep] = &[
    HardeningStep {
        id: "disable_root",
        description: "Disable root login",
        command: &[
            "sed",
            "-i",
            r"s/^#\?PermitRootLogin.*/PermitRootLogin no/",
            SSHD_CONFIG_PATH,
        ],
        category: HardeningCategory::Ssh,
        precondition: None,
    },
    HardeningStep {
        id: "disable_password_auth",
        description: "Disable password authentication (key-only)",
        command: &[
            "sed",
            "-i",
            r"s/^#\?PasswordAuthentication.*/PasswordAuthentication no/",
            SSHD_CONFIG_PATH,
        ],
        category: HardeningCategory::Ssh,
        precondition: Some(HardeningPrecondition::AuthorizedKeys),
    },
    HardeningStep {
        id: "strong_ciphers",
        description: "Set strong ciphers (chacha20-poly1305, aes256-gcm, aes128-gcm)",
        command: &[
            "sed",
            "-i",
            "/^Ciphers/d; /^#Ciphers/a Ciphers chacha20-poly1305@openssh.com,aes256-gcm@openssh.com,aes128-gcm@openssh.com",
            SSHD_CONFIG_PATH,
        ],
        category: HardeningCategory::Ssh,
        precondition: None,
    },
    HardeningStep {
        id: "idle_timeout",
        description: "Set idle timeout (300s interval, max 2 missed)",
        command: &[
            "sed",
            "-i",
            r"s/^#\?ClientAliveInterval.*/ClientAliveInterval 300/; s/^#\?ClientAliveCountMax.*/ClientAliveCountMax 2/",
            SSHD_CONFIG_PATH,
        ],
        category: HardeningCategory::Ssh,
        precondition: None,
    },
    HardeningStep {
        id: "max_auth_tries",
        description: "Limit auth attempts to 3",
        command: &[
            "sed",
            "-i",
            r"s/^#\?MaxAuthTries.*/MaxAuthTries 3/",
            SSHD_CONFIG_PATH,
        ],
        category: HardeningCategory::Ssh,
        precondition: None,
    },
    HardeningStep {
        id: "restart_sshd",
        description: "Restart SSH daemon to apply changes",
        command: &["systemctl", "restart", "sshd"],
        category: HardeningCategory::Ssh,
        precondition: None,
    },
    HardeningStep {
        id: "ufw_default_deny",
        description: "Set UFW default deny incoming",
        command: &["ufw", "default", "deny", "incoming"],
        category: HardeningCategory::Firewall,
        precondition: None,
    },
    HardeningStep {
        id: "ufw_allow_ssh",
        description: "Allow SSH through firewall",
        command: &["ufw", "allow", "ssh"],
        category: HardeningCategory::Firewall,
        precondition: None,
    },
    HardeningStep {
        id: "ufw_limit_ssh",
        description: "Rate-limit SSH connections (6/30s per IP)",
        command: &["ufw", "limit", "ssh"],
        category: HardeningCategory::Firewall,
        precondition: None,
    },
    HardeningStep {
        id: "ufw_enable",
        description: "Enable UFW firewall",
        command: &["ufw", "--force", "enable"],
        category: HardeningCategory::Firewall,
        precondition: Some(HardeningPrecondition::UfwAllowsSsh),
    },
];

pub fn find_step(id: &str) -> Option<&'static HardeningStep> {
    HARDENING_STEPS.iter().find(|step| step.id == id)
}

pub fn steps_in(category: HardeningCategory) -> impl Iterator<Item = &'static HardeningStep> {
    HARDENING_STEPS
        .iter()
        .filter(move |step| step.category == category)
}

/// Lockout guard for enabling the firewall.
pub fn ufw_allows_ssh(ufw_status: &str) -> bool {
    ufw_status.contains("22") || ufw_status.to_lowercase().contains("ssh")
}

/// `sshd -T` prints `key value` lines with lowercase keys.
pub fn parse_sshd_settings(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(2, char::is_whitespace);
            let key = parts.next()?.trim();
            let value = parts.next()?.trim();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some((key.to_lowercase(), value.to_string()))
        })
        .collect()
}

/// Common sshd misconfigurations, as human-readable issue lines.
pub fn analyze_sshd(output: &str) -> Vec<String> {
    let config = parse_sshd_settings(output);
    let get = |key: &str| config.get(key).map(String::as_str);
    let mut issues = Vec::new();

    if get("permitrootlogin") != Some("no") {
        issues.push("Root login is enabled: should be `no`".to_string());
    }
    if get("passwordauthentication") != Some("no") {
        issues.push("Password authentication is enabled: consider key-only".to_string());
    }
    if get("pubkeyauthentication") != Some("yes") {
        issues.push("Public key authentication is not enabled".to_string());
    }
    if !matches!(get("maxauthtries").unwrap_or("6"), "1" | "2" | "3") {
        issues.push(format!(
            "MaxAuthTries is {}: recommend 3",
            get("maxauthtries").unwrap_or("unset")
        ));
    }
    if get("clientaliveinterval").unwrap_or("0") == "0" {
        issues.push("No idle timeout configured (ClientAliveInterval is 0)".to_string());
    }
    if get("x11forwarding") == Some("yes") {
        issues.push("X11 forwarding is enabled: disable if not needed".to_string());
    }
    if get("allowagentforwarding") == Some("yes") {
        issues.push("Agent forwarding is enabled: disable if not needed".to_string());
    }

    issues
}

/// `sshd -T` lines for the given keys, in key order.
pub fn select_sshd_lines<'a>(output: &'a str, keys: &[&str]) -> Vec<&'a str> {
    let mut out = Vec::new();
    for key in keys {
        for line in output.lines() {
            let line = line.trim();
            if line.starts_with(key) {
                out.push(line);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const HARDENED: &str = "permitrootlogin no\npasswordauthentication no\npubkeyauthentication yes\nmaxauthtries 3\nclientaliveinterval 300\nx11forwarding no\n";

    #[test]
    fn hardened_config_has_no_issues() {
        assert!(analyze_sshd(HARDENED).is_empty());
    }

    #[test]
    fn defaults_produce_expected_issues() {
        let issues = analyze_sshd("permitrootlogin yes\nx11forwarding yes\nallowagentforwarding yes\n");
        assert_eq!(issues.len(), 7, "{issues:#?}");
        assert_eq!(issues[0], "Root login is enabled: should be `no`");
        assert_eq!(issues[3], "MaxAuthTries is unset: recommend 3");
    }

    #[test]
    fn step_ids_are_unique_and_categorized() {
        let mut ids: Vec<&str> = HARDENING_STEPS.iter().map(|s| s.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), HARDENING_STEPS.len());
        assert_eq!(steps_in(HardeningCategory::Ssh).count(), 6);
        assert_eq!(steps_in(HardeningCategory::Firewall).count(), 4);
    }

    #[test]
    fn only_config_edits_need_backup() {
        assert!(find_step("disable_root").expect("step").edits_sshd_config());
        assert!(!find_step("restart_sshd").expect("step").edits_sshd_config());
        assert!(!find_step("ufw_enable").expect("step").edits_sshd_config());
        assert!(find_step("rm_everything").is_none());
    }

    #[test]
    fn ufw_guard_looks_for_ssh_rules() {
        assert!(ufw_allows_ssh("22/tcp ALLOW Anywhere"));
        assert!(ufw_allows_ssh("OpenSSH ALLOW Anywhere"));
        assert!(!ufw_allows_ssh("Status: inactive"));
    }

    #[test]
    fn select_lines_follows_key_order() {
        let lines = select_sshd_lines(HARDENED, &["maxauthtries", "permitrootlogin"]);
        assert_eq!(lines, vec!["maxauthtries 3", "permitrootlogin no"]);
    }
}
