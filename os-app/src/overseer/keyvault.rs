//! In-memory registry of API keys.
//!
//! Values are only ever shown masked. Plaintext leaves the vault through
//! [`KeyVault::reveal`], which the overseer calls after a `key_access`
//! request is approved.

use crate::store::MemoryStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Services recognized at startup and the environment variable each is read from.
pub const KNOWN_KEYS: &[(&str, &str)] = &[
    ("notion", "NOTION_TOKEN"),
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("telegram", "TELEGRAM_BOT_TOKEN"),
    ("home_assistant", "HOME_ASSISTANT_TOKEN"),
    ("search_api", "SEARCH_API_KEY"),
    ("notion_mcp", "NOTION_API_TOKEN"),
];

/// Template values shipped in example env files.
const PLACEHOLDERS: &[&str] = &["secret_...", "sk-ant-...", "123456:ABC-DEF..."];

pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{tail}", "*".repeat(chars.len() - 4))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyEntry {
    pub key_id: String,
    pub service: String,
    pub env_var: String,
    pub masked_value: String,
    pub added_at: DateTime<Utc>,
    pub last_accessed: Option<DateTime<Utc>>,
    pub access_count: u32,
}

/// What a key vault command asks for. None of these reveal anything by
/// themselves; the overseer turns them into approval requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultCommand {
    List,
    Reveal { key_id: String, service: String, masked: String },
    Add { service: String, env_var: String, value: String },
    AddUsage,
    Remove { key_id: String },
    RemoveUsage,
    Help,
}

#[derive(Debug, Default)]
struct VaultState {
    entries: Vec<KeyEntry>,
    secrets: HashMap<String, String>,
}

impl VaultState {
    fn insert(&mut self, service: &str, env_var: &str, value: &str, now: DateTime<Utc>) -> KeyEntry {
        let key_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let entry = KeyEntry {
            key_id: key_id.clone(),
            service: service.to_string(),
            env_var: env_var.to_string(),
            masked_value: mask(value),
            added_at: now,
            last_accessed: None,
            access_count: 0,
        };
        self.entries.push(entry.clone());
        self.secrets.insert(key_id, value.to_string());
        entry
    }
}

pub struct KeyVault {
    store: Arc<MemoryStore>,
    state: Mutex<VaultState>,
}

impl KeyVault {
    pub fn empty(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            state: Mutex::new(VaultState::default()),
        }
    }

    /// Registers every known key present in `env`, skipping blanks and
    /// template placeholders.
    pub fn from_env<F>(store: Arc<MemoryStore>, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let vault = Self::empty(store);
        let now = Utc::now();
        {
            let mut state = vault.state.lock().unwrap_or_else(|p| p.into_inner());
            for (service, env_var) in KNOWN_KEYS {
                let Some(value) = env(env_var) else { continue };
                let value = value.trim();
                if value.is_empty() || PLACEHOLDERS.contains(&value) {
                    continue;
                }
                state.insert(service, env_var, value, now);
                tracing::info!(service, env_var, "key vault loaded key");
            }
        }
        vault
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entries
            .len()
    }

    pub fn list(&self) -> Vec<KeyEntry> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entries
            .clone()
    }

    pub fn find_by_service(&self, service: &str) -> Option<KeyEntry> {
        let service = service.trim().to_lowercase();
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state
            .entries
            .iter()
            .find(|e| e.service.to_lowercase() == service)
            .cloned()
    }

    pub fn get(&self, key_id: &str) -> Option<KeyEntry> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.entries.iter().find(|e| e.key_id == key_id).cloned()
    }

    /// Plaintext value. Only call after a `key_access` approval.
    pub fn reveal(&self, key_id: &str, approver: &str, now: DateTime<Utc>) -> Option<String> {
        let (value, entry) = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let value = state.secrets.get(key_id).cloned()?;
            let entry = state.entries.iter_mut().find(|e| e.key_id == key_id)?;
            entry.access_count += 1;
            entry.last_accessed = Some(now);
            (value, entry.clone())
        };
        self.audit(approver, "keyvault_reveal", &entry, now);
        Some(value)
    }

    pub fn add(
        &self,
        service: &str,
        env_var: &str,
        value: &str,
        added_by: &str,
        now: DateTime<Utc>,
    ) -> KeyEntry {
        let entry = self
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(service, env_var, value, now);
        self.audit(added_by, "keyvault_add", &entry, now);
        entry
    }

    pub fn remove(&self, key_id: &str, removed_by: &str, now: DateTime<Utc>) -> bool {
        let removed = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.secrets.remove(key_id);
            let idx = state.entries.iter().position(|e| e.key_id == key_id);
            idx.map(|i| state.entries.remove(i))
        };
        match removed {
            Some(entry) => {
                self.audit(removed_by, "keyvault_remove", &entry, now);
                true
            }
            None => false,
        }
    }

    fn audit(&self, user: &str, action: &str, entry: &KeyEntry, now: DateTime<Utc>) {
        let detail = json!({
            "key_id": entry.key_id,
            "service": entry.service,
            "env_var": entry.env_var,
        })
        .to_string();
        if let Err(error) = self.store.log_audit(user, action, Some(&detail), 5, now) {
            tracing::warn!(%error, action, "failed to audit key vault action");
        }
    }

    pub fn format_key_list(&self) -> String {
        let entries = self.list();
        if entries.is_empty() {
            return "KeyVault is empty. No API keys registered.".to_string();
        }
        let mut lines = vec![format!("**KeyVault** ({} key(s) registered)\n", entries.len())];
        for entry in &entries {
            let accessed = match entry.last_accessed {
                Some(at) => format!("accessed {}x, last: {}", entry.access_count, at.to_rfc3339()),
                None => "never accessed".to_string(),
            };
            lines.push(format!(
                "  - **{}** [{}]\n    env: `{}` | value: `{}`\n    {accessed}",
                entry.service, entry.key_id, entry.env_var, entry.masked_value
            ));
        }
        lines.join("\n")
    }

    /// Works out what a key vault message asks for. Word positions come from
    /// the original text so added values keep their case.
    pub fn parse_command(&self, text: &str) -> VaultCommand {
        let lower = text.to_lowercase();
        let words: Vec<&str> = text.split_whitespace().collect();
        let after = |verb: &str| -> Vec<&str> {
            words
                .iter()
                .position(|w| w.eq_ignore_ascii_case(verb))
                .map(|i| words[i + 1..].to_vec())
                .unwrap_or_default()
        };

        if lower.contains("add ") {
            return match after("add").as_slice() {
                [service, env_var, value, ..] => VaultCommand::Add {
                    service: service.to_lowercase(),
                    env_var: env_var.to_string(),
                    value: value.to_string(),
                },
                _ => VaultCommand::AddUsage,
            };
        }
        if lower.contains("remove ") || lower.contains("delete ") {
            let mut rest = after("remove");
            if rest.is_empty() {
                rest = after("delete");
            }
            return match rest.first() {
                Some(key_id) => VaultCommand::Remove {
                    key_id: key_id.to_lowercase(),
                },
                None => VaultCommand::RemoveUsage,
            };
        }
        if ["list", "keys", "inventory"].iter().any(|w| lower.contains(w)) {
            return VaultCommand::List;
        }

        for (service, _) in KNOWN_KEYS {
            if lower.contains(&service.replace('_', " ")) || lower.contains(service) {
                if let Some(entry) = self.find_by_service(service) {
                    return VaultCommand::Reveal {
                        key_id: entry.key_id,
                        service: entry.service,
                        masked: entry.masked_value,
                    };
                }
            }
        }

        if ["get ", "show ", "reveal "].iter().any(|w| lower.contains(w)) {
            for word in &words {
                let candidate = word.trim().to_lowercase();
                if candidate.len() != 8 {
                    continue;
                }
                if let Some(entry) = self.get(&candidate) {
                    return VaultCommand::Reveal {
                        key_id: entry.key_id,
                        service: entry.service,
                        masked: entry.masked_value,
                    };
                }
            }
        }

        VaultCommand::Help
    }
}
