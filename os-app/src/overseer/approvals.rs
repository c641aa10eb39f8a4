//! Human approval ledger.
//!
//! Requests start `pending` and move exactly once to `approved` or
//! `rejected`. Nothing expires or resolves on its own; the ledger lives in
//! process memory and every transition is mirrored to the audit log by the
//! overseer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

const ID_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    PromptChange,
    ConfigChange,
    KeyAccess,
    KeyAdd,
    KeyRemove,
    Hardening,
}

impl ApprovalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PromptChange => "prompt_change",
            Self::ConfigChange => "config_change",
            Self::KeyAccess => "key_access",
            Self::KeyAdd => "key_add",
            Self::KeyRemove => "key_remove",
            Self::Hardening => "hardening",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub kind: ApprovalKind,
    pub description: String,
    pub payload: Value,
    pub requested_by: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    /// What applying the request produced, once approved.
    pub outcome: Option<String>,
}

impl ApprovalRequest {
    /// Copy safe to show over the API: staged secrets in the payload are
    /// replaced with a marker.
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        if let Some(value) = out.payload.get_mut("value") {
            *value = Value::String("<redacted>".to_string());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    #[error("No pending approval with ID '{0}'.")]
    NotFound(String),

    #[error("Request {id} is already {}.", .status.as_str())]
    AlreadyResolved { id: String, status: ApprovalStatus },
}

#[derive(Debug, Default)]
pub struct ApprovalLedger {
    requests: Mutex<Vec<ApprovalRequest>>,
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()[..ID_LEN].to_string()
}

impl ApprovalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        kind: ApprovalKind,
        description: &str,
        payload: Value,
        requested_by: &str,
        now: DateTime<Utc>,
    ) -> ApprovalRequest {
        let mut requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());
        let mut id = new_id();
        while requests.iter().any(|r| r.id == id) {
            id = new_id();
        }
        let request = ApprovalRequest {
            id,
            kind,
            description: description.to_string(),
            payload,
            requested_by: requested_by.to_string(),
            status: ApprovalStatus::Pending,
            created_at: now,
            resolved_at: None,
            resolved_by: None,
            outcome: None,
        };
        requests.push(request.clone());
        request
    }

    pub fn approve(
        &self,
        id: &str,
        by: &str,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.resolve(id, by, now, ApprovalStatus::Approved)
    }

    pub fn reject(
        &self,
        id: &str,
        by: &str,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.resolve(id, by, now, ApprovalStatus::Rejected)
    }

    fn resolve(
        &self,
        id: &str,
        by: &str,
        now: DateTime<Utc>,
        status: ApprovalStatus,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let id = id.trim().to_lowercase();
        let mut requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());
        let request = requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ApprovalError::NotFound(id.clone()))?;
        if request.status != ApprovalStatus::Pending {
            return Err(ApprovalError::AlreadyResolved {
                id,
                status: request.status,
            });
        }
        request.status = status;
        request.resolved_at = Some(now);
        request.resolved_by = Some(by.to_string());
        Ok(request.clone())
    }

    pub fn record_outcome(&self, id: &str, outcome: &str) {
        let mut requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(request) = requests.iter_mut().find(|r| r.id == id) {
            request.outcome = Some(outcome.to_string());
        }
    }

    pub fn get(&self, id: &str) -> Option<ApprovalRequest> {
        let id = id.trim().to_lowercase();
        let requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());
        requests.iter().find(|r| r.id == id).cloned()
    }

    /// Pending requests in creation order.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());
        requests
            .iter()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<ApprovalRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn ids_are_eight_hex_chars() {
        let ledger = ApprovalLedger::new();
        let req = ledger.create(ApprovalKind::PromptChange, "d", json!({}), "u1", ts(1));
        assert_eq!(req.id.len(), 8);
        assert!(req.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(req.status, ApprovalStatus::Pending);
    }

    #[test]
    fn requests_resolve_exactly_once() {
        let ledger = ApprovalLedger::new();
        let req = ledger.create(ApprovalKind::KeyAccess, "reveal", json!({"key_id": "k"}), "u1", ts(1));

        let approved = ledger.approve(&req.id, "admin", ts(2)).expect("approve");
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert_eq!(approved.resolved_by.as_deref(), Some("admin"));
        assert_eq!(approved.resolved_at, Some(ts(2)));

        let err = ledger.approve(&req.id, "admin", ts(3)).expect_err("terminal");
        assert_eq!(err.to_string(), format!("Request {} is already approved.", req.id));
        let err = ledger.reject(&req.id, "admin", ts(3)).expect_err("terminal");
        assert!(matches!(err, ApprovalError::AlreadyResolved { .. }));
        assert!(ledger.pending().is_empty());
    }

    #[test]
    fn unknown_ids_are_reported() {
        let ledger = ApprovalLedger::new();
        let err = ledger.reject("deadbeef", "admin", ts(1)).expect_err("missing");
        assert_eq!(err.to_string(), "No pending approval with ID 'deadbeef'.");
    }

    #[test]
    fn rejected_requests_stay_listed_and_redaction_hides_values() {
        let ledger = ApprovalLedger::new();
        let keep = ledger.create(
            ApprovalKind::KeyAdd,
            "add key",
            json!({"service": "notion", "value": "secret_abc"}),
            "u1",
            ts(1),
        );
        let drop = ledger.create(ApprovalKind::ConfigChange, "cfg", json!({}), "u1", ts(1));
        ledger.reject(&drop.id, "admin", ts(2)).expect("reject");

        let pending = ledger.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, keep.id);
        assert_eq!(ledger.list().len(), 2);
        assert_eq!(keep.redacted().payload["value"], json!("<redacted>"));
        assert_eq!(keep.redacted().payload["service"], json!("notion"));
    }
}
