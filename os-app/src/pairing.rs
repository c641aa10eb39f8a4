//! DM policy gate and pairing-code lifecycle for external channels.
//!
//! `open` admits everyone, `allowlist` admits `security.allow_from`, and
//! `pairing` additionally lets unknown senders request access with a 6-digit
//! code that an admin approves via `/pair approve <code>`.

use crate::access::SharedSecurity;
use crate::config::DmPolicy;
use chrono::{DateTime, Duration, Utc};
use os_channels::Channel;
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

const PAIRING_CODE_LEN: usize = 6;
const DEFAULT_PENDING_REQUEST_CAP: usize = 3;
const DEFAULT_REQUEST_TTL_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingRequestStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl PairingRequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    pub channel: Channel,
    pub sender_id: String,
    pub code: String,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: PairingRequestStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PairingRequest {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    /// A pairing request exists for this sender; `created` is false when an
    /// earlier code is being repeated.
    PairingRequired { code: String, created: bool },
    /// Too many outstanding pairing requests.
    PairingBusy,
    Denied,
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Reply sent to a sender that did not pass the gate.
    pub fn reply(&self) -> Option<String> {
        match self {
            Self::Allowed | Self::Denied => None,
            Self::PairingRequired { code, .. } => Some(format!(
                "This assistant is private. Your pairing code is {code}. \
                 Ask the owner to approve it, then message again."
            )),
            Self::PairingBusy => Some(
                "Too many pairing requests are waiting. Please try again later.".to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    #[error("Pairing codes are {} digits.", PAIRING_CODE_LEN)]
    InvalidCode,
    #[error("No pairing request with that code.")]
    RequestNotFound,
    #[error("That pairing code has expired.")]
    RequestExpired,
    #[error("That pairing request is already {}.", .0.as_str())]
    RequestAlreadyResolved(PairingRequestStatus),
}

#[derive(Debug, Default)]
struct PairingState {
    approved_senders: HashSet<(Channel, String)>,
    requests: Vec<PairingRequest>,
}

pub struct PairingGate {
    security: SharedSecurity,
    state: Mutex<PairingState>,
    pending_cap: usize,
    request_ttl: Duration,
}

impl PairingGate {
    pub fn new(security: SharedSecurity) -> Self {
        Self {
            security,
            state: Mutex::new(PairingState::default()),
            pending_cap: DEFAULT_PENDING_REQUEST_CAP,
            request_ttl: Duration::minutes(DEFAULT_REQUEST_TTL_MINUTES),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut PairingState) -> R) -> R {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Only chat platforms are gated; the HTTP API, voice socket and the
    /// scheduler are local surfaces.
    pub fn evaluate(&self, channel: Channel, sender_id: &str, now: DateTime<Utc>) -> GateDecision {
        if !matches!(channel, Channel::Telegram | Channel::Whatsapp) {
            return GateDecision::Allowed;
        }
        let sender_id = sender_id.trim();
        if sender_id.is_empty() || sender_id.chars().any(char::is_control) {
            return GateDecision::Denied;
        }

        let policy = {
            let security = self
                .security
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if security.admin_user_ids.iter().any(|id| id == sender_id)
                || security.allow_from.iter().any(|id| id == sender_id)
            {
                return GateDecision::Allowed;
            }
            security.dm_policy
        };

        match policy {
            DmPolicy::Open => GateDecision::Allowed,
            DmPolicy::Allowlist => GateDecision::Denied,
            DmPolicy::Pairing => self.with_state(|state| {
                self.evaluate_pairing(state, channel, sender_id, now)
            }),
        }
    }

    fn evaluate_pairing(
        &self,
        state: &mut PairingState,
        channel: Channel,
        sender_id: &str,
        now: DateTime<Utc>,
    ) -> GateDecision {
        sweep_requests(state, now, self.request_ttl);
        if state
            .approved_senders
            .contains(&(channel, sender_id.to_string()))
        {
            return GateDecision::Allowed;
        }
        if let Some(existing) = state.requests.iter().find(|r| {
            r.status == PairingRequestStatus::Pending
                && r.channel == channel
                && r.sender_id == sender_id
        }) {
            return GateDecision::PairingRequired {
                code: existing.code.clone(),
                created: false,
            };
        }
        let pending = state
            .requests
            .iter()
            .filter(|r| r.status == PairingRequestStatus::Pending)
            .count();
        if pending >= self.pending_cap {
            return GateDecision::PairingBusy;
        }

        let code = generate_unique_pairing_code(&state.requests);
        tracing::info!(channel = %channel, sender_id, "pairing request created");
        state.requests.push(PairingRequest {
            channel,
            sender_id: sender_id.to_string(),
            code: code.clone(),
            requested_at: now,
            expires_at: now + self.request_ttl,
            status: PairingRequestStatus::Pending,
            resolved_at: None,
        });
        GateDecision::PairingRequired {
            code,
            created: true,
        }
    }

    pub fn approve(&self, code: &str, now: DateTime<Utc>) -> Result<PairingRequest, PairingError> {
        self.resolve(code, PairingRequestStatus::Approved, now)
    }

    pub fn reject(&self, code: &str, now: DateTime<Utc>) -> Result<PairingRequest, PairingError> {
        self.resolve(code, PairingRequestStatus::Rejected, now)
    }

    fn resolve(
        &self,
        code: &str,
        outcome: PairingRequestStatus,
        now: DateTime<Utc>,
    ) -> Result<PairingRequest, PairingError> {
        let code = normalize_code(code)?;
        self.with_state(|state| {
            sweep_requests(state, now, self.request_ttl);
            let index = state
                .requests
                .iter()
                .position(|r| r.code == code)
                .ok_or(PairingError::RequestNotFound)?;

            match state.requests[index].status {
                PairingRequestStatus::Pending => {
                    let request = &mut state.requests[index];
                    request.status = outcome;
                    request.resolved_at = Some(now);
                    let request = request.clone();
                    if outcome == PairingRequestStatus::Approved {
                        state
                            .approved_senders
                            .insert((request.channel, request.sender_id.clone()));
                    }
                    Ok(request)
                }
                PairingRequestStatus::Expired => Err(PairingError::RequestExpired),
                status => Err(PairingError::RequestAlreadyResolved(status)),
            }
        })
    }

    /// Pending requests, newest first.
    pub fn pending(&self, now: DateTime<Utc>) -> Vec<PairingRequest> {
        self.with_state(|state| {
            sweep_requests(state, now, self.request_ttl);
            let mut out: Vec<PairingRequest> = state
                .requests
                .iter()
                .filter(|r| r.status == PairingRequestStatus::Pending)
                .cloned()
                .collect();
            out.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
            out
        })
    }
}

fn normalize_code(value: &str) -> Result<String, PairingError> {
    let normalized = value.trim();
    if normalized.len() != PAIRING_CODE_LEN || !normalized.chars().all(|c| c.is_ascii_digit()) {
        return Err(PairingError::InvalidCode);
    }
    Ok(normalized.to_string())
}

fn generate_pairing_code() -> String {
    let seed = Uuid::new_v4().into_bytes();
    seed.iter()
        .take(PAIRING_CODE_LEN)
        .map(|byte| char::from(b'0' + byte % 10))
        .collect()
}

fn generate_unique_pairing_code(existing_requests: &[PairingRequest]) -> String {
    loop {
        let candidate = generate_pairing_code();
        if existing_requests.iter().all(|r| r.code != candidate) {
            return candidate;
        }
    }
}

/// Marks stale pending requests expired and forgets resolved ones once they
/// are a full TTL old, so the history stays bounded.
fn sweep_requests(state: &mut PairingState, now: DateTime<Utc>, ttl: Duration) {
    for request in &mut state.requests {
        if request.status == PairingRequestStatus::Pending && request.is_expired_at(now) {
            request.status = PairingRequestStatus::Expired;
            request.resolved_at = Some(request.expires_at);
        }
    }
    state.requests.retain(|request| match request.resolved_at {
        Some(resolved_at) => now < resolved_at + ttl,
        None => true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use chrono::TimeZone;
    use std::sync::{Arc, RwLock};

    fn gate(policy: DmPolicy, allow_from: &[&str]) -> PairingGate {
        PairingGate::new(Arc::new(RwLock::new(SecurityConfig {
            dm_policy: policy,
            allow_from: allow_from.iter().map(|s| s.to_string()).collect(),
            admin_user_ids: vec!["admin".to_string()],
            ..SecurityConfig::default()
        })))
    }

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, hour, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn code_of(decision: GateDecision) -> String {
        match decision {
            GateDecision::PairingRequired { code, .. } => code,
            other => panic!("expected pairing decision, got {other:?}"),
        }
    }

    #[test]
    fn local_channels_bypass_the_gate() {
        let gate = gate(DmPolicy::Allowlist, &[]);
        assert!(gate.evaluate(Channel::Api, "anyone", ts(9, 0)).is_allowed());
        assert!(gate.evaluate(Channel::Voice, "anyone", ts(9, 0)).is_allowed());
        assert_eq!(
            gate.evaluate(Channel::Telegram, "anyone", ts(9, 0)),
            GateDecision::Denied
        );
    }

    #[test]
    fn allowlist_and_admins_pass() {
        let gate = gate(DmPolicy::Allowlist, &["friend"]);
        assert!(gate.evaluate(Channel::Telegram, "friend", ts(9, 0)).is_allowed());
        assert!(gate.evaluate(Channel::Whatsapp, "admin", ts(9, 0)).is_allowed());
        assert_eq!(
            gate.evaluate(Channel::Telegram, " ", ts(9, 0)),
            GateDecision::Denied
        );
    }

    #[test]
    fn open_policy_admits_everyone() {
        let gate = gate(DmPolicy::Open, &[]);
        assert!(gate.evaluate(Channel::Telegram, "stranger", ts(9, 0)).is_allowed());
    }

    #[test]
    fn policy_changes_apply_to_the_next_message() {
        let security: SharedSecurity = Arc::new(RwLock::new(SecurityConfig::default()));
        let gate = PairingGate::new(security.clone());
        assert!(!gate.evaluate(Channel::Telegram, "s1", ts(9, 0)).is_allowed());
        security
            .write()
            .expect("lock")
            .allow_from
            .push("s1".to_string());
        assert!(gate.evaluate(Channel::Telegram, "s1", ts(9, 1)).is_allowed());
    }

    #[test]
    fn pairing_code_is_reused_then_approved() {
        let gate = gate(DmPolicy::Pairing, &[]);
        let first = gate.evaluate(Channel::Telegram, "s1", ts(9, 0));
        assert!(matches!(first, GateDecision::PairingRequired { created: true, .. }));
        let code = code_of(first);
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));

        let again = gate.evaluate(Channel::Telegram, "s1", ts(9, 5));
        assert_eq!(
            again,
            GateDecision::PairingRequired {
                code: code.clone(),
                created: false
            }
        );
        assert_eq!(gate.pending(ts(9, 5)).len(), 1);

        let approved = gate.approve(&code, ts(9, 10)).expect("approve");
        assert_eq!(approved.status, PairingRequestStatus::Approved);
        assert!(gate.evaluate(Channel::Telegram, "s1", ts(9, 11)).is_allowed());
        // Approval is per channel.
        assert!(!gate.evaluate(Channel::Whatsapp, "s1", ts(9, 11)).is_allowed());

        assert_eq!(
            gate.approve(&code, ts(9, 12)).expect_err("already approved"),
            PairingError::RequestAlreadyResolved(PairingRequestStatus::Approved)
        );
    }

    #[test]
    fn expired_codes_rotate_and_cannot_be_approved() {
        let gate = gate(DmPolicy::Pairing, &[]);
        let code = code_of(gate.evaluate(Channel::Telegram, "s1", ts(9, 0)));
        assert_eq!(
            gate.approve(&code, ts(10, 0)).expect_err("expired"),
            PairingError::RequestExpired
        );
        let next = gate.evaluate(Channel::Telegram, "s1", ts(10, 1));
        assert!(matches!(next, GateDecision::PairingRequired { created: true, .. }));
    }

    #[test]
    fn resolved_requests_are_forgotten_after_a_ttl() {
        let gate = gate(DmPolicy::Pairing, &[]);
        let approved = code_of(gate.evaluate(Channel::Telegram, "s1", ts(9, 0)));
        gate.approve(&approved, ts(9, 5)).expect("approve");
        let rejected = code_of(gate.evaluate(Channel::Telegram, "s2", ts(9, 0)));
        gate.reject(&rejected, ts(9, 5)).expect("reject");
        code_of(gate.evaluate(Channel::Telegram, "s3", ts(9, 0)));
        assert_eq!(gate.with_state(|s| s.requests.len()), 3);

        // Within the TTL the outcome is still reported.
        assert_eq!(
            gate.approve(&approved, ts(9, 30)).expect_err("resolved"),
            PairingError::RequestAlreadyResolved(PairingRequestStatus::Approved)
        );

        // s3 expired at 10:00; everything is a full TTL old by 11:05.
        assert!(gate.pending(ts(11, 5)).is_empty());
        assert_eq!(gate.with_state(|s| s.requests.len()), 0);
        assert_eq!(
            gate.approve(&approved, ts(11, 5)).expect_err("forgotten"),
            PairingError::RequestNotFound
        );
        // Approval outlives the request record.
        assert!(gate.evaluate(Channel::Telegram, "s1", ts(11, 6)).is_allowed());
    }

    #[test]
    fn pending_cap_and_code_validation() {
        let gate = gate(DmPolicy::Pairing, &[]);
        for sender in ["a", "b", "c"] {
            code_of(gate.evaluate(Channel::Telegram, sender, ts(9, 0)));
        }
        assert_eq!(
            gate.evaluate(Channel::Telegram, "d", ts(9, 0)),
            GateDecision::PairingBusy
        );
        assert!(GateDecision::PairingBusy.reply().is_some());
        assert_eq!(
            gate.approve("12ab56", ts(9, 0)).expect_err("invalid"),
            PairingError::InvalidCode
        );
        let code = gate.pending(ts(9, 0))[0].code.clone();
        let rejected = gate.reject(&code, ts(9, 1)).expect("reject");
        assert_eq!(rejected.status, PairingRequestStatus::Rejected);
        assert_eq!(gate.pending(ts(9, 1)).len(), 2);
    }
}
