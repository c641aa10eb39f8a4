//! Sender tiers, authorization auditing and per-sender rate limiting.

use crate::config::SecurityConfig;
use crate::store::MemoryStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

pub const ADMIN_TIER: u8 = 5;
pub const DEFAULT_TIER: u8 = 1;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Runtime security settings. Approved `config_change` requests mutate it in
/// place, so readers always see the current DM policy and allowlist.
pub type SharedSecurity = Arc<RwLock<SecurityConfig>>;

pub fn user_tier(security: &SecurityConfig, sender_id: &str) -> u8 {
    if security.admin_user_ids.iter().any(|id| id == sender_id) {
        ADMIN_TIER
    } else {
        DEFAULT_TIER
    }
}

/// True when `tier` meets `required`. Denials are written to the audit log.
pub fn authorize(
    store: &MemoryStore,
    sender_id: &str,
    tier: u8,
    required: u8,
    now: DateTime<Utc>,
) -> bool {
    if tier >= required {
        return true;
    }
    let detail = format!("Required tier {required}, has tier {tier}");
    if let Err(error) = store.log_audit(sender_id, "access_denied", Some(&detail), tier, now) {
        tracing::warn!(%error, "failed to audit access denial");
    }
    tracing::info!(sender_id, tier, required, "access denied");
    false
}

/// Sliding one-minute and one-hour windows per sender.
#[derive(Debug)]
pub struct RateLimiter {
    per_minute: usize,
    per_hour: usize,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(per_minute: usize, per_hour: usize) -> Self {
        Self {
            per_minute,
            per_hour,
            windows: DashMap::new(),
        }
    }

    /// Records the request and returns true when it is within both limits.
    /// Rejected requests are not counted.
    pub fn check(&self, sender_id: &str, now: Instant) -> bool {
        let mut window = self.windows.entry(sender_id.to_string()).or_default();
        while window
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= HOUR)
        {
            window.pop_front();
        }
        if window.len() >= self.per_hour {
            return false;
        }
        let last_minute = window
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) < MINUTE)
            .count();
        if last_minute >= self.per_minute {
            return false;
        }
        window.push_back(now);
        true
    }

    pub fn tracked_senders(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn security(admins: &[&str]) -> SecurityConfig {
        SecurityConfig {
            admin_user_ids: admins.iter().map(|s| s.to_string()).collect(),
            ..SecurityConfig::default()
        }
    }

    #[test]
    fn admins_get_top_tier() {
        let sec = security(&["42"]);
        assert_eq!(user_tier(&sec, "42"), ADMIN_TIER);
        assert_eq!(user_tier(&sec, "7"), DEFAULT_TIER);
    }

    #[test]
    fn denials_are_audited() {
        let store = MemoryStore::open_in_memory().expect("store");
        let now = Utc
            .with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp");
        assert!(authorize(&store, "u1", 5, 3, now));
        assert!(!authorize(&store, "u1", 1, 3, now));

        let entries = store
            .recent_audit(1, Some("access_denied"), now)
            .expect("audit");
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].detail.as_deref(),
            Some("Required tier 3, has tier 1")
        );
    }

    #[test]
    fn minute_window_slides() {
        let limiter = RateLimiter::new(3, 100);
        let start = Instant::now();
        for i in 0..3 {
            assert!(limiter.check("u1", start + Duration::from_secs(i)));
        }
        assert!(!limiter.check("u1", start + Duration::from_secs(10)));
        assert!(limiter.check("u2", start + Duration::from_secs(10)));
        assert!(limiter.check("u1", start + Duration::from_secs(61)));
        assert_eq!(limiter.tracked_senders(), 2);
    }

    #[test]
    fn hour_window_caps_total() {
        let limiter = RateLimiter::new(100, 2);
        let start = Instant::now();
        assert!(limiter.check("u1", start));
        assert!(limiter.check("u1", start + Duration::from_secs(120)));
        assert!(!limiter.check("u1", start + Duration::from_secs(600)));
        assert!(limiter.check("u1", start + Duration::from_secs(3_601)));
    }
}
