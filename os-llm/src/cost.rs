//! Spend accounting for the cloud tier.
//!
//! Every successful completion with a positive cost is appended to a
//! [`CostLedger`]. The month-to-date total decides whether the cloud tier is
//! still eligible for routing.

use crate::error::Result;
use crate::types::{Completion, ProviderKind};
use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEntry {
    pub provider: ProviderKind,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

/// Append-only store of cost entries.
pub trait CostLedger: Send + Sync {
    fn append(&self, entry: &CostEntry) -> Result<()>;

    /// Sum of `cost_usd` for entries in the calendar month containing `now`.
    fn month_total(&self, now: DateTime<Utc>) -> Result<f64>;
}

#[derive(Debug, Default)]
pub struct InMemoryCostLedger {
    entries: Mutex<Vec<CostEntry>>,
}

impl InMemoryCostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<CostEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl CostLedger for InMemoryCostLedger {
    fn append(&self, entry: &CostEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry.clone());
        Ok(())
    }

    fn month_total(&self, now: DateTime<Utc>) -> Result<f64> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entries
            .iter()
            .filter(|e| e.created_at.year() == now.year() && e.created_at.month() == now.month())
            .map(|e| e.cost_usd)
            .sum())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub spent_usd: f64,
    pub budget_usd: f64,
    pub remaining_usd: f64,
    pub utilization_pct: f64,
}

#[derive(Clone)]
pub struct CostTracker {
    ledger: Arc<dyn CostLedger>,
    monthly_budget_usd: f64,
}

impl CostTracker {
    pub fn new(ledger: Arc<dyn CostLedger>, monthly_budget_usd: f64) -> Self {
        Self {
            ledger,
            monthly_budget_usd: monthly_budget_usd.max(0.0),
        }
    }

    pub fn monthly_budget_usd(&self) -> f64 {
        self.monthly_budget_usd
    }

    /// Free calls are not written.
    #[tracing::instrument(level = "debug", skip_all, fields(provider = %provider, model = %model, cost_usd = cost_usd))]
    pub fn record(
        &self,
        provider: ProviderKind,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        cost_usd: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if cost_usd <= 0.0 {
            return Ok(());
        }
        let entry = CostEntry {
            provider,
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost_usd,
            created_at: now,
        };
        self.ledger.append(&entry)
    }

    pub fn record_completion(&self, completion: &Completion) {
        if let Err(e) = self.record(
            completion.provider,
            &completion.model,
            completion.usage.prompt_tokens,
            completion.usage.completion_tokens,
            completion.cost_usd,
            Utc::now(),
        ) {
            tracing::warn!(%e, model = %completion.model, "failed to record inference cost");
        }
    }

    pub fn spent_this_month(&self, now: DateTime<Utc>) -> Result<f64> {
        self.ledger.month_total(now)
    }

    /// A ledger read failure counts as over budget.
    pub fn is_within_budget(&self, now: DateTime<Utc>) -> bool {
        match self.spent_this_month(now) {
            Ok(spent) => spent < self.monthly_budget_usd,
            Err(e) => {
                tracing::warn!(%e, "cost ledger unreadable; treating cloud tier as over budget");
                false
            }
        }
    }

    pub fn budget_status(&self, now: DateTime<Utc>) -> Result<BudgetStatus> {
        let spent = self.spent_this_month(now)?;
        let budget = self.monthly_budget_usd;
        let utilization_pct = if budget > 0.0 {
            round_to(spent / budget * 100.0, 1)
        } else {
            0.0
        };
        Ok(BudgetStatus {
            spent_usd: round_to(spent, 4),
            budget_usd: budget,
            remaining_usd: round_to((budget - spent).max(0.0), 4),
            utilization_pct,
        })
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, month, day, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn new_tracker(budget: f64) -> (Arc<InMemoryCostLedger>, CostTracker) {
        let ledger = Arc::new(InMemoryCostLedger::new());
        let tracker = CostTracker::new(ledger.clone(), budget);
        (ledger, tracker)
    }

    #[test]
    fn zero_cost_calls_are_not_recorded() {
        let (ledger, tracker) = new_tracker(10.0);
        tracker
            .record(ProviderKind::Ollama, "qwen", 10, 10, 0.0, ts(3, 1))
            .expect("record");
        tracker
            .record(ProviderKind::OpenRouter, "free", 10, 10, -1.0, ts(3, 1))
            .expect("record");
        assert!(ledger.entries().is_empty());
    }

    #[test]
    fn budget_is_exclusive_at_the_limit() {
        let (_ledger, tracker) = new_tracker(1.0);
        tracker
            .record(ProviderKind::OpenRouter, "m", 1, 1, 0.6, ts(3, 2))
            .expect("record");
        assert!(tracker.is_within_budget(ts(3, 3)));
        tracker
            .record(ProviderKind::OpenRouter, "m", 1, 1, 0.4, ts(3, 4))
            .expect("record");
        assert!(!tracker.is_within_budget(ts(3, 5)));
    }

    #[test]
    fn month_total_ignores_previous_months() {
        let (_ledger, tracker) = new_tracker(1.0);
        tracker
            .record(ProviderKind::OpenRouter, "m", 1, 1, 5.0, ts(2, 27))
            .expect("record");
        assert!(tracker.is_within_budget(ts(3, 1)));
        assert!(!tracker.is_within_budget(ts(2, 28)));
    }

    #[test]
    fn budget_status_rounds_and_clamps() {
        let (_ledger, tracker) = new_tracker(50.0);
        tracker
            .record(ProviderKind::OpenRouter, "m", 1, 1, 12.345678, ts(3, 2))
            .expect("record");
        let status = tracker.budget_status(ts(3, 9)).expect("status");
        assert_eq!(status.spent_usd, 12.3457);
        assert_eq!(status.budget_usd, 50.0);
        assert_eq!(status.remaining_usd, 37.6543);
        assert_eq!(status.utilization_pct, 24.7);

        let (_ledger, zero) = new_tracker(0.0);
        let status = zero.budget_status(ts(3, 9)).expect("status");
        assert_eq!(status.utilization_pct, 0.0);
        assert_eq!(status.remaining_usd, 0.0);
    }
}
