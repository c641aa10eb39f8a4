//! Background overseer jobs: the recurring security audit and the periodic
//! check-in. Both notify admins only when something needs a human.

use super::OverseerAgent;
use super::protocol::AuditReport;
use crate::access::SharedSecurity;
use crate::config::{MAX_INTERVAL_HOURS, OverseerConfig};
use crate::store::MemoryStore;
use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use os_channels::ChannelAdapter;
use os_llm::Role;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SCHEDULER_USER: &str = "overseer:scheduler";
const SCHEDULER_CHANNEL: &str = "scheduler";

/// Hours to a timer period; `None` for zero or anything past a year.
pub fn interval_from_hours(hours: u64) -> Option<Duration> {
    if hours == 0 || hours > MAX_INTERVAL_HOURS {
        return None;
    }
    hours.checked_mul(3600).map(Duration::from_secs)
}

/// When the recurring audit fires.
#[derive(Debug, Clone)]
pub enum AuditSchedule {
    Every(Duration),
    Cron(Box<Schedule>),
}

impl AuditSchedule {
    /// `interval_hours` wins over the daily `cron_hour:cron_minute` slot.
    pub fn from_config(cfg: &OverseerConfig) -> Result<Self> {
        if let Some(hours) = cfg.interval_hours {
            let every = interval_from_hours(hours).ok_or_else(|| {
                anyhow::anyhow!(
                    "overseer interval_hours must be between 1 and {MAX_INTERVAL_HOURS}, got {hours}"
                )
            })?;
            return Ok(Self::Every(every));
        }
        let expression = format!("0 {} {} * * *", cfg.cron_minute, cfg.cron_hour);
        let schedule = Schedule::from_str(&expression)
            .map_err(|e| anyhow::anyhow!("invalid cron expression: {e}"))?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    pub fn next_after(&self, from: DateTime<Local>) -> Option<DateTime<Local>> {
        match self {
            Self::Every(every) => chrono::Duration::from_std(*every).ok().map(|d| from + d),
            Self::Cron(schedule) => schedule.after(&from).next(),
        }
    }
}

pub struct OverseerScheduler {
    overseer: Arc<OverseerAgent>,
    store: Arc<MemoryStore>,
    security: SharedSecurity,
    config: OverseerConfig,
    notifier: Option<Arc<dyn ChannelAdapter>>,
}

impl OverseerScheduler {
    pub fn new(
        overseer: Arc<OverseerAgent>,
        store: Arc<MemoryStore>,
        security: SharedSecurity,
        config: OverseerConfig,
    ) -> Self {
        Self {
            overseer,
            store,
            security,
            config,
            notifier: None,
        }
    }

    /// Pushes alerts through `adapter` in addition to storing them.
    pub fn with_notifier(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.notifier = Some(adapter);
        self
    }

    pub async fn run_scheduled_audit(&self) -> AuditReport {
        let report = self.overseer.request_audit("scheduled").await;
        let critical = report.critical_count();
        if critical > 0 {
            let alert = format!(
                "**ALERT: Scheduled audit found {critical} critical issue(s).**\n\n{}",
                self.overseer.format_report(&report)
            );
            self.notify(&alert).await;
        }
        let detail = json!({
            "report_id": report.id,
            "findings": report.findings.len(),
            "critical": critical,
        });
        self.audit("scheduled_audit_complete", &detail.to_string());
        report
    }

    /// Returns whether admins were notified.
    pub async fn run_check_in(&self) -> bool {
        let check_in = self.overseer.check_in();
        let notified = check_in.needs_attention();
        if notified {
            self.notify(&self.overseer.format_check_in(&check_in)).await;
        }
        let detail = json!({
            "critical": check_in.critical_findings,
            "pending_approvals": check_in.pending_approvals,
        });
        self.audit("check_in", &detail.to_string());
        notified
    }

    fn audit(&self, action: &str, detail: &str) {
        if let Err(error) = self
            .store
            .log_audit(SCHEDULER_USER, action, Some(detail), 5, Utc::now())
        {
            tracing::warn!(%error, action, "failed to write scheduler audit entry");
        }
    }

    /// Stores `text` in each admin's overseer conversation and, when a
    /// notify channel is configured, sends it there too.
    async fn notify(&self, text: &str) {
        let admins = self
            .security
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .admin_user_ids
            .clone();
        if admins.is_empty() {
            tracing::warn!("overseer notification dropped: no admin users configured");
            return;
        }
        let now = Utc::now();
        for admin in &admins {
            let conversation_id = format!("overseer:{admin}");
            let stored = self
                .store
                .get_or_create_conversation(&conversation_id, SCHEDULER_CHANNEL, "overseer", now)
                .and_then(|()| {
                    self.store.add_message(
                        &conversation_id,
                        Role::Assistant,
                        text,
                        Some(SCHEDULER_CHANNEL),
                        &json!({}),
                        now,
                    )
                });
            if let Err(error) = stored {
                tracing::warn!(%error, admin = %admin, "failed to store overseer notification");
            }
            if let Some(adapter) = &self.notifier {
                if let Err(error) = adapter.notify(admin, text).await {
                    tracing::warn!(
                        %error,
                        admin = %admin,
                        channel = adapter.channel().as_str(),
                        "failed to deliver overseer notification"
                    );
                }
            }
        }
    }

    /// Starts the audit and check-in loops. Both stop when `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: &CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        if !self.config.enabled {
            return Ok(handles);
        }

        if self.config.audit_enabled {
            let schedule = AuditSchedule::from_config(&self.config)?;
            let scheduler = self.clone();
            let shutdown = shutdown.child_token();
            handles.push(tokio::spawn(async move {
                loop {
                    let now = Local::now();
                    let Some(next) = schedule.next_after(now) else {
                        tracing::warn!("overseer audit schedule has no upcoming run");
                        break;
                    };
                    let wait = (next - now).to_std().unwrap_or_default();
                    tracing::info!(next_run_at = %next, "overseer audit scheduled");
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            tracing::info!("overseer audit loop received shutdown signal");
                            break;
                        }
                        _ = tokio::time::sleep(wait) => {
                            let report = scheduler.run_scheduled_audit().await;
                            tracing::info!(
                                report_id = %report.id,
                                critical = report.critical_count(),
                                "scheduled overseer audit complete"
                            );
                        }
                    }
                }
            }));
        }

        if let Some(every) = interval_from_hours(self.config.check_in_interval_hours) {
            let scheduler = self.clone();
            let shutdown = shutdown.child_token();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            tracing::info!("overseer check-in loop received shutdown signal");
                            break;
                        }
                        _ = interval.tick() => {
                            let notified = scheduler.run_check_in().await;
                            tracing::info!(notified, "overseer check-in tick");
                        }
                    }
                }
            }));
        }

        Ok(handles)
    }
}
