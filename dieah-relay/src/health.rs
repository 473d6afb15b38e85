//! Read-only health view over the outbox and the breaker

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::capture::CaptureStatus;
use crate::config::Config;
use crate::error::Result;
use crate::storage::OutboxStore;

/// Alert severity, ordered from harmless to urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub metric: &'static str,
    pub message: String,
}

/// Alert thresholds
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub queue_warning: u64,
    pub queue_critical: u64,
    pub oldest_pending_warning_secs: i64,
    pub breaker_open_critical_secs: u64,
}

impl From<&Config> for HealthThresholds {
    fn from(config: &Config) -> Self {
        Self {
            queue_warning: config.queue_warning_depth,
            queue_critical: config.queue_critical_depth,
            oldest_pending_warning_secs: config.oldest_pending_warning_secs,
            breaker_open_critical_secs: config.breaker_open_critical_secs,
        }
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        (&Config::default()).into()
    }
}

/// Status document for external monitoring
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Pending plus sending captures
    pub queue_depth: u64,
    pub breaker_state: BreakerState,
    pub consecutive_failures: u32,
    /// sent / (sent + failed) over the last hour; `None` when nothing finished
    pub success_rate_1h: Option<f64>,
    pub oldest_pending_age_secs: Option<i64>,
    /// Seconds the breaker has been away from CLOSED in the current outage
    pub breaker_open_secs: Option<u64>,
    pub failed_total: u64,
    pub alerts: Vec<Alert>,
    pub level: AlertLevel,
}

pub struct HealthReporter {
    store: Arc<OutboxStore>,
    breaker: Arc<CircuitBreaker>,
    thresholds: HealthThresholds,
}

impl HealthReporter {
    pub fn new(store: Arc<OutboxStore>, breaker: Arc<CircuitBreaker>, thresholds: HealthThresholds) -> Self {
        Self {
            store,
            breaker,
            thresholds,
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> Result<HealthStatus> {
        let hour_ago = now - chrono::Duration::hours(1);
        let sent = self.store.count_finished_since(CaptureStatus::Sent, hour_ago)?;
        let failed = self.store.count_finished_since(CaptureStatus::Failed, hour_ago)?;
        let success_rate_1h = match sent + failed {
            0 => None,
            total => Some(sent as f64 / total as f64),
        };

        let oldest_pending_age_secs = self
            .store
            .oldest_pending_created_at()?
            .map(|created| (now - created).num_seconds().max(0));

        let breaker = self.breaker.snapshot();
        let breaker_open_secs = match breaker.state {
            BreakerState::Closed => None,
            _ => breaker.open_for.map(|d| d.as_secs()),
        };

        let failed_total = self
            .store
            .count_by_status()?
            .get(&CaptureStatus::Failed)
            .copied()
            .unwrap_or(0);

        let mut status = HealthStatus {
            queue_depth: self.store.queue_depth()?,
            breaker_state: breaker.state,
            consecutive_failures: breaker.consecutive_failures,
            success_rate_1h,
            oldest_pending_age_secs,
            breaker_open_secs,
            failed_total,
            alerts: Vec::new(),
            level: AlertLevel::Ok,
        };
        status.alerts = evaluate(&status, &self.thresholds);
        status.level = status
            .alerts
            .iter()
            .map(|a| a.level)
            .max()
            .unwrap_or(AlertLevel::Ok);

        Ok(status)
    }
}

/// Apply alert thresholds to a status snapshot
pub fn evaluate(status: &HealthStatus, thresholds: &HealthThresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if status.queue_depth > thresholds.queue_critical {
        alerts.push(Alert {
            level: AlertLevel::Critical,
            metric: "queue_depth",
            message: format!("{} captures waiting for delivery", status.queue_depth),
        });
    } else if status.queue_depth > thresholds.queue_warning {
        alerts.push(Alert {
            level: AlertLevel::Warning,
            metric: "queue_depth",
            message: format!("{} captures waiting for delivery", status.queue_depth),
        });
    }

    if let Some(age) = status.oldest_pending_age_secs {
        if age > thresholds.oldest_pending_warning_secs {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "oldest_pending_age",
                message: format!("oldest pending capture is {}s old", age),
            });
        }
    }

    if let Some(open) = status.breaker_open_secs {
        if open > thresholds.breaker_open_critical_secs {
            alerts.push(Alert {
                level: AlertLevel::Critical,
                metric: "breaker_state",
                message: format!("memory worker breaker has been open for {}s", open),
            });
        }
    }

    alerts
}
