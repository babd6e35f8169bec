//! Per-component windowed caps. Over-recording is always accepted and
//! surfaced through status and events; downstream consumers decide how to
//! react. Invasive actions stay behind an explicit config gate.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::{debug, info};

use crate::config::ComponentCapConfig;
use crate::domain::{Result, TokenOpsError, UsageMetadata};
use crate::events::{EventBus, MonitorEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Normal,
    Warning,
    Critical,
    Blocked,
}

impl std::fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentStatus::Normal => write!(f, "normal"),
            ComponentStatus::Warning => write!(f, "warning"),
            ComponentStatus::Critical => write!(f, "critical"),
            ComponentStatus::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentReport {
    pub name: String,
    pub current_usage: u64,
    pub limit: u64,
    pub percentage: f64,
    pub status: ComponentStatus,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementStatus {
    pub components: Vec<ComponentReport>,
    pub system_status: ComponentStatus,
    pub active_enforcements: usize,
    pub timestamp: DateTime<Utc>,
}

struct ComponentCap {
    name: String,
    limit: u64,
    window: Duration,
    current_usage: u64,
    window_start: DateTime<Utc>,
    last_update: DateTime<Utc>,
    status: ComponentStatus,
}

impl ComponentCap {
    fn percentage(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.current_usage as f64 / self.limit as f64 * 100.0
    }

    /// Clear the counter at the window boundary. Status transitions are
    /// monotonic within a window; only the reset lowers them.
    fn maybe_reset(&mut self, now: DateTime<Utc>) {
        if now - self.window_start >= self.window {
            self.current_usage = 0;
            self.window_start = now;
            self.status = ComponentStatus::Normal;
            debug!(component = %self.name, "enforcement window reset");
        }
    }

    fn report(&self) -> ComponentReport {
        ComponentReport {
            name: self.name.clone(),
            current_usage: self.current_usage,
            limit: self.limit,
            percentage: self.percentage(),
            status: self.status,
            last_update: self.last_update,
        }
    }
}

/// Threshold ladder at 70% / 90% / 100% of the limit.
fn status_for(percentage: f64) -> ComponentStatus {
    if percentage >= 100.0 {
        ComponentStatus::Blocked
    } else if percentage >= 90.0 {
        ComponentStatus::Critical
    } else if percentage >= 70.0 {
        ComponentStatus::Warning
    } else {
        ComponentStatus::Normal
    }
}

pub struct CapEnforcer {
    components: RwLock<Vec<ComponentCap>>,
    bus: EventBus,
    invasive_enabled: bool,
    actions_count: AtomicU64,
}

impl CapEnforcer {
    pub fn new(bus: EventBus, caps: &[ComponentCapConfig], invasive_enabled: bool) -> Self {
        let now = Utc::now();
        let components = caps
            .iter()
            .map(|c| ComponentCap {
                name: c.name.clone(),
                limit: c.limit,
                window: Duration::hours(c.window_hours as i64),
                current_usage: 0,
                window_start: now,
                last_update: now,
                status: ComponentStatus::Normal,
            })
            .collect();

        Self {
            components: RwLock::new(components),
            bus,
            invasive_enabled,
            actions_count: AtomicU64::new(0),
        }
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components
            .read()
            .unwrap()
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Record usage against a component. Recording beyond the limit is
    /// accepted; the breach is surfaced via status and events.
    pub fn record_usage(
        &self,
        component: &str,
        tokens: u64,
        _metadata: &UsageMetadata,
    ) -> Result<ComponentStatus> {
        let now = Utc::now();
        let transition = {
            let mut components = self.components.write().unwrap();
            let cap = components
                .iter_mut()
                .find(|c| c.name == component)
                .ok_or_else(|| TokenOpsError::ComponentNotFound(component.to_string()))?;

            cap.maybe_reset(now);
            cap.current_usage += tokens;
            cap.last_update = now;

            let new_status = status_for(cap.percentage());
            let crossed_upward = new_status > cap.status;
            cap.status = new_status;

            crossed_upward.then(|| (new_status, cap.current_usage, cap.limit, cap.percentage()))
        };

        if let Some((status, current_usage, limit, percentage)) = transition {
            let (action, invasive) = match status {
                ComponentStatus::Warning => ("advisory_warning", false),
                ComponentStatus::Critical => ("throttle_advisory", false),
                ComponentStatus::Blocked if self.invasive_enabled => ("block", true),
                ComponentStatus::Blocked => ("block_advisory", false),
                ComponentStatus::Normal => unreachable!("upward crossing cannot land on normal"),
            };

            info!(
                component,
                %status,
                percentage,
                action,
                "enforcement threshold crossed"
            );
            self.actions_count.fetch_add(1, Ordering::Relaxed);
            counter!("enforcement_actions_total", 1);

            self.bus.publish(MonitorEvent::EnforcementTriggered {
                component: component.to_string(),
                action: action.to_string(),
                current_usage,
                limit,
                percentage,
                invasive,
            });

            return Ok(status);
        }

        let components = self.components.read().unwrap();
        Ok(components
            .iter()
            .find(|c| c.name == component)
            .map(|c| c.status)
            .unwrap_or(ComponentStatus::Normal))
    }

    pub fn current_status(&self) -> EnforcementStatus {
        let now = Utc::now();
        let mut components = self.components.write().unwrap();

        let reports: Vec<ComponentReport> = components
            .iter_mut()
            .map(|c| {
                c.maybe_reset(now);
                c.report()
            })
            .collect();

        let system_status = reports
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(ComponentStatus::Normal);
        let active_enforcements = reports
            .iter()
            .filter(|r| r.status > ComponentStatus::Normal)
            .count();

        EnforcementStatus {
            components: reports,
            system_status,
            active_enforcements,
            timestamp: now,
        }
    }

    /// Enforcement actions emitted over the process lifetime.
    pub fn actions_count(&self) -> u64 {
        self.actions_count.load(Ordering::Relaxed)
    }
}
