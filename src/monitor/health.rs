use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

/// Staleness thresholds: no heartbeat for 30 s degrades a component; a
/// component stuck in error for 60 s is considered stopped.
const DEGRADED_AFTER: i64 = 30;
const ERROR_STOPPED_AFTER: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
    Running,
    Degraded,
    Stopped,
    Error,
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentState::Running => write!(f, "running"),
            ComponentState::Degraded => write!(f, "degraded"),
            ComponentState::Stopped => write!(f, "stopped"),
            ComponentState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Healthy,
    Degraded,
    Critical,
    Offline,
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemStatus::Healthy => write!(f, "healthy"),
            SystemStatus::Degraded => write!(f, "degraded"),
            SystemStatus::Critical => write!(f, "critical"),
            SystemStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub name: String,
    pub state: ComponentState,
    pub last_check: DateTime<Utc>,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealthReport {
    pub status: SystemStatus,
    pub components: Vec<ComponentHealth>,
    pub timestamp: DateTime<Utc>,
}

struct Entry {
    state: ComponentState,
    last_check: DateTime<Utc>,
    error_count: u64,
    last_error: Option<String>,
    error_since: Option<DateTime<Utc>>,
}

pub struct HealthRegistry {
    components: RwLock<HashMap<String, Entry>>,
    started_at: Instant,
}

impl HealthRegistry {
    pub fn new(names: &[&str]) -> Self {
        let now = Utc::now();
        let components = names
            .iter()
            .map(|&name| {
                (
                    name.to_string(),
                    Entry {
                        state: ComponentState::Stopped,
                        last_check: now,
                        error_count: 0,
                        last_error: None,
                        error_since: None,
                    },
                )
            })
            .collect();

        Self {
            components: RwLock::new(components),
            started_at: Instant::now(),
        }
    }

    pub fn heartbeat(&self, name: &str) {
        let mut components = self.components.write().unwrap();
        if let Some(entry) = components.get_mut(name) {
            entry.state = ComponentState::Running;
            entry.last_check = Utc::now();
            entry.error_since = None;
        }
    }

    pub fn report_error(&self, name: &str, error: impl Into<String>) {
        let mut components = self.components.write().unwrap();
        if let Some(entry) = components.get_mut(name) {
            let now = Utc::now();
            entry.state = ComponentState::Error;
            entry.last_check = now;
            entry.error_count += 1;
            entry.last_error = Some(error.into());
            entry.error_since.get_or_insert(now);
        }
    }

    pub fn mark_stopped(&self, name: &str) {
        let mut components = self.components.write().unwrap();
        if let Some(entry) = components.get_mut(name) {
            entry.state = ComponentState::Stopped;
            entry.last_check = Utc::now();
        }
    }

    pub fn mark_all_stopped(&self) {
        let mut components = self.components.write().unwrap();
        let now = Utc::now();
        for entry in components.values_mut() {
            entry.state = ComponentState::Stopped;
            entry.last_check = now;
        }
    }

    /// Apply staleness derivation and return the per-component view.
    pub fn snapshot(&self) -> Vec<ComponentHealth> {
        let now = Utc::now();
        let mut components = self.components.write().unwrap();
        let mut result: Vec<ComponentHealth> = components
            .iter_mut()
            .map(|(name, entry)| {
                if entry.state == ComponentState::Running
                    && now - entry.last_check > Duration::seconds(DEGRADED_AFTER)
                {
                    entry.state = ComponentState::Degraded;
                }
                if entry.state == ComponentState::Error {
                    if let Some(since) = entry.error_since {
                        if now - since > Duration::seconds(ERROR_STOPPED_AFTER) {
                            entry.state = ComponentState::Stopped;
                        }
                    }
                }
                ComponentHealth {
                    name: name.clone(),
                    state: entry.state,
                    last_check: entry.last_check,
                    error_count: entry.error_count,
                    last_error: entry.last_error.clone(),
                }
            })
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    pub fn system_status(&self) -> SystemStatus {
        let components = self.snapshot();
        if components
            .iter()
            .any(|c| matches!(c.state, ComponentState::Stopped | ComponentState::Error))
        {
            SystemStatus::Critical
        } else if components.iter().any(|c| c.state == ComponentState::Degraded) {
            SystemStatus::Degraded
        } else {
            SystemStatus::Healthy
        }
    }

    pub fn report(&self) -> SystemHealthReport {
        SystemHealthReport {
            status: self.system_status(),
            components: self.snapshot(),
            timestamp: Utc::now(),
        }
    }

    /// Share of components currently running, as a 0–100 score.
    pub fn health_score(&self) -> f64 {
        let components = self.snapshot();
        if components.is_empty() {
            return 0.0;
        }
        let running = components
            .iter()
            .filter(|c| c.state == ComponentState::Running)
            .count();
        running as f64 / components.len() as f64 * 100.0
    }

    /// Components that are running or merely degraded.
    pub fn active_components(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|c| matches!(c.state, ComponentState::Running | ComponentState::Degraded))
            .count()
    }

    /// Errors per minute over the process lifetime.
    pub fn error_rate(&self) -> f64 {
        let total: u64 = self
            .components
            .read()
            .unwrap()
            .values()
            .map(|e| e.error_count)
            .sum();
        let minutes = self.started_at.elapsed().as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        total as f64 / minutes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_marks_running() {
        let registry = HealthRegistry::new(&["detector", "accountant"]);
        assert_eq!(registry.system_status(), SystemStatus::Critical);

        registry.heartbeat("detector");
        registry.heartbeat("accountant");
        assert_eq!(registry.system_status(), SystemStatus::Healthy);
        assert_eq!(registry.health_score(), 100.0);
    }

    #[test]
    fn test_error_degrades_system() {
        let registry = HealthRegistry::new(&["detector", "accountant"]);
        registry.heartbeat("detector");
        registry.heartbeat("accountant");
        registry.report_error("detector", "boom");

        assert_eq!(registry.system_status(), SystemStatus::Critical);
        let snapshot = registry.snapshot();
        let detector = snapshot.iter().find(|c| c.name == "detector").unwrap();
        assert_eq!(detector.state, ComponentState::Error);
        assert_eq!(detector.error_count, 1);
        assert_eq!(detector.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_heartbeat_clears_error() {
        let registry = HealthRegistry::new(&["detector"]);
        registry.report_error("detector", "boom");
        registry.heartbeat("detector");
        assert_eq!(registry.system_status(), SystemStatus::Healthy);
    }

    #[test]
    fn test_active_components() {
        let registry = HealthRegistry::new(&["a", "b", "c"]);
        registry.heartbeat("a");
        registry.heartbeat("b");
        assert_eq!(registry.active_components(), 2);
    }
}
