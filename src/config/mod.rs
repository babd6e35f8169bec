use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::alerting::rules::AlertRule;
use crate::domain::{Result, TokenOpsError};

/// Single configuration record for the whole pipeline. Loadable from TOML;
/// invalid rules, unknown metric names, and malformed regexes are fatal at
/// load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    /// Persistence file for the accountant state.
    pub persist_path: PathBuf,

    pub enable_real_time_detection: bool,
    pub enable_cap_enforcement: bool,
    pub enable_alerting: bool,

    /// Cadence of the persistence worker and multiplexer pane capture.
    pub update_interval_ms: u64,
    /// Dashboard snapshot cadence.
    pub snapshot_interval_secs: u64,
    /// Rolling length of the dashboard metric history.
    pub retention_period_hours: u64,
    /// Usage records older than this are pruned on load and by the sweeper.
    pub record_retention_days: u64,
    /// Alert history older than this is pruned by the hourly sweep.
    pub alert_retention_days: u64,
    /// Alert rule evaluation cadence.
    pub check_interval_secs: u64,
    /// Per-source detection debounce.
    pub debounce_time_ms: u64,
    /// Bounded detection event ring size.
    pub max_cache_size: usize,

    pub monitored_files: Vec<PathBuf>,
    pub monitored_processes: Vec<String>,
    pub monitored_multiplexer_sessions: Vec<String>,

    /// Override or augment the built-in alert rules; matched by rule id.
    pub alert_rules: Vec<AlertRule>,

    /// Component caps enforced by the cap enforcer.
    pub component_caps: Vec<ComponentCapConfig>,

    pub notifications: NotificationConfig,

    /// Gates `system_command` alert actions and invasive enforcement. There
    /// is no runtime toggle; set it at load or not at all.
    pub enable_invasive_actions: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentCapConfig {
    pub name: String,
    /// Token limit per window.
    pub limit: u64,
    /// Rolling window length in hours.
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,
}

fn default_window_hours() -> u64 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationConfig {
    pub enable_webhooks: bool,
    pub enable_email: bool,
    pub enable_slack: bool,
    pub enable_nudge: bool,
    pub webhook_urls: Vec<String>,
    pub email_recipients: Vec<String>,
    pub slack_channels: Vec<String>,
    /// Slack incoming-webhook endpoint; required when slack is enabled.
    pub slack_webhook_url: Option<String>,
    /// SMTP relay; required when email is enabled.
    pub smtp_server: Option<String>,
    pub smtp_from: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enable_webhooks: false,
            enable_email: false,
            enable_slack: false,
            enable_nudge: true,
            webhook_urls: Vec::new(),
            email_recipients: Vec::new(),
            slack_channels: Vec::new(),
            slack_webhook_url: None,
            smtp_server: None,
            smtp_from: None,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            persist_path: PathBuf::from(".llm-token-ops/usage.json"),
            enable_real_time_detection: true,
            enable_cap_enforcement: true,
            enable_alerting: true,
            update_interval_ms: 5000,
            snapshot_interval_secs: 60,
            retention_period_hours: 24,
            record_retention_days: 30,
            alert_retention_days: 7,
            check_interval_secs: 30,
            debounce_time_ms: 500,
            max_cache_size: 1000,
            monitored_files: Vec::new(),
            monitored_processes: Vec::new(),
            monitored_multiplexer_sessions: Vec::new(),
            alert_rules: Vec::new(),
            component_caps: vec![
                ComponentCapConfig {
                    name: "inspector".to_string(),
                    limit: 500_000,
                    window_hours: 24,
                },
                ComponentCapConfig {
                    name: "orchestrator".to_string(),
                    limit: 1_000_000,
                    window_hours: 24,
                },
            ],
            notifications: NotificationConfig::default(),
            enable_invasive_actions: false,
        }
    }
}

impl MonitorConfig {
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: MonitorConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Startup-fatal validation: bad intervals, empty cap names, and invalid
    /// alert rules abort initialization.
    pub fn validate(&self) -> Result<()> {
        if self.update_interval_ms == 0 {
            return Err(TokenOpsError::config("updateInterval must be positive"));
        }
        if self.check_interval_secs == 0 {
            return Err(TokenOpsError::config("checkInterval must be positive"));
        }
        if self.max_cache_size == 0 {
            return Err(TokenOpsError::config("maxCacheSize must be positive"));
        }

        for cap in &self.component_caps {
            if cap.name.is_empty() {
                return Err(TokenOpsError::config("component cap name cannot be empty"));
            }
            if cap.limit == 0 {
                return Err(TokenOpsError::config(format!(
                    "component cap limit for '{}' must be positive",
                    cap.name
                )));
            }
        }

        for rule in &self.alert_rules {
            rule.validate()
                .map_err(|e| TokenOpsError::config(format!("alert rule '{}': {}", rule.id, e)))?;
        }

        if self.notifications.enable_email && self.notifications.smtp_server.is_none() {
            return Err(TokenOpsError::config(
                "email notifications require an smtp server",
            ));
        }
        if self.notifications.enable_slack && self.notifications.slack_webhook_url.is_none() {
            return Err(TokenOpsError::config(
                "slack notifications require a webhook url",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.debounce_time_ms, 500);
        assert_eq!(config.component_caps.len(), 2);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = MonitorConfig {
            check_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_email_without_smtp_rejected() {
        let mut config = MonitorConfig::default();
        config.notifications.enable_email = true;
        assert!(config.validate().is_err());
    }
}
