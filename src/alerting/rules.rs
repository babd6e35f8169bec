use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::{Result, TokenOpsError};
use crate::events::AlertNotice;

/// The closed metric namespace rules may reference. New names require a
/// resolver; unknown names are rejected at config load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    InspectorUsagePercentage,
    InspectorCurrentUsage,
    OrchestratorUsagePercentage,
    OrchestratorCurrentUsage,
    ProviderDailyUsagePercentage,
    ProviderWeeklyUsagePercentage,
    ProviderMonthlyUsagePercentage,
    CostHourlyTotal,
    CostDailyTotal,
    CostRate,
    TokensUsageRate,
    TokensTotalUsage,
    TokensEfficiencyScore,
    ProjectionCostIncreaseRate,
    ProjectionUsageIncreaseRate,
    ProjectionConfidenceScore,
    EnforcementActionsCount,
    EnforcementActiveEnforcements,
    EnforcementEscalationLevel,
    SystemHealthScore,
    SystemActiveComponents,
    SystemErrorRate,
}

impl MetricName {
    pub const ALL: &'static [MetricName] = &[
        MetricName::InspectorUsagePercentage,
        MetricName::InspectorCurrentUsage,
        MetricName::OrchestratorUsagePercentage,
        MetricName::OrchestratorCurrentUsage,
        MetricName::ProviderDailyUsagePercentage,
        MetricName::ProviderWeeklyUsagePercentage,
        MetricName::ProviderMonthlyUsagePercentage,
        MetricName::CostHourlyTotal,
        MetricName::CostDailyTotal,
        MetricName::CostRate,
        MetricName::TokensUsageRate,
        MetricName::TokensTotalUsage,
        MetricName::TokensEfficiencyScore,
        MetricName::ProjectionCostIncreaseRate,
        MetricName::ProjectionUsageIncreaseRate,
        MetricName::ProjectionConfidenceScore,
        MetricName::EnforcementActionsCount,
        MetricName::EnforcementActiveEnforcements,
        MetricName::EnforcementEscalationLevel,
        MetricName::SystemHealthScore,
        MetricName::SystemActiveComponents,
        MetricName::SystemErrorRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::InspectorUsagePercentage => "inspector.usage_percentage",
            MetricName::InspectorCurrentUsage => "inspector.current_usage",
            MetricName::OrchestratorUsagePercentage => "orchestrator.usage_percentage",
            MetricName::OrchestratorCurrentUsage => "orchestrator.current_usage",
            MetricName::ProviderDailyUsagePercentage => "provider.daily_usage_percentage",
            MetricName::ProviderWeeklyUsagePercentage => "provider.weekly_usage_percentage",
            MetricName::ProviderMonthlyUsagePercentage => "provider.monthly_usage_percentage",
            MetricName::CostHourlyTotal => "cost.hourly_total",
            MetricName::CostDailyTotal => "cost.daily_total",
            MetricName::CostRate => "cost.cost_rate",
            MetricName::TokensUsageRate => "tokens.usage_rate",
            MetricName::TokensTotalUsage => "tokens.total_usage",
            MetricName::TokensEfficiencyScore => "tokens.efficiency_score",
            MetricName::ProjectionCostIncreaseRate => "projection.cost_increase_rate",
            MetricName::ProjectionUsageIncreaseRate => "projection.usage_increase_rate",
            MetricName::ProjectionConfidenceScore => "projection.confidence_score",
            MetricName::EnforcementActionsCount => "enforcement.actions_count",
            MetricName::EnforcementActiveEnforcements => "enforcement.active_enforcements",
            MetricName::EnforcementEscalationLevel => "enforcement.escalation_level",
            MetricName::SystemHealthScore => "system.health_score",
            MetricName::SystemActiveComponents => "system.active_components",
            MetricName::SystemErrorRate => "system.error_rate",
        }
    }
}

impl std::fmt::Display for MetricName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MetricName {
    type Err = TokenOpsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .find(|m| m.as_str() == s)
            .copied()
            .ok_or_else(|| TokenOpsError::UnknownMetric(s.to_string()))
    }
}

impl Serialize for MetricName {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MetricName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOperator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "change")]
    Change,
    #[serde(rename = "rate")]
    Rate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Current,
    Average,
    Sum,
    Max,
    Min,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertCondition {
    pub metric: MetricName,
    pub operator: ConditionOperator,
    pub value: f64,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
            AlertSeverity::Emergency => write!(f, "emergency"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Threshold,
    Trend,
    Anomaly,
    Projection,
    Enforcement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertAction {
    Log,
    Emit,
    Webhook,
    Email,
    Slack,
    Nudge,
    SystemCommand { command: String },
}

impl AlertAction {
    pub fn kind(&self) -> &'static str {
        match self {
            AlertAction::Log => "log",
            AlertAction::Emit => "emit",
            AlertAction::Webhook => "webhook",
            AlertAction::Email => "email",
            AlertAction::Slack => "slack",
            AlertAction::Nudge => "nudge",
            AlertAction::SystemCommand { .. } => "system_command",
        }
    }
}

/// One step of an escalation ladder. Delays are measured from the alert's
/// trigger time, not from the previous step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationLevel {
    pub delay_minutes: u64,
    pub severity: AlertSeverity,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub kind: RuleKind,
    pub severity: AlertSeverity,
    pub conditions: Vec<AlertCondition>,
    pub cooldown_minutes: u64,
    /// Triggers allowed per hour window; the window resets on hourly
    /// boundaries.
    pub max_frequency: u32,
    #[serde(default)]
    pub escalations: Vec<EscalationLevel>,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl AlertRule {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(TokenOpsError::validation("rule id cannot be empty"));
        }
        if self.conditions.is_empty() {
            return Err(TokenOpsError::validation(format!(
                "rule {} has no conditions",
                self.id
            )));
        }
        if self.max_frequency == 0 {
            return Err(TokenOpsError::validation(format!(
                "rule {} maxFrequency must be positive",
                self.id
            )));
        }
        for (i, level) in self.escalations.iter().enumerate() {
            if level.delay_minutes == 0 {
                return Err(TokenOpsError::validation(format!(
                    "rule {} escalation {} delay must be positive",
                    self.id, i
                )));
            }
        }
        Ok(())
    }
}

/// Execution record of one dispatched action on one alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionExecution {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertInstance {
    pub id: Uuid,
    pub rule_id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    /// Metric values observed at trigger time, keyed by metric name.
    pub metric_values: HashMap<String, f64>,
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    pub escalation_level: usize,
    /// Armed while an escalation step is pending; cleared by acknowledge and
    /// resolve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_escalation_at: Option<DateTime<Utc>>,
    pub executions: Vec<ActionExecution>,
}

impl AlertInstance {
    pub fn new(
        rule: &AlertRule,
        message: String,
        metric_values: HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Self {
        let next_escalation_at = rule
            .escalations
            .first()
            .map(|level| now + chrono::Duration::minutes(level.delay_minutes as i64));

        Self {
            id: Uuid::new_v4(),
            rule_id: rule.id.clone(),
            timestamp: now,
            severity: rule.severity,
            title: rule.name.clone(),
            message,
            metric_values,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved: false,
            resolved_at: None,
            resolution: None,
            escalation_level: 0,
            next_escalation_at,
            executions: Vec::new(),
        }
    }

    pub fn notice(&self) -> AlertNotice {
        AlertNotice {
            alert_id: self.id,
            rule_id: self.rule_id.clone(),
            severity: self.severity.to_string(),
            title: self.title.clone(),
            message: self.message.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Built-in rule set; config rules override by id and append otherwise.
pub fn builtin_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            id: "inspector-high-usage".to_string(),
            name: "Inspector High Token Usage".to_string(),
            kind: RuleKind::Threshold,
            severity: AlertSeverity::Warning,
            conditions: vec![AlertCondition {
                metric: MetricName::InspectorUsagePercentage,
                operator: ConditionOperator::Gte,
                value: 70.0,
                aggregation: Aggregation::Current,
                timeframe_secs: None,
            }],
            cooldown_minutes: 10,
            max_frequency: 4,
            escalations: vec![EscalationLevel {
                delay_minutes: 5,
                severity: AlertSeverity::Critical,
                actions: vec![AlertAction::Nudge],
            }],
            actions: vec![AlertAction::Log, AlertAction::Nudge],
            enabled: true,
        },
        AlertRule {
            id: "orchestrator-high-usage".to_string(),
            name: "Orchestrator High Token Usage".to_string(),
            kind: RuleKind::Threshold,
            severity: AlertSeverity::Warning,
            conditions: vec![AlertCondition {
                metric: MetricName::OrchestratorUsagePercentage,
                operator: ConditionOperator::Gte,
                value: 70.0,
                aggregation: Aggregation::Current,
                timeframe_secs: None,
            }],
            cooldown_minutes: 10,
            max_frequency: 4,
            escalations: vec![EscalationLevel {
                delay_minutes: 5,
                severity: AlertSeverity::Critical,
                actions: vec![AlertAction::Nudge],
            }],
            actions: vec![AlertAction::Log, AlertAction::Nudge],
            enabled: true,
        },
        AlertRule {
            id: "provider-daily-critical".to_string(),
            name: "Provider Daily Limit Critical".to_string(),
            kind: RuleKind::Threshold,
            severity: AlertSeverity::Critical,
            conditions: vec![AlertCondition {
                metric: MetricName::ProviderDailyUsagePercentage,
                operator: ConditionOperator::Gt,
                value: 80.0,
                aggregation: Aggregation::Current,
                timeframe_secs: None,
            }],
            cooldown_minutes: 30,
            max_frequency: 2,
            escalations: vec![EscalationLevel {
                delay_minutes: 15,
                severity: AlertSeverity::Emergency,
                actions: vec![AlertAction::Nudge, AlertAction::Emit],
            }],
            actions: vec![AlertAction::Log, AlertAction::Emit],
            enabled: true,
        },
        AlertRule {
            id: "hourly-cost-spike".to_string(),
            name: "Hourly Cost Spike".to_string(),
            kind: RuleKind::Trend,
            severity: AlertSeverity::Warning,
            conditions: vec![AlertCondition {
                metric: MetricName::CostHourlyTotal,
                operator: ConditionOperator::Gt,
                value: 5.0,
                aggregation: Aggregation::Current,
                timeframe_secs: None,
            }],
            cooldown_minutes: 60,
            max_frequency: 2,
            escalations: Vec::new(),
            actions: vec![AlertAction::Log],
            enabled: true,
        },
        AlertRule {
            id: "enforcement-action-triggered".to_string(),
            name: "Enforcement Action Triggered".to_string(),
            kind: RuleKind::Enforcement,
            severity: AlertSeverity::Info,
            conditions: vec![AlertCondition {
                metric: MetricName::EnforcementActionsCount,
                operator: ConditionOperator::Change,
                value: 0.0,
                aggregation: Aggregation::Current,
                timeframe_secs: None,
            }],
            cooldown_minutes: 5,
            max_frequency: 12,
            escalations: Vec::new(),
            actions: vec![AlertAction::Log, AlertAction::Emit],
            enabled: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_metric_name_round_trip() {
        for metric in MetricName::ALL {
            let parsed: MetricName = metric.as_str().parse().unwrap();
            assert_eq!(parsed, *metric);
        }
    }

    #[test]
    fn test_unknown_metric_rejected() {
        assert_matches!(
            "inspector.unknown_thing".parse::<MetricName>(),
            Err(TokenOpsError::UnknownMetric(_))
        );
    }

    #[test]
    fn test_metric_name_serde_uses_dotted_names() {
        let json = serde_json::to_string(&MetricName::CostHourlyTotal).unwrap();
        assert_eq!(json, "\"cost.hourly_total\"");

        let parsed: MetricName = serde_json::from_str("\"system.health_score\"").unwrap();
        assert_eq!(parsed, MetricName::SystemHealthScore);

        assert!(serde_json::from_str::<MetricName>("\"nope.nothing\"").is_err());
    }

    #[test]
    fn test_builtin_rules_are_valid() {
        for rule in builtin_rules() {
            rule.validate().unwrap();
        }
    }

    #[test]
    fn test_rule_without_conditions_invalid() {
        let mut rule = builtin_rules().remove(0);
        rule.conditions.clear();
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_operator_serde_symbols() {
        let json = serde_json::to_string(&ConditionOperator::Gte).unwrap();
        assert_eq!(json, "\">=\"");
        let parsed: ConditionOperator = serde_json::from_str("\"change\"").unwrap();
        assert_eq!(parsed, ConditionOperator::Change);
    }

    #[test]
    fn test_instance_arms_first_escalation() {
        let rule = builtin_rules().remove(0);
        let now = Utc::now();
        let instance = AlertInstance::new(&rule, "msg".into(), HashMap::new(), now);

        assert_eq!(
            instance.next_escalation_at,
            Some(now + chrono::Duration::minutes(5))
        );
        assert_eq!(instance.severity, AlertSeverity::Warning);
    }
}
