use chrono::{DateTime, Duration, Timelike, Utc};
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::events::{EventBus, MonitorEvent};

use super::actions::ActionDispatcher;
use super::resolver::MetricResolver;
use super::rules::{
    builtin_rules, AlertCondition, AlertInstance, AlertRule, AlertSeverity, ConditionOperator,
};

struct FrequencyWindow {
    hour_start: DateTime<Utc>,
    count: u32,
}

/// Evaluates rules against the metric resolver, triggers alerts with
/// cooldown and per-hour frequency limits, dispatches actions, and walks
/// escalation ladders over unacknowledged alerts.
pub struct AlertingEngine {
    rules: RwLock<Vec<AlertRule>>,
    active: RwLock<HashMap<Uuid, AlertInstance>>,
    history: RwLock<Vec<AlertInstance>>,
    frequency: RwLock<HashMap<String, FrequencyWindow>>,
    resolver: Arc<MetricResolver>,
    dispatcher: ActionDispatcher,
    bus: EventBus,
    retention_days: i64,
}

impl AlertingEngine {
    pub fn new(
        bus: EventBus,
        resolver: Arc<MetricResolver>,
        dispatcher: ActionDispatcher,
        retention_days: i64,
    ) -> Self {
        Self {
            rules: RwLock::new(builtin_rules()),
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            frequency: RwLock::new(HashMap::new()),
            resolver,
            dispatcher,
            bus,
            retention_days,
        }
    }

    /// Merge configured rules over the built-ins: same id replaces, new ids
    /// append. Rules must already be validated.
    pub async fn apply_rule_overrides(&self, overrides: &[AlertRule]) {
        let mut rules = self.rules.write().await;
        for incoming in overrides {
            match rules.iter_mut().find(|r| r.id == incoming.id) {
                Some(existing) => *existing = incoming.clone(),
                None => rules.push(incoming.clone()),
            }
        }
    }

    /// Add a rule. Idempotent: re-adding an existing id keeps the first
    /// definition and returns the same value — the rule is present.
    pub async fn add_rule(&self, rule: AlertRule) -> bool {
        let mut rules = self.rules.write().await;
        if !rules.iter().any(|r| r.id == rule.id) {
            rules.push(rule);
        }
        true
    }

    /// Remove a rule by id. Idempotent: repeat calls land in the same
    /// absent state and return the same value.
    pub async fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write().await;
        rules.retain(|r| r.id != rule_id);
        true
    }

    pub async fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().await.clone()
    }

    pub fn resolver(&self) -> &Arc<MetricResolver> {
        &self.resolver
    }

    pub async fn evaluate_once(&self) {
        self.evaluate_once_at(Utc::now()).await;
    }

    /// One evaluation pass at an explicit instant. Exposed so schedules stay
    /// deterministic under test.
    pub async fn evaluate_once_at(&self, now: DateTime<Utc>) {
        let rules: Vec<AlertRule> = self
            .rules
            .read()
            .await
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect();

        for rule in rules {
            if self.in_cooldown(&rule, now).await {
                continue;
            }
            if self.frequency_exhausted(&rule, now).await {
                continue;
            }

            let mut values = HashMap::new();
            let mut all_passed = true;
            for condition in &rule.conditions {
                match evaluate_condition(&self.resolver, condition, now) {
                    Some((observed, passed)) => {
                        values.insert(condition.metric.to_string(), observed);
                        if !passed {
                            all_passed = false;
                            break;
                        }
                    }
                    // Fail-closed: missing or stale metric means no trigger.
                    None => {
                        all_passed = false;
                        break;
                    }
                }
            }

            if all_passed {
                self.trigger(&rule, values, now).await;
            }
        }

        self.escalation_pass(now).await;
    }

    async fn in_cooldown(&self, rule: &AlertRule, now: DateTime<Utc>) -> bool {
        let cooldown = Duration::minutes(rule.cooldown_minutes as i64);
        self.active
            .read()
            .await
            .values()
            .any(|a| a.rule_id == rule.id && now - a.timestamp < cooldown)
    }

    async fn frequency_exhausted(&self, rule: &AlertRule, now: DateTime<Utc>) -> bool {
        let hour_start = hour_floor(now);
        let frequency = self.frequency.read().await;
        match frequency.get(&rule.id) {
            Some(window) if window.hour_start == hour_start => window.count >= rule.max_frequency,
            _ => false,
        }
    }

    async fn trigger(&self, rule: &AlertRule, values: HashMap<String, f64>, now: DateTime<Utc>) {
        let mut observed: Vec<String> = values
            .iter()
            .map(|(metric, value)| format!("{}={:.2}", metric, value))
            .collect();
        observed.sort();
        let message = format!("{} ({})", rule.name, observed.join(", "));

        let mut instance = AlertInstance::new(rule, message, values, now);
        let notice = instance.notice();

        info!(rule = %rule.id, alert = %instance.id, severity = %instance.severity, "alert triggered");
        counter!("alerts_triggered_total", 1);

        for action in &rule.actions {
            let execution = self
                .dispatcher
                .dispatch(action, &notice, instance.severity)
                .await;
            instance.executions.push(execution);
        }

        {
            let hour_start = hour_floor(now);
            let mut frequency = self.frequency.write().await;
            let window = frequency
                .entry(rule.id.clone())
                .or_insert(FrequencyWindow {
                    hour_start,
                    count: 0,
                });
            if window.hour_start != hour_start {
                window.hour_start = hour_start;
                window.count = 0;
            }
            window.count += 1;
        }

        self.bus.publish(MonitorEvent::AlertTriggered(notice.clone()));
        if instance.severity >= AlertSeverity::Critical {
            self.bus.publish(MonitorEvent::CriticalAlert(notice));
        }

        self.active.write().await.insert(instance.id, instance);
    }

    /// Apply due escalation steps to active, unacknowledged, unresolved
    /// alerts. Delays are measured from the alert's trigger time.
    async fn escalation_pass(&self, now: DateTime<Utc>) {
        let due: Vec<Uuid> = self
            .active
            .read()
            .await
            .values()
            .filter(|a| {
                !a.acknowledged
                    && !a.resolved
                    && a.next_escalation_at.is_some_and(|at| at <= now)
            })
            .map(|a| a.id)
            .collect();

        for alert_id in due {
            let Some((rule_id, level_index)) = self
                .active
                .read()
                .await
                .get(&alert_id)
                .map(|a| (a.rule_id.clone(), a.escalation_level))
            else {
                continue;
            };

            let level = {
                let rules = self.rules.read().await;
                rules
                    .iter()
                    .find(|r| r.id == rule_id)
                    .and_then(|r| r.escalations.get(level_index).cloned())
            };

            let Some(level) = level else {
                if let Some(instance) = self.active.write().await.get_mut(&alert_id) {
                    instance.next_escalation_at = None;
                }
                continue;
            };

            let next_delay = {
                let rules = self.rules.read().await;
                rules
                    .iter()
                    .find(|r| r.id == rule_id)
                    .and_then(|r| r.escalations.get(level_index + 1))
                    .map(|next| next.delay_minutes)
            };

            let notice = {
                let mut active = self.active.write().await;
                let Some(instance) = active.get_mut(&alert_id) else {
                    continue;
                };
                if instance.acknowledged || instance.resolved {
                    continue;
                }
                instance.severity = level.severity;
                instance.escalation_level += 1;
                instance.next_escalation_at = next_delay
                    .map(|minutes| instance.timestamp + Duration::minutes(minutes as i64));
                instance.notice()
            };

            info!(
                alert = %alert_id,
                level = level_index + 1,
                severity = %level.severity,
                "alert escalated"
            );

            for action in &level.actions {
                let execution = self.dispatcher.dispatch(action, &notice, level.severity).await;
                if let Some(instance) = self.active.write().await.get_mut(&alert_id) {
                    instance.executions.push(execution);
                }
            }

            self.bus.publish(MonitorEvent::AlertEscalated {
                alert_id,
                level: level_index + 1,
                severity: level.severity.to_string(),
            });
            if level.severity >= AlertSeverity::Critical {
                self.bus.publish(MonitorEvent::CriticalAlert(notice));
            }
        }
    }

    /// Idempotent: a second acknowledge is a no-op returning the same value.
    /// Acknowledging disarms any pending escalation.
    pub async fn acknowledge(&self, alert_id: Uuid, by: Option<String>) -> bool {
        {
            let mut active = self.active.write().await;
            if let Some(instance) = active.get_mut(&alert_id) {
                if !instance.acknowledged {
                    instance.acknowledged = true;
                    instance.acknowledged_by = by;
                    instance.acknowledged_at = Some(Utc::now());
                    instance.next_escalation_at = None;
                    self.bus.publish(MonitorEvent::AlertAcknowledged { alert_id });
                }
                return true;
            }
        }
        self.history.read().await.iter().any(|a| a.id == alert_id)
    }

    /// Idempotent: resolving removes the alert from the active set and
    /// disarms its escalation.
    pub async fn resolve(&self, alert_id: Uuid, resolution: Option<String>) -> bool {
        let removed = self.active.write().await.remove(&alert_id);
        match removed {
            Some(mut instance) => {
                instance.resolved = true;
                instance.resolved_at = Some(Utc::now());
                instance.resolution = resolution;
                instance.next_escalation_at = None;
                self.history.write().await.push(instance);
                self.bus.publish(MonitorEvent::AlertResolved { alert_id });
                true
            }
            None => self.history.read().await.iter().any(|a| a.id == alert_id),
        }
    }

    pub async fn active_alerts(&self) -> Vec<AlertInstance> {
        let mut alerts: Vec<AlertInstance> = self.active.read().await.values().cloned().collect();
        alerts.sort_by_key(|a| a.timestamp);
        alerts
    }

    pub async fn active_notices(&self) -> Vec<crate::events::AlertNotice> {
        self.active_alerts().await.iter().map(|a| a.notice()).collect()
    }

    pub async fn alert_history(&self) -> Vec<AlertInstance> {
        self.history.read().await.clone()
    }

    /// Highest escalation level among active alerts.
    pub async fn max_escalation_level(&self) -> usize {
        self.active
            .read()
            .await
            .values()
            .map(|a| a.escalation_level)
            .max()
            .unwrap_or(0)
    }

    /// Hourly sweep: prune resolved history past retention and stale
    /// frequency windows.
    pub async fn sweep_retention(&self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(self.retention_days);
        {
            let mut history = self.history.write().await;
            let before = history.len();
            history.retain(|a| a.timestamp >= cutoff);
            if history.len() != before {
                debug!(pruned = before - history.len(), "alert history pruned");
            }
        }
        {
            let mut frequency = self.frequency.write().await;
            frequency.retain(|_, w| now - w.hour_start < Duration::hours(2));
        }
    }

    pub fn spawn_worker(
        self: &Arc<Self>,
        check_interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut sweep_ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            sweep_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => engine.evaluate_once().await,
                    _ = sweep_ticker.tick() => engine.sweep_retention(Utc::now()).await,
                }
            }
        })
    }
}

fn hour_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Evaluate one condition. Returns the observed value and the verdict, or
/// `None` when the metric is unknown or stale.
fn evaluate_condition(
    resolver: &MetricResolver,
    condition: &AlertCondition,
    now: DateTime<Utc>,
) -> Option<(f64, bool)> {
    let timeframe = condition
        .timeframe_secs
        .map(|secs| Duration::seconds(secs as i64));

    match condition.operator {
        ConditionOperator::Change => {
            let delta = resolver.change(condition.metric, timeframe, now)?;
            Some((delta, delta > condition.value))
        }
        ConditionOperator::Rate => {
            let rate = resolver.rate(condition.metric, timeframe, now)?;
            Some((rate, rate > condition.value))
        }
        op => {
            let value = resolver.aggregate(condition.metric, condition.aggregation, timeframe, now)?;
            let passed = match op {
                ConditionOperator::Gt => value > condition.value,
                ConditionOperator::Gte => value >= condition.value,
                ConditionOperator::Lt => value < condition.value,
                ConditionOperator::Lte => value <= condition.value,
                ConditionOperator::Eq => (value - condition.value).abs() < f64::EPSILON,
                ConditionOperator::Ne => (value - condition.value).abs() >= f64::EPSILON,
                ConditionOperator::Change | ConditionOperator::Rate => unreachable!(),
            };
            Some((value, passed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::rules::MetricName;
    use crate::config::NotificationConfig;

    fn engine() -> (Arc<AlertingEngine>, EventBus) {
        let bus = EventBus::new(256);
        let resolver = Arc::new(MetricResolver::new(std::time::Duration::from_secs(60)));
        let dispatcher = ActionDispatcher::new(bus.clone(), NotificationConfig::default(), false);
        (
            Arc::new(AlertingEngine::new(bus.clone(), resolver, dispatcher, 7)),
            bus,
        )
    }

    #[tokio::test]
    async fn test_threshold_trigger() {
        let (engine, _bus) = engine();
        engine
            .resolver()
            .push(MetricName::InspectorUsagePercentage, 72.0);

        engine.evaluate_once().await;

        let active = engine.active_alerts().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_id, "inspector-high-usage");
        assert_eq!(active[0].severity, AlertSeverity::Warning);
        assert_eq!(
            active[0].metric_values.get("inspector.usage_percentage"),
            Some(&72.0)
        );
    }

    #[tokio::test]
    async fn test_missing_metric_fails_closed() {
        let (engine, _bus) = engine();
        engine.evaluate_once().await;
        assert!(engine.active_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat() {
        let (engine, _bus) = engine();
        engine
            .resolver()
            .push(MetricName::InspectorUsagePercentage, 72.0);

        engine.evaluate_once().await;
        engine.evaluate_once().await;

        assert_eq!(engine.active_alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_escalation_after_delay() {
        let (engine, _bus) = engine();
        engine
            .resolver()
            .push(MetricName::InspectorUsagePercentage, 72.0);

        let t0 = Utc::now();
        engine.evaluate_once_at(t0).await;

        // Resolver values age past the TTL by t0+6m, so only the
        // escalation pass does work on the second evaluation.
        engine.evaluate_once_at(t0 + Duration::minutes(6)).await;

        let active = engine.active_alerts().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, AlertSeverity::Critical);
        assert_eq!(active[0].escalation_level, 1);
        // The escalation's nudge action was recorded.
        assert!(active[0].executions.iter().any(|e| e.kind == "nudge"));
    }

    #[tokio::test]
    async fn test_acknowledge_cancels_escalation() {
        let (engine, _bus) = engine();
        engine
            .resolver()
            .push(MetricName::InspectorUsagePercentage, 72.0);

        let t0 = Utc::now();
        engine.evaluate_once_at(t0).await;
        let alert_id = engine.active_alerts().await[0].id;

        assert!(engine.acknowledge(alert_id, Some("operator".into())).await);
        engine.evaluate_once_at(t0 + Duration::minutes(6)).await;

        let active = engine.active_alerts().await;
        assert_eq!(active[0].severity, AlertSeverity::Warning);
        assert_eq!(active[0].escalation_level, 0);
        // Second acknowledge is a no-op with the same result.
        assert!(engine.acknowledge(alert_id, None).await);
    }

    #[tokio::test]
    async fn test_resolve_removes_from_active() {
        let (engine, _bus) = engine();
        engine
            .resolver()
            .push(MetricName::InspectorUsagePercentage, 72.0);
        engine.evaluate_once().await;

        let alert_id = engine.active_alerts().await[0].id;
        assert!(engine.resolve(alert_id, Some("fixed".into())).await);
        assert!(engine.active_alerts().await.is_empty());

        let history = engine.alert_history().await;
        assert_eq!(history.len(), 1);
        assert!(history[0].resolved);

        // Idempotent second resolve.
        assert!(engine.resolve(alert_id, None).await);
        assert_eq!(engine.alert_history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_alert_ids() {
        let (engine, _bus) = engine();
        let ghost = Uuid::new_v4();
        assert!(!engine.acknowledge(ghost, None).await);
        assert!(!engine.resolve(ghost, None).await);
    }

    #[tokio::test]
    async fn test_frequency_cap_within_hour() {
        let (engine, _bus) = engine();
        let t0 = hour_floor(Utc::now());

        // Resolve each alert immediately so cooldown never interferes;
        // only the frequency window should gate the fifth trigger.
        for i in 0..5 {
            let now = t0 + Duration::minutes(i * 11);
            engine
                .resolver()
                .push_at(MetricName::InspectorUsagePercentage, 72.0, now);
            engine.evaluate_once_at(now).await;
            for alert in engine.active_alerts().await {
                engine.resolve(alert.id, None).await;
            }
        }

        assert_eq!(engine.alert_history().await.len(), 4);

        // The next hour window admits triggers again.
        let next_hour = t0 + Duration::minutes(61);
        engine
            .resolver()
            .push_at(MetricName::InspectorUsagePercentage, 72.0, next_hour);
        engine.evaluate_once_at(next_hour).await;
        assert_eq!(engine.active_alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_add_remove_rule_idempotent() {
        let (engine, _bus) = engine();
        let rule = builtin_rules().remove(0);
        let count = engine.rules().await.len();

        // A repeat add of an existing id is a no-op with the same value.
        assert!(engine.add_rule(rule.clone()).await);
        assert!(engine.add_rule(rule.clone()).await);
        assert_eq!(engine.rules().await.len(), count);

        // A repeat remove is a no-op with the same value.
        assert!(engine.remove_rule(&rule.id).await);
        assert!(engine.remove_rule(&rule.id).await);
        assert_eq!(engine.rules().await.len(), count - 1);

        assert!(engine.add_rule(rule).await);
        assert_eq!(engine.rules().await.len(), count);
    }
}
