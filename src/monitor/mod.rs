//! Integration layer: composes detector, accountant, enforcer, dashboard,
//! and alerting over the shared bus; owns lifecycle, health, the resolver
//! feeder, and the cached read API.

pub mod health;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::accounting::{Accountant, LimitPrediction, ProviderUsage, UsageStore};
use crate::alerting::{ActionDispatcher, AlertInstance, AlertingEngine, MetricName, MetricResolver};
use crate::config::MonitorConfig;
use crate::dashboard::{DashboardAggregator, PerformanceMetrics, UnifiedTokenMetrics};
use crate::detector::{DetectionEvent, Detector, PatternRegistry};
use crate::domain::Result;
use crate::enforcement::{CapEnforcer, EnforcementStatus};
use crate::events::{AlertNotice, EventBus, MonitorEvent};

use health::{ComponentHealth, HealthRegistry, SystemHealthReport, SystemStatus};

/// Resolver cache TTL; alert evaluation never reads values staler than this.
const RESOLVER_TTL: Duration = Duration::from_secs(60);
/// Composite snapshot cache TTL.
const SNAPSHOT_CACHE_TTL: Duration = Duration::from_secs(5);

const HEALTH_COMPONENTS: &[&str] = &[
    "accountant",
    "alerting",
    "dashboard",
    "detector",
    "enforcer",
    "integration",
];

/// Composite read-API payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringData {
    pub system_health: SystemHealthReport,
    pub token_metrics: Option<UnifiedTokenMetrics>,
    pub enforcement: EnforcementStatus,
    pub detections: Vec<DetectionEvent>,
    pub performance: PerformanceMetrics,
    pub alerts: Vec<AlertInstance>,
    pub projections: Vec<LimitPrediction>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuiSummary {
    pub system_status: SystemStatus,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub active_agents: usize,
    pub active_alerts: usize,
    pub active_enforcements: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuiProviderRow {
    pub name: String,
    pub tokens: u64,
    pub cost: Decimal,
    pub daily_percentage: f64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuiDetails {
    pub providers: Vec<TuiProviderRow>,
    pub components: Vec<ComponentHealth>,
    pub alerts: Vec<AlertNotice>,
    pub active_issues: Vec<String>,
    pub recent_detections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    pub tokens: u64,
    pub cost: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuiData {
    pub summary: TuiSummary,
    pub details: TuiDetails,
    pub trends: Vec<TrendPoint>,
}

pub struct TokenMonitor {
    config: MonitorConfig,
    bus: EventBus,
    detector: Arc<Detector>,
    accountant: Arc<Accountant>,
    enforcer: Arc<CapEnforcer>,
    alerting: Arc<AlertingEngine>,
    dashboard: Arc<DashboardAggregator>,
    health: Arc<HealthRegistry>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    snapshot_cache: Mutex<Option<(Instant, Arc<MonitoringData>)>>,
    running: AtomicBool,
}

impl TokenMonitor {
    /// Build the full pipeline from config. Configuration errors are fatal
    /// here, before anything starts.
    pub fn new(config: MonitorConfig) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::new(1024);
        let registry = Arc::new(PatternRegistry::with_defaults()?);
        let detector = Arc::new(Detector::new(
            Arc::clone(&registry),
            bus.clone(),
            Duration::from_millis(config.debounce_time_ms),
            config.max_cache_size,
        ));

        let accountant = Arc::new(Accountant::new(
            bus.clone(),
            UsageStore::new(config.persist_path.clone()),
            config.record_retention_days as i64,
        ));

        let enforcer = Arc::new(CapEnforcer::new(
            bus.clone(),
            &config.component_caps,
            config.enable_invasive_actions,
        ));

        let resolver = Arc::new(MetricResolver::new(RESOLVER_TTL));
        let dispatcher = ActionDispatcher::new(
            bus.clone(),
            config.notifications.clone(),
            config.enable_invasive_actions,
        );
        let alerting = Arc::new(AlertingEngine::new(
            bus.clone(),
            resolver,
            dispatcher,
            config.alert_retention_days as i64,
        ));

        let dashboard = Arc::new(DashboardAggregator::new(
            Arc::clone(&accountant),
            Arc::clone(&alerting),
            bus.clone(),
            config.retention_period_hours,
        ));

        Ok(Self {
            config,
            bus,
            detector,
            accountant,
            enforcer,
            alerting,
            dashboard,
            health: Arc::new(HealthRegistry::new(HEALTH_COMPONENTS)),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            snapshot_cache: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Load persistence and apply configured rule overrides.
    pub async fn initialize(&self) -> Result<()> {
        self.accountant.load().await?;
        self.alerting
            .apply_rule_overrides(&self.config.alert_rules)
            .await;
        info!("token monitor initialized");
        Ok(())
    }

    /// Start sources and periodic tasks. Idempotent while running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(shutdown_tx);

        let mut tasks = Vec::new();
        tasks.push(self.spawn_event_pump(shutdown_rx.clone()));

        if self.config.enable_real_time_detection {
            self.start_sources().await;
        }

        tasks.push(self.dashboard.spawn_worker(
            Duration::from_secs(self.config.snapshot_interval_secs),
            shutdown_rx.clone(),
        ));

        if self.config.enable_alerting {
            tasks.push(self.alerting.spawn_worker(
                Duration::from_secs(self.config.check_interval_secs),
                shutdown_rx.clone(),
            ));
        }

        tasks.push(self.accountant.spawn_persistence_worker(
            Duration::from_millis(self.config.update_interval_ms),
            shutdown_rx.clone(),
        ));

        tasks.push(self.spawn_feeder(shutdown_rx.clone()));
        tasks.push(self.spawn_retention_sweeper(shutdown_rx.clone()));

        if let Some(interval) = self.accountant.pricing_refresh_interval().await {
            tasks.push(self.spawn_pricing_worker(interval, shutdown_rx));
        }

        self.tasks.lock().unwrap().extend(tasks);

        // Initial health check and resolver feed before declaring started.
        for name in HEALTH_COMPONENTS {
            self.health.heartbeat(name);
        }
        self.feed_resolver().await;

        self.bus.publish(MonitorEvent::Started);
        info!("token monitor started");
        Ok(())
    }

    /// Stop components in reverse dependency order and flush persistence.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.detector.stop_all().await;

        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(true);
        }

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                warn!("worker task did not drain within the stop window");
            }
        }

        if let Err(e) = self.accountant.flush().await {
            warn!(error = %e, "persistence flush on stop failed");
        }

        self.health.mark_all_stopped();
        *self.snapshot_cache.lock().unwrap() = None;
        self.bus.publish(MonitorEvent::Stopped);
        info!("token monitor stopped");
    }

    /// Stop, quiesce briefly, start again.
    pub async fn reset(self: &Arc<Self>) -> Result<()> {
        self.stop().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.start().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start_sources(self: &Arc<Self>) {
        for path in &self.config.monitored_files {
            if let Err(e) = self.detector.watch_file(path.clone()).await {
                warn!(path = %path.display(), error = %e, "file source skipped");
            }
        }
        for command in &self.config.monitored_processes {
            if let Err(e) = self.detector.watch_process(command).await {
                warn!(command = %command, error = %e, "process source skipped");
            }
        }
        let poll = Duration::from_millis(self.config.update_interval_ms);
        for session in &self.config.monitored_multiplexer_sessions {
            if let Err(e) = self.detector.watch_multiplexer(session, poll).await {
                warn!(session = %session, error = %e, "multiplexer source skipped");
            }
        }
    }

    /// Forward detections into accounting and enforcement, and invalidate
    /// the snapshot cache on data updates.
    fn spawn_event_pump(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = rx.recv() => match event {
                        Ok(MonitorEvent::DetectionObserved(detection)) => {
                            monitor.handle_detection(&detection).await;
                        }
                        Ok(MonitorEvent::DataUpdate { .. }) => {
                            *monitor.snapshot_cache.lock().unwrap() = None;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "event pump lagged behind the bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    async fn handle_detection(&self, detection: &DetectionEvent) {
        self.health.heartbeat("detector");

        match self.accountant.record_detection(detection).await {
            Ok(Some(record)) => {
                self.health.heartbeat("accountant");
                if self.config.enable_cap_enforcement
                    && self
                        .enforcer
                        .component_names()
                        .iter()
                        .any(|c| c == &record.agent_id)
                {
                    if let Err(e) = self.enforcer.record_usage(
                        &record.agent_id,
                        record.total_tokens,
                        &record.metadata,
                    ) {
                        self.health.report_error("enforcer", e.to_string());
                    } else {
                        self.health.heartbeat("enforcer");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.health.report_error("accountant", e.to_string());
            }
        }
    }

    fn spawn_feeder(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = Duration::from_secs(monitor.config.check_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => monitor.feed_resolver().await,
                }
            }
        })
    }

    fn spawn_retention_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => monitor.accountant.sweep_retention().await,
                }
            }
        })
    }

    fn spawn_pricing_worker(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => monitor.accountant.refresh_pricing().await,
                }
            }
        })
    }

    /// Push fresh values for every metric family into the alerting
    /// resolver. Threshold rules read through its 60 s cache.
    pub async fn feed_resolver(&self) {
        let resolver = self.alerting.resolver();

        let enforcement = self.enforcer.current_status();
        for component in &enforcement.components {
            let (usage_metric, pct_metric) = match component.name.as_str() {
                "inspector" => (
                    MetricName::InspectorCurrentUsage,
                    MetricName::InspectorUsagePercentage,
                ),
                "orchestrator" => (
                    MetricName::OrchestratorCurrentUsage,
                    MetricName::OrchestratorUsagePercentage,
                ),
                _ => continue,
            };
            resolver.push(usage_metric, component.current_usage as f64);
            resolver.push(pct_metric, component.percentage);
        }
        resolver.push(
            MetricName::EnforcementActionsCount,
            self.enforcer.actions_count() as f64,
        );
        resolver.push(
            MetricName::EnforcementActiveEnforcements,
            enforcement.active_enforcements as f64,
        );
        resolver.push(
            MetricName::EnforcementEscalationLevel,
            self.alerting.max_escalation_level().await as f64,
        );

        let usage = self.accountant.provider_usage().await;
        let max_pct = |f: fn(&ProviderUsage) -> f64| {
            usage.iter().map(f).fold(0.0, f64::max)
        };
        resolver.push(
            MetricName::ProviderDailyUsagePercentage,
            max_pct(|u| u.daily.percentage),
        );
        resolver.push(
            MetricName::ProviderWeeklyUsagePercentage,
            max_pct(|u| u.weekly.percentage),
        );
        resolver.push(
            MetricName::ProviderMonthlyUsagePercentage,
            max_pct(|u| u.monthly.percentage),
        );

        let (hour_tokens, hour_cost, _) = self
            .accountant
            .usage_totals_since(chrono::Duration::hours(1))
            .await;
        let (_, day_cost, _) = self
            .accountant
            .usage_totals_since(chrono::Duration::hours(24))
            .await;
        let (total_tokens, _, _) = self.accountant.total_usage().await;
        let (input, output) = self
            .accountant
            .io_totals_since(chrono::Duration::hours(24))
            .await;

        let hour_cost_f = hour_cost.to_f64().unwrap_or(0.0);
        resolver.push(MetricName::CostHourlyTotal, hour_cost_f);
        resolver.push(
            MetricName::CostDailyTotal,
            day_cost.to_f64().unwrap_or(0.0),
        );
        resolver.push(MetricName::CostRate, hour_cost_f / 60.0);
        resolver.push(MetricName::TokensUsageRate, hour_tokens as f64 / 60.0);
        resolver.push(MetricName::TokensTotalUsage, total_tokens as f64);
        let efficiency = if input > 0 {
            (output as f64 / input as f64).min(1.0) * 100.0
        } else {
            0.0
        };
        resolver.push(MetricName::TokensEfficiencyScore, efficiency);

        let predictions = self.accountant.limit_predictions().await;
        if !predictions.is_empty() {
            let max_hourly = predictions
                .iter()
                .map(|p| p.avg_hourly_tokens)
                .fold(0.0, f64::max);
            let avg_confidence = predictions.iter().map(|p| p.confidence).sum::<f64>()
                / predictions.len() as f64;
            resolver.push(MetricName::ProjectionUsageIncreaseRate, max_hourly);
            resolver.push(MetricName::ProjectionConfidenceScore, avg_confidence);
        }
        // Rate-of-increase rules read this through change/rate operators.
        resolver.push(MetricName::ProjectionCostIncreaseRate, hour_cost_f);

        resolver.push(MetricName::SystemHealthScore, self.health.health_score());
        resolver.push(
            MetricName::SystemActiveComponents,
            self.health.active_components() as f64,
        );
        resolver.push(MetricName::SystemErrorRate, self.health.error_rate());

        // Passive components prove liveness through the feeder itself.
        self.health.heartbeat("integration");
        self.health.heartbeat("accountant");
        self.health.heartbeat("enforcer");
        if self.config.enable_alerting {
            self.health.heartbeat("alerting");
        }
        if self
            .dashboard
            .performance_metrics()
            .last_snapshot_at
            .is_some_and(|at| {
                Utc::now() - at
                    < chrono::Duration::seconds(2 * self.config.snapshot_interval_secs as i64)
            })
        {
            self.health.heartbeat("dashboard");
        }
        if self.config.enable_real_time_detection {
            self.health.heartbeat("detector");
        }
    }

    /// Composite monitoring payload, cached for 5 s. The cache is also
    /// invalidated by any data-update event.
    pub async fn monitoring_data(&self) -> Arc<MonitoringData> {
        if let Some((at, cached)) = self.snapshot_cache.lock().unwrap().as_ref() {
            if at.elapsed() < SNAPSHOT_CACHE_TTL {
                return Arc::clone(cached);
            }
        }

        let data = Arc::new(MonitoringData {
            system_health: self.system_health(),
            token_metrics: self
                .dashboard
                .current_metrics()
                .map(|m| (*m).clone()),
            enforcement: self.enforcer.current_status(),
            detections: self.detector.events_since(60),
            performance: self.dashboard.performance_metrics(),
            alerts: self.alerting.active_alerts().await,
            projections: self.accountant.limit_predictions().await,
            generated_at: Utc::now(),
        });

        *self.snapshot_cache.lock().unwrap() = Some((Instant::now(), Arc::clone(&data)));
        data
    }

    /// Compact, terminal-dashboard-ready adaptation of the monitoring data.
    pub async fn tui_data(&self) -> TuiData {
        let data = self.monitoring_data().await;

        let (total_tokens, total_cost, active_agents) = match &data.token_metrics {
            Some(m) => (m.total_tokens_used, m.total_cost, m.active_agents),
            None => (0, Decimal::ZERO, 0),
        };

        let providers = data
            .token_metrics
            .as_ref()
            .map(|m| {
                m.providers
                    .iter()
                    .map(|p| TuiProviderRow {
                        name: p.display_name.clone(),
                        tokens: p.total_tokens,
                        cost: p.total_cost,
                        daily_percentage: p.daily_percentage,
                        status: p.status.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut active_issues: Vec<String> = data
            .system_health
            .components
            .iter()
            .filter(|c| c.state != health::ComponentState::Running)
            .map(|c| format!("{} is {}", c.name, c.state))
            .collect();
        active_issues.extend(
            data.alerts
                .iter()
                .filter(|a| !a.acknowledged)
                .map(|a| a.title.clone()),
        );

        let trends = self
            .dashboard
            .metrics_history(self.config.retention_period_hours as i64)
            .iter()
            .rev()
            .take(60)
            .rev()
            .map(|s| TrendPoint {
                timestamp: s.timestamp,
                tokens: s.total_tokens_used,
                cost: s.total_cost,
            })
            .collect();

        TuiData {
            summary: TuiSummary {
                system_status: data.system_health.status,
                total_tokens,
                total_cost,
                active_agents,
                active_alerts: data.alerts.len(),
                active_enforcements: data.enforcement.active_enforcements,
            },
            details: TuiDetails {
                providers,
                components: data.system_health.components.clone(),
                alerts: data.alerts.iter().map(|a| a.notice()).collect(),
                active_issues,
                recent_detections: data.detections.len(),
            },
            trends,
        }
    }

    pub fn system_health(&self) -> SystemHealthReport {
        if !self.is_running() {
            return SystemHealthReport {
                status: SystemStatus::Offline,
                components: self.health.snapshot(),
                timestamp: Utc::now(),
            };
        }
        self.health.report()
    }

    pub async fn provider_usage(&self) -> Vec<ProviderUsage> {
        self.accountant.provider_usage().await
    }

    pub fn enforcement_status(&self) -> EnforcementStatus {
        self.enforcer.current_status()
    }

    pub fn detection_events(&self, minutes: i64) -> Vec<DetectionEvent> {
        self.detector.events_since(minutes)
    }

    pub fn detector(&self) -> &Arc<Detector> {
        &self.detector
    }

    pub fn accountant(&self) -> &Arc<Accountant> {
        &self.accountant
    }

    pub fn enforcer(&self) -> &Arc<CapEnforcer> {
        &self.enforcer
    }

    pub fn alerting(&self) -> &Arc<AlertingEngine> {
        &self.alerting
    }

    pub fn dashboard(&self) -> &Arc<DashboardAggregator> {
        &self.dashboard
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}
