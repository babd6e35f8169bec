//! Periodic unified metric snapshots. A single task produces snapshots;
//! readers share the latest one behind an `Arc`, so a reader never observes
//! a partially built snapshot.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::watch;

use crate::accounting::{Accountant, LimitPrediction, ProviderStatus};
use crate::alerting::AlertingEngine;
use crate::events::{AlertNotice, EventBus, MonitorEvent};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSummary {
    pub provider_id: String,
    pub display_name: String,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub daily_percentage: f64,
    pub status: ProviderStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedTokenMetrics {
    pub total_tokens_used: u64,
    pub total_cost: Decimal,
    pub active_agents: usize,
    pub alerts: Vec<AlertNotice>,
    pub projections: Vec<LimitPrediction>,
    pub providers: Vec<ProviderSummary>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub snapshots_produced: u64,
    pub history_length: usize,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_snapshot_at: Option<DateTime<Utc>>,
}

pub struct DashboardAggregator {
    accountant: Arc<Accountant>,
    alerting: Arc<AlertingEngine>,
    bus: EventBus,
    latest: RwLock<Option<Arc<UnifiedTokenMetrics>>>,
    history: RwLock<VecDeque<Arc<UnifiedTokenMetrics>>>,
    retention: Duration,
    snapshots: AtomicU64,
    started_at: Instant,
}

impl DashboardAggregator {
    pub fn new(
        accountant: Arc<Accountant>,
        alerting: Arc<AlertingEngine>,
        bus: EventBus,
        retention_hours: u64,
    ) -> Self {
        Self {
            accountant,
            alerting,
            bus,
            latest: RwLock::new(None),
            history: RwLock::new(VecDeque::new()),
            retention: Duration::hours(retention_hours as i64),
            snapshots: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Build one snapshot, store it as latest, append it to history, and
    /// announce the refresh on the bus.
    pub async fn snapshot_once(&self) -> Arc<UnifiedTokenMetrics> {
        let (total_tokens_used, total_cost, _requests) = self.accountant.total_usage().await;
        let active_agents = self
            .accountant
            .active_agents_since(Duration::hours(24))
            .await;
        let provider_usage = self.accountant.provider_usage().await;
        let projections = self.accountant.limit_predictions().await;
        let alerts = self.alerting.active_notices().await;

        let providers = provider_usage
            .into_iter()
            .map(|u| ProviderSummary {
                provider_id: u.provider_id,
                display_name: u.display_name,
                total_tokens: u.total_tokens,
                total_cost: u.total_cost,
                daily_percentage: u.daily.percentage,
                status: u.status,
            })
            .collect();

        let snapshot = Arc::new(UnifiedTokenMetrics {
            total_tokens_used,
            total_cost,
            active_agents,
            alerts,
            projections,
            providers,
            timestamp: Utc::now(),
        });

        *self.latest.write().unwrap() = Some(Arc::clone(&snapshot));
        {
            let mut history = self.history.write().unwrap();
            history.push_back(Arc::clone(&snapshot));
            let cutoff = Utc::now() - self.retention;
            while history.front().is_some_and(|s| s.timestamp < cutoff) {
                history.pop_front();
            }
        }
        self.snapshots.fetch_add(1, Ordering::Relaxed);

        self.bus.publish(MonitorEvent::DataUpdate {
            component: "dashboard".to_string(),
        });

        snapshot
    }

    /// Latest snapshot, or `None` before the first one is produced.
    pub fn current_metrics(&self) -> Option<Arc<UnifiedTokenMetrics>> {
        self.latest.read().unwrap().clone()
    }

    /// History slice younger than `hours`, oldest first.
    pub fn metrics_history(&self, hours: i64) -> Vec<Arc<UnifiedTokenMetrics>> {
        let cutoff = Utc::now() - Duration::hours(hours);
        self.history
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        PerformanceMetrics {
            snapshots_produced: self.snapshots.load(Ordering::Relaxed),
            history_length: self.history.read().unwrap().len(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            last_snapshot_at: self.current_metrics().map(|s| s.timestamp),
        }
    }

    pub fn spawn_worker(
        self: &Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        aggregator.snapshot_once().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::UsageStore;
    use crate::alerting::{ActionDispatcher, MetricResolver};
    use crate::config::NotificationConfig;
    use crate::domain::UsageMetadata;

    fn aggregator() -> (Arc<DashboardAggregator>, Arc<Accountant>) {
        let bus = EventBus::new(256);
        let dir = tempfile::tempdir().unwrap();
        let accountant = Arc::new(Accountant::new(
            bus.clone(),
            UsageStore::new(dir.path().join("usage.json")),
            30,
        ));
        let resolver = Arc::new(MetricResolver::new(std::time::Duration::from_secs(60)));
        let dispatcher = ActionDispatcher::new(bus.clone(), NotificationConfig::default(), false);
        let alerting = Arc::new(AlertingEngine::new(bus.clone(), resolver, dispatcher, 7));
        (
            Arc::new(DashboardAggregator::new(
                Arc::clone(&accountant),
                alerting,
                bus,
                24,
            )),
            accountant,
        )
    }

    #[tokio::test]
    async fn test_no_metrics_before_first_snapshot() {
        let (aggregator, _) = aggregator();
        assert!(aggregator.current_metrics().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_reflects_usage() {
        let (aggregator, accountant) = aggregator();
        let meta = UsageMetadata::new()
            .with_provider("anthropic")
            .with_model("sonnet")
            .with_agent("inspector");
        accountant.record_usage(meta, 1000, 500).await.unwrap();

        let snapshot = aggregator.snapshot_once().await;
        assert_eq!(snapshot.total_tokens_used, 1500);
        assert_eq!(snapshot.active_agents, 1);
        assert!(snapshot
            .providers
            .iter()
            .any(|p| p.provider_id == "claude-code" && p.total_tokens == 1500));

        assert!(aggregator.current_metrics().is_some());
        assert_eq!(aggregator.metrics_history(1).len(), 1);
    }

    #[tokio::test]
    async fn test_performance_metrics_count_snapshots() {
        let (aggregator, _) = aggregator();
        aggregator.snapshot_once().await;
        aggregator.snapshot_once().await;

        let perf = aggregator.performance_metrics();
        assert_eq!(perf.snapshots_produced, 2);
        assert_eq!(perf.history_length, 2);
        assert!(perf.last_snapshot_at.is_some());
    }
}
