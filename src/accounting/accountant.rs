use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::detector::DetectionEvent;
use crate::domain::{
    ModelPricing, Provider, Result, TokenOpsError, UsageMetadata, UsageRecord,
};
use crate::events::{EventBus, MonitorEvent};

use super::attribution::{builtin_providers, AttributionEngine};
use super::store::{PersistedState, UsageStore, STATE_VERSION};

/// Derived provider health against windowed quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Healthy,
    Warning,
    Critical,
    Exceeded,
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderStatus::Healthy => write!(f, "healthy"),
            ProviderStatus::Warning => write!(f, "warning"),
            ProviderStatus::Critical => write!(f, "critical"),
            ProviderStatus::Exceeded => write!(f, "exceeded"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowUsage {
    pub tokens: u64,
    pub cost: Decimal,
    pub requests: u64,
    pub limit: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    pub provider_id: String,
    pub display_name: String,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub total_requests: u64,
    pub avg_tokens_per_request: f64,
    pub daily: WindowUsage,
    pub weekly: WindowUsage,
    pub monthly: WindowUsage,
    pub status: ProviderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Stop,
    Caution,
    Upgrade,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitPrediction {
    pub provider_id: String,
    pub current_daily_tokens: u64,
    pub daily_limit: u64,
    pub avg_hourly_tokens: f64,
    pub hours_to_limit: f64,
    pub confidence: f64,
    pub recommendation: Recommendation,
}

/// Upstream source of refreshed model pricing. The default deployment has
/// none; providers keep their catalog pricing.
#[async_trait]
pub trait PricingSource: Send + Sync {
    async fn fetch(&self, provider: &Provider) -> Result<Vec<(String, ModelPricing)>>;
}

struct State {
    providers: Vec<Provider>,
    records: Vec<UsageRecord>,
    dirty: bool,
}

/// Attributes usage to provider/model/agent, prices it, persists it, and
/// answers rolled-up queries. Sole owner of providers and usage records.
pub struct Accountant {
    state: RwLock<State>,
    attribution: AttributionEngine,
    store: UsageStore,
    bus: EventBus,
    retention_days: i64,
    pricing_source: Option<Arc<dyn PricingSource>>,
}

impl Accountant {
    pub fn new(bus: EventBus, store: UsageStore, retention_days: i64) -> Self {
        Self {
            state: RwLock::new(State {
                providers: builtin_providers(),
                records: Vec::new(),
                dirty: false,
            }),
            attribution: AttributionEngine::new(),
            store,
            bus,
            retention_days,
            pricing_source: None,
        }
    }

    pub fn with_pricing_source(mut self, source: Arc<dyn PricingSource>) -> Self {
        self.pricing_source = Some(source);
        self
    }

    /// Load persisted state; providers from disk replace the catalog so
    /// runtime mutations (pricing, enablement) survive restarts.
    pub async fn load(&self) -> Result<()> {
        if let Some(persisted) = self.store.load(self.retention_days)? {
            let mut state = self.state.write().await;
            if !persisted.providers.is_empty() {
                state.providers = persisted.providers;
            }
            state.records = persisted.usage_records;
            state.dirty = false;
            info!(
                records = state.records.len(),
                providers = state.providers.len(),
                "accountant state loaded"
            );
        }
        Ok(())
    }

    /// Record usage observed by the detector. Attribution failures are
    /// absorbed: the event is logged and dropped, never synthesized.
    pub async fn record_detection(&self, event: &DetectionEvent) -> Result<Option<UsageRecord>> {
        let mut metadata = event.metadata.clone();
        if metadata.agent.is_none() {
            metadata.agent = Some(event.source_id.clone());
        }
        if metadata.operation.is_none() {
            metadata.operation = Some("detection".to_string());
        }

        let (input, output) = split_tokens(event);

        match self.record_usage(metadata, input, output).await {
            Ok(record) => Ok(Some(record)),
            Err(TokenOpsError::Attribution(reason)) => {
                warn!(source = %event.source_id, %reason, "detection dropped: no attribution");
                Ok(None)
            }
            Err(TokenOpsError::ProviderNotFound(provider)) => {
                warn!(source = %event.source_id, %provider, "detection dropped: provider missing");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Directly record a usage. The provider must resolve and be enabled;
    /// zero-token records are rejected.
    pub async fn record_usage(
        &self,
        metadata: UsageMetadata,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<UsageRecord> {
        if input_tokens + output_tokens == 0 {
            return Err(TokenOpsError::InvalidTokenCount(
                "zero-token usage rejected".to_string(),
            ));
        }

        let attribution = self
            .attribution
            .attribute(&metadata)
            .ok_or_else(|| TokenOpsError::Attribution("no provider gate matched".to_string()))?;

        // Resolve pricing under a read lock; the write lock below is held
        // only for the push and the limit-watch sums.
        let (provider_id, model_id, pricing, currency, daily_limit) = {
            let state = self.state.read().await;
            let provider = state
                .providers
                .iter()
                .find(|p| p.id == attribution.provider_id)
                .ok_or_else(|| TokenOpsError::ProviderNotFound(attribution.provider_id.clone()))?;

            if !provider.enabled {
                return Err(TokenOpsError::Attribution(format!(
                    "provider {} is disabled",
                    provider.id
                )));
            }

            let model = attribution
                .model_id
                .as_deref()
                .and_then(|m| provider.model(m))
                .or_else(|| provider.default_model())
                .ok_or_else(|| TokenOpsError::ModelNotFound {
                    provider: provider.id.clone(),
                    model: attribution.model_id.clone().unwrap_or_default(),
                })?;

            (
                provider.id.clone(),
                model.id.clone(),
                model.pricing.clone(),
                provider.pricing_policy.currency.clone(),
                provider.daily_token_limit(),
            )
        };

        let cost = pricing.cost(input_tokens, output_tokens);
        let agent_id = metadata.agent.clone().unwrap_or_else(|| "unknown".to_string());
        let operation = metadata.operation.clone().unwrap_or_else(|| "usage".to_string());

        let record = UsageRecord::new(
            provider_id.clone(),
            model_id,
            agent_id.clone(),
            operation,
            input_tokens,
            output_tokens,
            cost,
            currency,
        )
        .with_metadata(metadata);
        record.validate()?;

        let agent_daily_tokens = {
            let mut state = self.state.write().await;
            state.records.push(record.clone());
            state.dirty = true;

            let cutoff = Utc::now() - Duration::hours(24);
            state
                .records
                .iter()
                .filter(|r| {
                    r.provider_id == provider_id && r.agent_id == agent_id && r.timestamp >= cutoff
                })
                .map(|r| r.total_tokens)
                .sum::<u64>()
        };

        counter!("accountant_records_total", 1);
        self.bus.publish(MonitorEvent::UsageRecorded(record.clone()));

        // Limit watch: the producing agent's daily share of the provider cap.
        if daily_limit > 0 {
            let percentage = agent_daily_tokens as f64 / daily_limit as f64 * 100.0;
            if percentage > 100.0 {
                self.bus.publish(MonitorEvent::LimitExceeded {
                    provider_id: provider_id.clone(),
                    agent_id: agent_id.clone(),
                    percentage,
                });
            } else if percentage > 90.0 {
                self.bus.publish(MonitorEvent::LimitWarning {
                    provider_id: provider_id.clone(),
                    agent_id: agent_id.clone(),
                    percentage,
                });
            }
        }

        Ok(record)
    }

    /// Rolled-up usage per enabled provider with daily/weekly/monthly
    /// windows against the provider's derived limits.
    pub async fn provider_usage(&self) -> Vec<ProviderUsage> {
        let state = self.state.read().await;
        let now = Utc::now();

        state
            .providers
            .iter()
            .filter(|p| p.enabled)
            .map(|provider| {
                let records: Vec<&UsageRecord> = state
                    .records
                    .iter()
                    .filter(|r| r.provider_id == provider.id)
                    .collect();

                let total_tokens: u64 = records.iter().map(|r| r.total_tokens).sum();
                let total_cost: Decimal = records.iter().map(|r| r.cost).sum();
                let total_requests = records.len() as u64;
                let avg_tokens_per_request = if total_requests > 0 {
                    total_tokens as f64 / total_requests as f64
                } else {
                    0.0
                };

                let daily_limit = provider.daily_token_limit();
                let daily = window_usage(&records, now - Duration::hours(24), daily_limit);
                let weekly = window_usage(&records, now - Duration::days(7), daily_limit * 7);
                let monthly = window_usage(&records, now - Duration::days(30), daily_limit * 30);

                let max_pct = daily
                    .percentage
                    .max(weekly.percentage)
                    .max(monthly.percentage);

                ProviderUsage {
                    provider_id: provider.id.clone(),
                    display_name: provider.display_name.clone(),
                    total_tokens,
                    total_cost,
                    total_requests,
                    avg_tokens_per_request,
                    daily,
                    weekly,
                    monthly,
                    status: status_for(max_pct),
                }
            })
            .collect()
    }

    /// Forward estimates per provider with at least 3 records in the last
    /// 24 h, from the 24 hourly buckets of that window.
    pub async fn limit_predictions(&self) -> Vec<LimitPrediction> {
        let state = self.state.read().await;
        let now = Utc::now();
        let cutoff = now - Duration::hours(24);
        let mut predictions = Vec::new();

        for provider in state.providers.iter().filter(|p| p.enabled) {
            let recent: Vec<&UsageRecord> = state
                .records
                .iter()
                .filter(|r| r.provider_id == provider.id && r.timestamp >= cutoff)
                .collect();

            if recent.len() < 3 {
                continue;
            }

            let mut buckets = [0u64; 24];
            for record in &recent {
                let age_hours = (now - record.timestamp).num_hours().clamp(0, 23) as usize;
                buckets[23 - age_hours] += record.total_tokens;
            }

            let current_daily: u64 = buckets.iter().sum();
            let mean = current_daily as f64 / 24.0;
            if mean <= 0.0 {
                continue;
            }
            let variance = buckets
                .iter()
                .map(|&b| {
                    let d = b as f64 - mean;
                    d * d
                })
                .sum::<f64>()
                / 24.0;
            let confidence = (1.0 - variance / (mean * mean)).max(0.1);

            let daily_limit = provider.daily_token_limit();
            let remaining = daily_limit.saturating_sub(current_daily) as f64;
            let hours_to_limit = remaining / mean;

            let recommendation = if hours_to_limit < 2.0 {
                Recommendation::Stop
            } else if hours_to_limit < 6.0 {
                Recommendation::Caution
            } else if hours_to_limit < 12.0 && confidence < 0.5 {
                Recommendation::Upgrade
            } else {
                Recommendation::Continue
            };

            predictions.push(LimitPrediction {
                provider_id: provider.id.clone(),
                current_daily_tokens: current_daily,
                daily_limit,
                avg_hourly_tokens: mean,
                hours_to_limit,
                confidence,
                recommendation,
            });
        }

        predictions
    }

    pub async fn providers(&self) -> Vec<Provider> {
        self.state.read().await.providers.clone()
    }

    /// Add a provider; returns false when the id already exists.
    pub async fn add_provider(&self, provider: Provider) -> bool {
        let mut state = self.state.write().await;
        if state.providers.iter().any(|p| p.id == provider.id) {
            return false;
        }
        state.providers.push(provider);
        state.dirty = true;
        true
    }

    pub async fn set_provider_enabled(&self, provider_id: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let provider = state
            .providers
            .iter_mut()
            .find(|p| p.id == provider_id)
            .ok_or_else(|| TokenOpsError::ProviderNotFound(provider_id.to_string()))?;
        provider.enabled = enabled;
        state.dirty = true;
        Ok(())
    }

    /// Refresh pricing for auto-update providers. A fetch failure keeps the
    /// existing pricing untouched.
    pub async fn refresh_pricing(&self) {
        let Some(source) = self.pricing_source.clone() else {
            return;
        };

        let candidates: Vec<Provider> = {
            let state = self.state.read().await;
            state
                .providers
                .iter()
                .filter(|p| p.enabled && p.pricing_policy.auto_update)
                .cloned()
                .collect()
        };

        for provider in candidates {
            match source.fetch(&provider).await {
                Ok(updates) => {
                    let mut state = self.state.write().await;
                    if let Some(p) = state.providers.iter_mut().find(|p| p.id == provider.id) {
                        for (model_id, pricing) in updates {
                            if let Some(model) = p.models.iter_mut().find(|m| m.id == model_id) {
                                model.pricing = pricing;
                            }
                        }
                        state.dirty = true;
                        debug!(provider = %provider.id, "pricing refreshed");
                    }
                }
                Err(e) => {
                    warn!(provider = %provider.id, error = %e, "pricing refresh failed, keeping previous pricing");
                }
            }
        }
    }

    /// Shortest auto-update interval across enabled providers, if any.
    pub async fn pricing_refresh_interval(&self) -> Option<std::time::Duration> {
        let state = self.state.read().await;
        state
            .providers
            .iter()
            .filter(|p| p.enabled && p.pricing_policy.auto_update)
            .map(|p| p.pricing_policy.update_interval_secs)
            .min()
            .map(std::time::Duration::from_secs)
    }

    /// Drop records outside the rolling retention window.
    pub async fn sweep_retention(&self) {
        let cutoff = Utc::now() - Duration::days(self.retention_days);
        let mut state = self.state.write().await;
        let before = state.records.len();
        state.records.retain(|r| r.timestamp >= cutoff);
        if state.records.len() != before {
            state.dirty = true;
            debug!(
                pruned = before - state.records.len(),
                "usage records pruned by retention sweep"
            );
        }
    }

    /// Write the state file if anything changed since the last save. The
    /// snapshot is taken under the lock; the disk write happens outside it.
    pub async fn persist(&self) -> Result<bool> {
        let snapshot = {
            let mut state = self.state.write().await;
            if !state.dirty {
                return Ok(false);
            }
            state.dirty = false;
            PersistedState {
                version: STATE_VERSION,
                providers: state.providers.clone(),
                usage_records: state.records.clone(),
                last_saved: Utc::now(),
            }
        };

        if let Err(e) = self.store.save(&snapshot) {
            self.state.write().await.dirty = true;
            return Err(e);
        }
        Ok(true)
    }

    /// Unconditional save, used on clean shutdown.
    pub async fn flush(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.state.write().await;
            state.dirty = false;
            PersistedState {
                version: STATE_VERSION,
                providers: state.providers.clone(),
                usage_records: state.records.clone(),
                last_saved: Utc::now(),
            }
        };
        self.store.save(&snapshot)
    }

    pub fn spawn_persistence_worker(
        self: &Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let accountant = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if let Err(e) = accountant.flush().await {
                            error!(error = %e, "final accountant flush failed");
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = accountant.persist().await {
                            error!(error = %e, "accountant persistence failed, retrying next interval");
                        }
                    }
                }
            }
        })
    }

    /// (tokens, cost, requests) over records younger than `window`.
    pub async fn usage_totals_since(&self, window: Duration) -> (u64, Decimal, u64) {
        let cutoff = Utc::now() - window;
        let state = self.state.read().await;
        let mut tokens = 0u64;
        let mut cost = Decimal::ZERO;
        let mut requests = 0u64;
        for r in state.records.iter().filter(|r| r.timestamp >= cutoff) {
            tokens += r.total_tokens;
            cost += r.cost;
            requests += 1;
        }
        (tokens, cost, requests)
    }

    pub async fn total_usage(&self) -> (u64, Decimal, u64) {
        let state = self.state.read().await;
        let tokens = state.records.iter().map(|r| r.total_tokens).sum();
        let cost = state.records.iter().map(|r| r.cost).sum();
        (tokens, cost, state.records.len() as u64)
    }

    /// (input, output) token split over records younger than `window`.
    pub async fn io_totals_since(&self, window: Duration) -> (u64, u64) {
        let cutoff = Utc::now() - window;
        let state = self.state.read().await;
        let mut input = 0u64;
        let mut output = 0u64;
        for r in state.records.iter().filter(|r| r.timestamp >= cutoff) {
            input += r.input_tokens;
            output += r.output_tokens;
        }
        (input, output)
    }

    /// Distinct agents seen inside `window`.
    pub async fn active_agents_since(&self, window: Duration) -> usize {
        let cutoff = Utc::now() - window;
        let state = self.state.read().await;
        state
            .records
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .map(|r| r.agent_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }

    #[cfg(test)]
    pub(crate) async fn backdate_all_records(&self, by: Duration) {
        let mut state = self.state.write().await;
        for r in state.records.iter_mut() {
            r.timestamp -= by;
        }
    }
}

fn split_tokens(event: &DetectionEvent) -> (u64, u64) {
    match (event.input_tokens, event.output_tokens) {
        (Some(i), Some(o)) if i + o == event.total_tokens => (i, o),
        (Some(i), _) if i <= event.total_tokens => (i, event.total_tokens - i),
        _ => (event.total_tokens, 0),
    }
}

fn window_usage(records: &[&UsageRecord], cutoff: DateTime<Utc>, limit: u64) -> WindowUsage {
    let mut tokens = 0u64;
    let mut cost = Decimal::ZERO;
    let mut requests = 0u64;
    for r in records.iter().filter(|r| r.timestamp >= cutoff) {
        tokens += r.total_tokens;
        cost += r.cost;
        requests += 1;
    }
    let percentage = if limit > 0 {
        tokens as f64 / limit as f64 * 100.0
    } else {
        0.0
    };
    WindowUsage {
        tokens,
        cost,
        requests,
        limit,
        percentage,
    }
}

/// Strictly-greater-than ladder: exactly 95% is critical, not exceeded.
fn status_for(max_percentage: f64) -> ProviderStatus {
    if max_percentage > 95.0 {
        ProviderStatus::Exceeded
    } else if max_percentage > 80.0 {
        ProviderStatus::Critical
    } else if max_percentage > 60.0 {
        ProviderStatus::Warning
    } else {
        ProviderStatus::Healthy
    }
}
