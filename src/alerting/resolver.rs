//! Metric resolver with short-TTL caching. The integration feeder pushes
//! fresh values; rule evaluation reads through the cache. A value older than
//! the TTL resolves to nothing, so rules fail closed on missing data.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use super::rules::{Aggregation, MetricName};

/// Samples kept per metric for change/rate/aggregation queries.
const HISTORY_DEPTH: usize = 128;

struct Entry {
    value: f64,
    updated_at: DateTime<Utc>,
    history: VecDeque<(DateTime<Utc>, f64)>,
}

pub struct MetricResolver {
    ttl: Duration,
    entries: RwLock<HashMap<MetricName, Entry>>,
}

impl MetricResolver {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(60)),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn push(&self, metric: MetricName, value: f64) {
        self.push_at(metric, value, Utc::now());
    }

    pub fn push_at(&self, metric: MetricName, value: f64, now: DateTime<Utc>) {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.entry(metric).or_insert_with(|| Entry {
            value,
            updated_at: now,
            history: VecDeque::with_capacity(HISTORY_DEPTH),
        });
        entry.value = value;
        entry.updated_at = now;
        if entry.history.len() >= HISTORY_DEPTH {
            entry.history.pop_front();
        }
        entry.history.push_back((now, value));
    }

    /// Current value, or `None` when the metric is unknown or stale.
    pub fn resolve(&self, metric: MetricName) -> Option<f64> {
        self.resolve_at(metric, Utc::now())
    }

    pub fn resolve_at(&self, metric: MetricName, now: DateTime<Utc>) -> Option<f64> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(&metric)?;
        if now - entry.updated_at > self.ttl {
            return None;
        }
        Some(entry.value)
    }

    /// Signed difference between the current value and the newest sample at
    /// or before `timeframe` ago (previous sample when no timeframe given).
    pub fn change(
        &self,
        metric: MetricName,
        timeframe: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let current = self.resolve_at(metric, now)?;
        let entries = self.entries.read().unwrap();
        let entry = entries.get(&metric)?;

        let baseline = match timeframe {
            Some(frame) => {
                let cutoff = now - frame;
                entry
                    .history
                    .iter()
                    .rev()
                    .find(|(ts, _)| *ts <= cutoff)
                    .map(|(_, v)| *v)?
            }
            None => {
                if entry.history.len() < 2 {
                    return None;
                }
                entry.history[entry.history.len() - 2].1
            }
        };

        Some(current - baseline)
    }

    /// Change per minute over `timeframe` (default: since the previous
    /// sample).
    pub fn rate(
        &self,
        metric: MetricName,
        timeframe: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let current = self.resolve_at(metric, now)?;
        let entries = self.entries.read().unwrap();
        let entry = entries.get(&metric)?;

        let (base_ts, base_value) = match timeframe {
            Some(frame) => {
                let cutoff = now - frame;
                entry
                    .history
                    .iter()
                    .rev()
                    .find(|(ts, _)| *ts <= cutoff)
                    .copied()?
            }
            None => {
                if entry.history.len() < 2 {
                    return None;
                }
                entry.history[entry.history.len() - 2]
            }
        };

        let minutes = (now - base_ts).num_milliseconds() as f64 / 60_000.0;
        if minutes <= 0.0 {
            return None;
        }
        Some((current - base_value) / minutes)
    }

    /// Aggregate over history inside `timeframe`; `Current` ignores history.
    pub fn aggregate(
        &self,
        metric: MetricName,
        aggregation: Aggregation,
        timeframe: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        if aggregation == Aggregation::Current {
            return self.resolve_at(metric, now);
        }

        let entries = self.entries.read().unwrap();
        let entry = entries.get(&metric)?;
        let cutoff = now - timeframe.unwrap_or(self.ttl);
        let samples: Vec<f64> = entry
            .history
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .map(|(_, v)| *v)
            .collect();

        if samples.is_empty() {
            return None;
        }

        match aggregation {
            Aggregation::Current => unreachable!(),
            Aggregation::Average => Some(samples.iter().sum::<f64>() / samples.len() as f64),
            Aggregation::Sum => Some(samples.iter().sum()),
            Aggregation::Max => samples.iter().copied().reduce(f64::max),
            Aggregation::Min => samples.iter().copied().reduce(f64::min),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> MetricResolver {
        MetricResolver::new(std::time::Duration::from_secs(60))
    }

    #[test]
    fn test_resolve_fresh_value() {
        let r = resolver();
        r.push(MetricName::CostHourlyTotal, 3.2);
        assert_eq!(r.resolve(MetricName::CostHourlyTotal), Some(3.2));
    }

    #[test]
    fn test_unknown_metric_resolves_none() {
        let r = resolver();
        assert_eq!(r.resolve(MetricName::SystemHealthScore), None);
    }

    #[test]
    fn test_stale_value_resolves_none() {
        let r = resolver();
        let old = Utc::now() - Duration::seconds(120);
        r.push_at(MetricName::CostHourlyTotal, 3.2, old);
        assert_eq!(r.resolve(MetricName::CostHourlyTotal), None);
    }

    #[test]
    fn test_change_against_previous_sample() {
        let r = resolver();
        let now = Utc::now();
        r.push_at(MetricName::EnforcementActionsCount, 2.0, now - Duration::seconds(30));
        r.push_at(MetricName::EnforcementActionsCount, 5.0, now);

        assert_eq!(
            r.change(MetricName::EnforcementActionsCount, None, now),
            Some(3.0)
        );
    }

    #[test]
    fn test_change_needs_history() {
        let r = resolver();
        r.push(MetricName::EnforcementActionsCount, 2.0);
        assert_eq!(
            r.change(MetricName::EnforcementActionsCount, None, Utc::now()),
            None
        );
    }

    #[test]
    fn test_rate_per_minute() {
        let r = resolver();
        let now = Utc::now();
        r.push_at(MetricName::TokensTotalUsage, 100.0, now - Duration::minutes(2));
        r.push_at(MetricName::TokensTotalUsage, 400.0, now);

        let rate = r
            .rate(MetricName::TokensTotalUsage, None, now)
            .unwrap();
        assert!((rate - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_average() {
        let r = resolver();
        let now = Utc::now();
        for (i, v) in [1.0, 2.0, 3.0].iter().enumerate() {
            r.push_at(
                MetricName::CostDailyTotal,
                *v,
                now - Duration::seconds(30 - i as i64 * 10),
            );
        }

        let avg = r
            .aggregate(
                MetricName::CostDailyTotal,
                Aggregation::Average,
                Some(Duration::minutes(5)),
                now,
            )
            .unwrap();
        assert!((avg - 2.0).abs() < 1e-9);
    }
}
