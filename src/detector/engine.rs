use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::domain::UsageMetadata;
use crate::events::{EventBus, MonitorEvent};

use super::patterns::{capture_str, capture_u64, PatternRegistry};

/// Stored raw lines are truncated to this many bytes.
const MAX_LINE_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Terminal,
    File,
    Process,
    Api,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Terminal => write!(f, "terminal"),
            SourceKind::File => write!(f, "file"),
            SourceKind::Process => write!(f, "process"),
            SourceKind::Api => write!(f, "api"),
        }
    }
}

/// Result of one pattern hit on one line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    pub source: SourceKind,
    pub source_id: String,
    pub line: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: u64,
    /// Cost extracted from the line itself. The accountant prices records
    /// from the model's pricing table; this is a hint only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_hint: Option<Decimal>,
    pub pattern: String,
    pub confidence: f64,
    pub metadata: UsageMetadata,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorStats {
    pub total_detections: u64,
    pub successful_extractions: u64,
    pub failed_extractions: u64,
    pub avg_processing_time_us: f64,
}

#[derive(Default)]
struct StatsInner {
    total_detections: u64,
    successful_extractions: u64,
    failed_extractions: u64,
    avg_processing_time_us: f64,
    processed_lines: u64,
}

impl StatsInner {
    fn observe(&mut self, elapsed: Duration) {
        self.processed_lines += 1;
        let us = elapsed.as_micros() as f64;
        self.avg_processing_time_us +=
            (us - self.avg_processing_time_us) / self.processed_lines as f64;
    }
}

pub(super) struct SourceHandle {
    pub kind: SourceKind,
    pub stop: tokio::sync::watch::Sender<bool>,
    pub task: tokio::task::JoinHandle<()>,
}

/// Tails text sources, matches registry patterns, and emits detection
/// events with per-source debounce. One reader task per source; extraction
/// and emission are synchronous on the reader.
pub struct Detector {
    registry: Arc<PatternRegistry>,
    bus: EventBus,
    debounce: Duration,
    max_cache_size: usize,
    last_activity: Mutex<HashMap<String, Instant>>,
    cache: Mutex<VecDeque<DetectionEvent>>,
    stats: Mutex<StatsInner>,
    pub(super) sources: Mutex<HashMap<String, SourceHandle>>,
}

impl Detector {
    pub fn new(
        registry: Arc<PatternRegistry>,
        bus: EventBus,
        debounce: Duration,
        max_cache_size: usize,
    ) -> Self {
        Self {
            registry,
            bus,
            debounce,
            max_cache_size,
            last_activity: Mutex::new(HashMap::new()),
            cache: Mutex::new(VecDeque::with_capacity(max_cache_size)),
            stats: Mutex::new(StatsInner::default()),
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Run one line through the debounce → scan → extract → emit pipeline.
    ///
    /// Returns the emitted event, or `None` when the line was debounced,
    /// matched no pattern, or yielded zero tokens.
    pub fn process_line(
        &self,
        source: SourceKind,
        source_id: &str,
        line: &str,
    ) -> Option<DetectionEvent> {
        let started = Instant::now();

        // Debounce: a line inside the window refreshes it, so activity must
        // go quiet for a full debounce interval before detection resumes.
        {
            let mut last = self.last_activity.lock().unwrap();
            if let Some(prev) = last.get(source_id) {
                if prev.elapsed() < self.debounce {
                    last.insert(source_id.to_string(), Instant::now());
                    trace!(source_id, "line debounced");
                    return None;
                }
            }
        }

        let patterns = self.registry.snapshot();
        let pattern = patterns.iter().find(|p| p.matches(line));

        let Some(pattern) = pattern else {
            self.record_failure(started);
            return None;
        };

        let input = pattern.input.as_ref().and_then(|re| capture_u64(re, line));
        let output = pattern.output.as_ref().and_then(|re| capture_u64(re, line));
        let total = pattern.total.as_ref().and_then(|re| capture_u64(re, line));

        // Token precedence: explicit total, else input+output, else input.
        let total_tokens = match (total, input, output) {
            (Some(t), _, _) => t,
            (None, Some(i), Some(o)) => i + o,
            (None, Some(i), None) => i,
            _ => {
                self.record_failure(started);
                return None;
            }
        };

        if total_tokens == 0 {
            self.record_failure(started);
            return None;
        }

        let cost_hint = pattern
            .cost
            .as_ref()
            .and_then(|re| capture_str(re, line))
            .and_then(|s| Decimal::from_str(&s).ok());

        let mut metadata = UsageMetadata::new();
        if let Some(re) = &pattern.provider {
            metadata.provider = capture_str(re, line);
        }
        if let Some(re) = &pattern.model {
            metadata.model = capture_str(re, line);
        }
        if let Some(re) = &pattern.operation {
            metadata.operation = capture_str(re, line);
        }
        if let Some(re) = &pattern.agent {
            metadata.agent = capture_str(re, line);
        }
        if let Some(re) = &pattern.timestamp {
            if let Some(raw) = capture_str(re, line) {
                metadata.extra.insert("timestamp".to_string(), raw);
            }
        }

        let mut stored_line = line.to_string();
        if stored_line.len() > MAX_LINE_LEN {
            let mut cut = MAX_LINE_LEN;
            while !stored_line.is_char_boundary(cut) {
                cut -= 1;
            }
            stored_line.truncate(cut);
        }

        let event = DetectionEvent {
            source,
            source_id: source_id.to_string(),
            line: stored_line,
            input_tokens: input,
            output_tokens: output,
            total_tokens,
            cost_hint,
            pattern: pattern.name.clone(),
            confidence: pattern.confidence,
            metadata,
            timestamp: Utc::now(),
        };

        {
            let mut cache = self.cache.lock().unwrap();
            if cache.len() >= self.max_cache_size {
                cache.pop_front();
            }
            cache.push_back(event.clone());
        }

        {
            let mut stats = self.stats.lock().unwrap();
            stats.total_detections += 1;
            stats.successful_extractions += 1;
            stats.observe(started.elapsed());
        }
        counter!("detector_events_total", 1);

        self.last_activity
            .lock()
            .unwrap()
            .insert(source_id.to_string(), Instant::now());

        self.bus.publish(MonitorEvent::DetectionObserved(event.clone()));

        Some(event)
    }

    fn record_failure(&self, started: Instant) {
        let mut stats = self.stats.lock().unwrap();
        stats.failed_extractions += 1;
        stats.observe(started.elapsed());
        drop(stats);
        counter!("detector_failed_extractions_total", 1);
    }

    pub fn stats(&self) -> DetectorStats {
        let stats = self.stats.lock().unwrap();
        DetectorStats {
            total_detections: stats.total_detections,
            successful_extractions: stats.successful_extractions,
            failed_extractions: stats.failed_extractions,
            avg_processing_time_us: stats.avg_processing_time_us,
        }
    }

    /// Cached events younger than `minutes`, oldest first.
    pub fn events_since(&self, minutes: i64) -> Vec<DetectionEvent> {
        let cutoff = Utc::now() - chrono::Duration::minutes(minutes);
        self.cache
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn registry(&self) -> &Arc<PatternRegistry> {
        &self.registry
    }

    /// Drop per-source debounce state, e.g. when a source restarts.
    pub(super) fn clear_debounce(&self, source_id: &str) {
        self.last_activity.lock().unwrap().remove(source_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::patterns::PatternRegistry;

    fn detector() -> Detector {
        Detector::new(
            Arc::new(PatternRegistry::with_defaults().unwrap()),
            EventBus::new(64),
            Duration::from_millis(50),
            8,
        )
    }

    #[test]
    fn test_total_takes_precedence() {
        let d = detector();
        let event = d
            .process_line(
                SourceKind::Api,
                "test",
                "anthropic usage: tokens: 1500 input: 1000 output: 500 model: claude-3-5-sonnet",
            )
            .unwrap();

        assert_eq!(event.total_tokens, 1500);
        assert_eq!(event.input_tokens, Some(1000));
        assert_eq!(event.output_tokens, Some(500));
        assert_eq!(event.pattern, "anthropic-usage");
        assert_eq!(event.metadata.model.as_deref(), Some("claude-3-5-sonnet"));
    }

    #[test]
    fn test_input_plus_output_fallback() {
        let d = detector();
        let event = d
            .process_line(
                SourceKind::Api,
                "test",
                r#"openai response: "prompt_tokens": 200, "completion_tokens": 100"#,
            )
            .unwrap();

        assert_eq!(event.total_tokens, 300);
    }

    #[test]
    fn test_unmatched_line_counts_failure() {
        let d = detector();
        assert!(d
            .process_line(SourceKind::Api, "test", "nothing to see here")
            .is_none());

        let stats = d.stats();
        assert_eq!(stats.total_detections, 0);
        assert_eq!(stats.failed_extractions, 1);
    }

    #[test]
    fn test_gate_without_tokens_is_no_match() {
        let d = detector();
        assert!(d
            .process_line(SourceKind::Api, "test", "claude is thinking...")
            .is_none());
        assert_eq!(d.stats().failed_extractions, 1);
    }

    #[test]
    fn test_debounce_suppresses_burst() {
        let d = detector();
        let line = "anthropic usage: tokens: 100";

        assert!(d.process_line(SourceKind::Api, "s1", line).is_some());
        assert!(d.process_line(SourceKind::Api, "s1", line).is_none());
        // Distinct source has independent debounce state.
        assert!(d.process_line(SourceKind::Api, "s2", line).is_some());

        std::thread::sleep(Duration::from_millis(60));
        assert!(d.process_line(SourceKind::Api, "s1", line).is_some());
    }

    #[test]
    fn test_ring_cache_evicts_fifo() {
        let d = detector();
        for i in 0..20 {
            d.process_line(
                SourceKind::Api,
                &format!("src-{}", i),
                &format!("anthropic usage: tokens: {}", 100 + i),
            );
        }

        let events = d.events_since(5);
        assert_eq!(events.len(), 8);
        assert_eq!(events.first().unwrap().total_tokens, 112);
        assert_eq!(events.last().unwrap().total_tokens, 119);
    }

    #[test]
    fn test_long_line_truncated() {
        let d = detector();
        let line = format!("anthropic usage: tokens: 50 {}", "x".repeat(2000));
        let event = d.process_line(SourceKind::Api, "test", &line).unwrap();
        assert!(event.line.len() <= MAX_LINE_LEN);
    }
}
