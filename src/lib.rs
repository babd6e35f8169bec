//! LLM-TokenOps - Token telemetry and enforcement pipeline for LLM agent
//! fleets.
//!
//! Raw text lines from log files, terminal multiplexer panes, and process
//! output enter at one end; cost-attributed usage records, enforcement
//! decisions, and escalating alerts exit at the other.

pub mod accounting;
pub mod alerting;
pub mod config;
pub mod dashboard;
pub mod detector;
pub mod domain;
pub mod enforcement;
pub mod events;
pub mod monitor;
pub mod observability;

// Re-export commonly used types
pub use domain::{
    Currency, ModelPricing, ModelSpec, PricingPolicy, Provider, RateLimits, Result, TokenOpsError,
    UsageMetadata, UsageRecord,
};

pub use config::{ComponentCapConfig, MonitorConfig, NotificationConfig};

pub use detector::{
    builtin_patterns, DetectionEvent, DetectionPattern, Detector, DetectorStats, PatternRegistry,
    PatternSpec, SourceKind,
};

pub use accounting::{
    builtin_providers, Accountant, LimitPrediction, PricingSource, ProviderStatus, ProviderUsage,
    Recommendation, UsageStore,
};

pub use enforcement::{CapEnforcer, ComponentReport, ComponentStatus, EnforcementStatus};

pub use dashboard::{DashboardAggregator, PerformanceMetrics, ProviderSummary, UnifiedTokenMetrics};

pub use alerting::{
    builtin_rules, ActionExecution, Aggregation, AlertAction, AlertCondition, AlertInstance,
    AlertRule, AlertSeverity, AlertingEngine, ConditionOperator, EscalationLevel, MetricName,
    MetricResolver, RuleKind,
};

pub use events::{AlertNotice, EventBus, MonitorEvent};

pub use monitor::{
    health::{ComponentHealth, ComponentState, HealthRegistry, SystemHealthReport, SystemStatus},
    MonitoringData, TokenMonitor, TuiData, TuiDetails, TuiSummary,
};

pub use observability::{init_tracing, LoggingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library with default logging configuration.
pub fn init() -> Result<()> {
    observability::init_tracing(&LoggingConfig::default());
    Ok(())
}
