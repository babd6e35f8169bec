pub mod actions;
pub mod engine;
pub mod resolver;
pub mod rules;

pub use actions::ActionDispatcher;
pub use engine::AlertingEngine;
pub use resolver::MetricResolver;
pub use rules::{
    builtin_rules, ActionExecution, Aggregation, AlertAction, AlertCondition, AlertInstance,
    AlertRule, AlertSeverity, ConditionOperator, EscalationLevel, MetricName, RuleKind,
};
