//! Typed event bus shared by every pipeline component.
//!
//! The event set is closed: components match on the variants they care about
//! and ignore the rest. There are no string-keyed subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::detector::DetectionEvent;
use crate::domain::UsageRecord;

/// Compact alert payload carried on the bus. The full `AlertInstance` stays
/// inside the alerting engine; consumers only need the notification surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertNotice {
    pub alert_id: Uuid,
    pub rule_id: String,
    pub severity: String,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A detection source produced a token observation.
    DetectionObserved(DetectionEvent),

    /// The accountant committed a usage record.
    UsageRecorded(UsageRecord),

    /// An agent crossed 90% of its provider's daily token limit.
    LimitWarning {
        provider_id: String,
        agent_id: String,
        percentage: f64,
    },

    /// An agent crossed 100% of its provider's daily token limit.
    LimitExceeded {
        provider_id: String,
        agent_id: String,
        percentage: f64,
    },

    /// A component crossed an enforcement threshold upward.
    EnforcementTriggered {
        component: String,
        action: String,
        current_usage: u64,
        limit: u64,
        percentage: f64,
        invasive: bool,
    },

    /// Published by the `Emit` alert action.
    Alert(AlertNotice),

    AlertTriggered(AlertNotice),
    AlertEscalated {
        alert_id: Uuid,
        level: usize,
        severity: String,
    },
    AlertAcknowledged {
        alert_id: Uuid,
    },
    AlertResolved {
        alert_id: Uuid,
    },

    /// Critical-or-worse alerts are duplicated on this variant so UI
    /// consumers can subscribe to the urgent stream alone.
    CriticalAlert(AlertNotice),

    /// Advisory message for an attached UI.
    NudgeRequest {
        title: String,
        message: String,
    },

    /// A component refreshed derived data; snapshot caches invalidate on it.
    DataUpdate {
        component: String,
    },

    Started,
    Stopped,
}

/// Broadcast-backed bus. Publishing never blocks and never fails: with no
/// live subscribers the event is dropped, which is fine for telemetry.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
