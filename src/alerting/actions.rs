//! Alert action dispatch. Every dispatch yields an `ActionExecution`
//! recorded on the alert instance; a failed or skipped action never aborts
//! the alert or suppresses later escalations.

use chrono::Utc;
use lettre::{
    message::header::ContentType, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::NotificationConfig;
use crate::events::{AlertNotice, EventBus, MonitorEvent};

use super::rules::{ActionExecution, AlertAction, AlertSeverity};

/// Hard ceiling per action; exceeding it records a failure and moves on.
const ACTION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ActionDispatcher {
    bus: EventBus,
    http: reqwest::Client,
    notifications: NotificationConfig,
    invasive_enabled: bool,
}

impl ActionDispatcher {
    pub fn new(bus: EventBus, notifications: NotificationConfig, invasive_enabled: bool) -> Self {
        Self {
            bus,
            http: reqwest::Client::new(),
            notifications,
            invasive_enabled,
        }
    }

    pub async fn dispatch(
        &self,
        action: &AlertAction,
        notice: &AlertNotice,
        severity: AlertSeverity,
    ) -> ActionExecution {
        let started = Instant::now();
        let result = tokio::time::timeout(
            ACTION_TIMEOUT,
            self.dispatch_inner(action, notice, severity),
        )
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => Err(format!(
                "action timed out after {}s",
                ACTION_TIMEOUT.as_secs()
            )),
        };

        let execution = ActionExecution {
            timestamp: Utc::now(),
            kind: action.kind().to_string(),
            success: outcome.is_ok(),
            error: outcome.err(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if let Some(err) = &execution.error {
            warn!(
                action = %execution.kind,
                alert = %notice.alert_id,
                error = %err,
                "alert action failed"
            );
        }

        execution
    }

    async fn dispatch_inner(
        &self,
        action: &AlertAction,
        notice: &AlertNotice,
        severity: AlertSeverity,
    ) -> Result<(), String> {
        match action {
            AlertAction::Log => {
                match severity {
                    AlertSeverity::Info => {
                        info!(rule = %notice.rule_id, title = %notice.title, message = %notice.message, "alert")
                    }
                    AlertSeverity::Warning => {
                        warn!(rule = %notice.rule_id, title = %notice.title, message = %notice.message, "alert")
                    }
                    _ => {
                        error!(rule = %notice.rule_id, title = %notice.title, message = %notice.message, "alert")
                    }
                }
                Ok(())
            }

            AlertAction::Emit => {
                self.bus.publish(MonitorEvent::Alert(notice.clone()));
                Ok(())
            }

            AlertAction::Nudge => {
                if !self.notifications.enable_nudge {
                    return Err("nudge notifications disabled".to_string());
                }
                self.bus.publish(MonitorEvent::NudgeRequest {
                    title: notice.title.clone(),
                    message: notice.message.clone(),
                });
                Ok(())
            }

            AlertAction::Webhook => {
                if !self.notifications.enable_webhooks {
                    return Err("webhook notifications disabled".to_string());
                }
                if self.notifications.webhook_urls.is_empty() {
                    return Err("no webhook urls configured".to_string());
                }

                let payload = json!({ "alert": notice });
                for url in &self.notifications.webhook_urls {
                    let response = self
                        .http
                        .post(url)
                        .json(&payload)
                        .send()
                        .await
                        .map_err(|e| format!("webhook {}: {}", url, e))?;
                    if !response.status().is_success() {
                        return Err(format!("webhook {}: status {}", url, response.status()));
                    }
                }
                Ok(())
            }

            AlertAction::Slack => {
                if !self.notifications.enable_slack {
                    return Err("slack notifications disabled".to_string());
                }
                let url = self
                    .notifications
                    .slack_webhook_url
                    .as_ref()
                    .ok_or_else(|| "no slack webhook url configured".to_string())?;

                let text = format!("*{}* [{}]\n{}", notice.title, severity, notice.message);
                let channels: Vec<Option<&String>> = if self.notifications.slack_channels.is_empty()
                {
                    vec![None]
                } else {
                    self.notifications.slack_channels.iter().map(Some).collect()
                };

                for channel in channels {
                    let mut payload = json!({ "text": text });
                    if let Some(channel) = channel {
                        payload["channel"] = json!(channel);
                    }
                    let response = self
                        .http
                        .post(url)
                        .json(&payload)
                        .send()
                        .await
                        .map_err(|e| format!("slack: {}", e))?;
                    if !response.status().is_success() {
                        return Err(format!("slack: status {}", response.status()));
                    }
                }
                Ok(())
            }

            AlertAction::Email => {
                if !self.notifications.enable_email {
                    return Err("email notifications disabled".to_string());
                }
                let server = self
                    .notifications
                    .smtp_server
                    .as_ref()
                    .ok_or_else(|| "no smtp server configured".to_string())?;
                if self.notifications.email_recipients.is_empty() {
                    return Err("no email recipients configured".to_string());
                }

                let from = self
                    .notifications
                    .smtp_from
                    .clone()
                    .unwrap_or_else(|| "token-ops@localhost".to_string());
                let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(server)
                    .map_err(|e| format!("smtp relay: {}", e))?
                    .build();

                for recipient in &self.notifications.email_recipients {
                    let message = Message::builder()
                        .from(from.parse().map_err(|e| format!("from address: {}", e))?)
                        .to(recipient
                            .parse()
                            .map_err(|e| format!("recipient {}: {}", recipient, e))?)
                        .subject(format!("[{}] {}", severity, notice.title))
                        .header(ContentType::TEXT_PLAIN)
                        .body(notice.message.clone())
                        .map_err(|e| format!("message build: {}", e))?;

                    transport
                        .send(message)
                        .await
                        .map_err(|e| format!("smtp send: {}", e))?;
                }
                Ok(())
            }

            AlertAction::SystemCommand { command } => {
                if !self.invasive_enabled {
                    return Err("system_command actions disabled".to_string());
                }

                let output = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .output()
                    .await
                    .map_err(|e| format!("command spawn: {}", e))?;

                if output.status.success() {
                    Ok(())
                } else {
                    Err(format!("command exited with {}", output.status))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn notice() -> AlertNotice {
        AlertNotice {
            alert_id: Uuid::new_v4(),
            rule_id: "test-rule".to_string(),
            severity: "warning".to_string(),
            title: "Test".to_string(),
            message: "message".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_log_action_always_succeeds() {
        let dispatcher =
            ActionDispatcher::new(EventBus::new(16), NotificationConfig::default(), false);
        let execution = dispatcher
            .dispatch(&AlertAction::Log, &notice(), AlertSeverity::Warning)
            .await;
        assert!(execution.success);
        assert_eq!(execution.kind, "log");
    }

    #[tokio::test]
    async fn test_nudge_publishes_on_bus() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let dispatcher = ActionDispatcher::new(bus, NotificationConfig::default(), false);

        let execution = dispatcher
            .dispatch(&AlertAction::Nudge, &notice(), AlertSeverity::Warning)
            .await;
        assert!(execution.success);

        match rx.try_recv().unwrap() {
            MonitorEvent::NudgeRequest { title, .. } => assert_eq!(title, "Test"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disabled_webhook_records_failure() {
        let dispatcher =
            ActionDispatcher::new(EventBus::new(16), NotificationConfig::default(), false);
        let execution = dispatcher
            .dispatch(&AlertAction::Webhook, &notice(), AlertSeverity::Warning)
            .await;
        assert!(!execution.success);
        assert!(execution.error.unwrap().contains("disabled"));
    }

    #[tokio::test]
    async fn test_system_command_gated() {
        let dispatcher =
            ActionDispatcher::new(EventBus::new(16), NotificationConfig::default(), false);
        let execution = dispatcher
            .dispatch(
                &AlertAction::SystemCommand {
                    command: "true".to_string(),
                },
                &notice(),
                AlertSeverity::Critical,
            )
            .await;
        assert!(!execution.success);
    }
}
