use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use llm_token_ops::monitor::health::SystemStatus;
use llm_token_ops::{
    ComponentStatus, MonitorConfig, SourceKind, TokenMonitor, UsageMetadata,
};

fn config_at(dir: &tempfile::TempDir) -> MonitorConfig {
    MonitorConfig {
        persist_path: dir.path().join("state/usage.json"),
        // Tight intervals keep the lifecycle tests fast.
        update_interval_ms: 200,
        snapshot_interval_secs: 1,
        check_interval_secs: 1,
        debounce_time_ms: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn lifecycle_start_stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let monitor = Arc::new(TokenMonitor::new(config_at(&dir)).unwrap());

    monitor.initialize().await.unwrap();
    assert_eq!(monitor.system_health().status, SystemStatus::Offline);

    monitor.start().await.unwrap();
    monitor.start().await.unwrap();
    assert!(monitor.is_running());
    assert_eq!(monitor.system_health().status, SystemStatus::Healthy);

    monitor.stop().await;
    monitor.stop().await;
    assert!(!monitor.is_running());
    assert_eq!(monitor.system_health().status, SystemStatus::Offline);

    // The state file exists after a clean stop.
    assert!(dir.path().join("state/usage.json").exists());
}

#[tokio::test]
async fn detection_flows_into_accounting_and_enforcement() {
    let dir = tempfile::tempdir().unwrap();
    let monitor = Arc::new(TokenMonitor::new(config_at(&dir)).unwrap());
    monitor.initialize().await.unwrap();
    monitor.start().await.unwrap();

    // A line naming the inspector agent routes into both the accountant
    // and the inspector's component cap.
    monitor.detector().process_line(
        SourceKind::Terminal,
        "pane-0",
        "claude usage: tokens: 360000 input: 300000 output: 60000 model: claude-3-5-sonnet agent: inspector",
    );

    tokio::time::sleep(Duration::from_millis(300)).await;

    let usage = monitor.provider_usage().await;
    let claude = usage.iter().find(|u| u.provider_id == "claude-code").unwrap();
    assert_eq!(claude.total_tokens, 360_000);

    let enforcement = monitor.enforcement_status();
    let inspector = enforcement
        .components
        .iter()
        .find(|c| c.name == "inspector")
        .unwrap();
    assert_eq!(inspector.current_usage, 360_000);
    // 360k of the 500k inspector cap is warning territory.
    assert_eq!(inspector.status, ComponentStatus::Warning);

    monitor.stop().await;
}

#[tokio::test]
async fn monitoring_data_is_cached_and_complete() {
    let dir = tempfile::tempdir().unwrap();
    let monitor = Arc::new(TokenMonitor::new(config_at(&dir)).unwrap());
    monitor.initialize().await.unwrap();
    monitor.start().await.unwrap();

    monitor
        .accountant()
        .record_usage(
            UsageMetadata::new()
                .with_provider("openai")
                .with_model("gpt-4o")
                .with_agent("agent-z"),
            5_000,
            1_000,
        )
        .await
        .unwrap();

    // Let the dashboard produce at least one snapshot.
    tokio::time::sleep(Duration::from_millis(1300)).await;

    let first = monitor.monitoring_data().await;
    assert!(first.token_metrics.is_some());
    let metrics = first.token_metrics.as_ref().unwrap();
    assert_eq!(metrics.total_tokens_used, 6_000);
    assert_eq!(metrics.active_agents, 1);

    // Within the cache TTL the same composite is returned.
    let second = monitor.monitoring_data().await;
    assert_eq!(first.generated_at, second.generated_at);

    let tui = monitor.tui_data().await;
    assert_eq!(tui.summary.total_tokens, 6_000);
    assert!(tui
        .details
        .providers
        .iter()
        .any(|p| p.name == "OpenAI" && p.tokens == 6_000));
    assert!(!tui.trends.is_empty());

    monitor.stop().await;
}

#[tokio::test]
async fn persistence_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let monitor = Arc::new(TokenMonitor::new(config_at(&dir)).unwrap());
        monitor.initialize().await.unwrap();
        monitor.start().await.unwrap();
        for _ in 0..10 {
            monitor
                .accountant()
                .record_usage(
                    UsageMetadata::new()
                        .with_provider("anthropic")
                        .with_model("haiku")
                        .with_agent("agent-a"),
                    1_000,
                    200,
                )
                .await
                .unwrap();
        }
        monitor.stop().await;
    }

    let monitor = Arc::new(TokenMonitor::new(config_at(&dir)).unwrap());
    monitor.initialize().await.unwrap();
    let usage = monitor.provider_usage().await;
    let claude = usage.iter().find(|u| u.provider_id == "claude-code").unwrap();
    assert_eq!(claude.total_tokens, 12_000);
    assert_eq!(claude.total_requests, 10);
}

#[tokio::test]
async fn file_source_loss_removes_only_that_source() {
    let dir = tempfile::tempdir().unwrap();
    let monitor = Arc::new(TokenMonitor::new(config_at(&dir)).unwrap());
    monitor.initialize().await.unwrap();
    monitor.start().await.unwrap();

    let kept_path = dir.path().join("kept.log");
    let doomed_path = dir.path().join("doomed.log");
    std::fs::File::create(&kept_path).unwrap();
    std::fs::File::create(&doomed_path).unwrap();

    let kept = monitor
        .detector()
        .watch_file(kept_path.clone())
        .await
        .unwrap();
    let doomed = monitor
        .detector()
        .watch_file(doomed_path.clone())
        .await
        .unwrap();
    assert_eq!(monitor.detector().active_sources().len(), 2);

    // Appended lines stream through the watcher.
    {
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&doomed_path)
            .unwrap();
        writeln!(f, "anthropic usage: tokens: 111 model: claude-3-5-sonnet").unwrap();
        f.sync_all().unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(monitor.detection_events(5).len(), 1);

    std::fs::remove_file(&doomed_path).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let sources = monitor.detector().active_sources();
    assert!(!sources.contains(&doomed));
    assert!(sources.contains(&kept));

    // The surviving source still produces detections.
    {
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&kept_path)
            .unwrap();
        writeln!(f, "anthropic usage: tokens: 222 model: claude-3-5-sonnet").unwrap();
        f.sync_all().unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(monitor.detection_events(5).len(), 2);

    monitor.stop().await;
}

#[tokio::test]
async fn process_source_streams_output_then_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let monitor = Arc::new(TokenMonitor::new(config_at(&dir)).unwrap());
    monitor.initialize().await.unwrap();
    monitor.start().await.unwrap();

    monitor
        .detector()
        .watch_process("echo anthropic usage: tokens: 99 model: claude-3-5-haiku")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    let events = monitor.detection_events(5);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].total_tokens, 99);
    // The process exited, so its source is gone.
    assert!(monitor.detector().active_sources().is_empty());

    monitor.stop().await;
}

#[tokio::test]
async fn invalid_config_fails_construction() {
    let config = MonitorConfig {
        check_interval_secs: 0,
        ..Default::default()
    };
    assert!(TokenMonitor::new(config).is_err());
}
