use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;

use llm_token_ops::{
    Accountant, Detector, EventBus, PatternRegistry, ProviderStatus, Recommendation, SourceKind,
    TokenOpsError, UsageMetadata, UsageStore,
};

fn accountant_at(dir: &tempfile::TempDir) -> Accountant {
    Accountant::new(
        EventBus::new(256),
        UsageStore::new(dir.path().join("usage.json")),
        30,
    )
}

fn meta(provider: &str, model: &str, agent: &str) -> UsageMetadata {
    UsageMetadata::new()
        .with_provider(provider)
        .with_model(model)
        .with_agent(agent)
}

#[tokio::test]
async fn detection_line_attributes_and_prices() {
    // End-to-end: raw line -> detection -> attributed, priced record.
    let dir = tempfile::tempdir().unwrap();
    let bus = EventBus::new(256);
    let detector = Detector::new(
        Arc::new(PatternRegistry::with_defaults().unwrap()),
        bus.clone(),
        Duration::from_millis(0),
        100,
    );
    let accountant = accountant_at(&dir);

    let event = detector
        .process_line(
            SourceKind::Api,
            "api",
            "anthropic usage: tokens: 1500 input: 1000 output: 500 model: claude-3-5-sonnet",
        )
        .unwrap();

    let record = accountant
        .record_detection(&event)
        .await
        .unwrap()
        .expect("attribution should succeed");

    assert_eq!(record.provider_id, "claude-code");
    assert_eq!(record.model_id, "claude-3-5-sonnet-20241022");
    assert_eq!(record.total_tokens, 1500);
    assert_eq!(record.input_tokens, 1000);
    assert_eq!(record.output_tokens, 500);
    // 1.0 * 0.003 + 0.5 * 0.015
    assert_eq!(record.cost, dec!(0.0105));
    assert_eq!(record.currency.as_str(), "USD");
}

#[tokio::test]
async fn unattributable_detection_is_dropped_silently() {
    let dir = tempfile::tempdir().unwrap();
    let bus = EventBus::new(64);
    let detector = Detector::new(
        Arc::new(PatternRegistry::with_defaults().unwrap()),
        bus,
        Duration::from_millis(0),
        100,
    );
    let accountant = accountant_at(&dir);

    let event = detector
        .process_line(SourceKind::Api, "api", "42 tokens used by mystery tool")
        .unwrap();

    // Generic pattern matched, but nothing points at a known provider.
    let result = accountant.record_detection(&event).await.unwrap();
    assert!(result.is_none());
    assert_eq!(accountant.record_count().await, 0);
}

#[tokio::test]
async fn provider_totals_equal_sum_of_records() {
    let dir = tempfile::tempdir().unwrap();
    let accountant = accountant_at(&dir);

    let mut expected_tokens = 0u64;
    for i in 1..=20 {
        let record = accountant
            .record_usage(meta("anthropic", "sonnet", "agent-a"), i * 10, i * 5)
            .await
            .unwrap();
        expected_tokens += record.total_tokens;
    }

    let usage = accountant.provider_usage().await;
    let claude = usage.iter().find(|u| u.provider_id == "claude-code").unwrap();
    assert_eq!(claude.total_tokens, expected_tokens);
    assert_eq!(claude.total_requests, 20);
    assert_eq!(claude.daily.tokens, expected_tokens);
}

#[tokio::test]
async fn status_ladder_against_daily_limit() {
    let dir = tempfile::tempdir().unwrap();
    let accountant = accountant_at(&dir);

    // claude-code daily limit is 5M tokens; 61% lands in warning.
    accountant
        .record_usage(meta("claude", "sonnet", "a"), 3_050_000, 0)
        .await
        .unwrap();
    let usage = accountant.provider_usage().await;
    let claude = usage.iter().find(|u| u.provider_id == "claude-code").unwrap();
    assert_eq!(claude.status, ProviderStatus::Warning);

    // Push to 96% -> exceeded.
    accountant
        .record_usage(meta("claude", "sonnet", "a"), 1_750_000, 0)
        .await
        .unwrap();
    let usage = accountant.provider_usage().await;
    let claude = usage.iter().find(|u| u.provider_id == "claude-code").unwrap();
    assert_eq!(claude.status, ProviderStatus::Exceeded);
}

#[tokio::test]
async fn predictions_recommend_stop_near_limit() {
    let dir = tempfile::tempdir().unwrap();
    let accountant = accountant_at(&dir);

    // Burn ~98% of the daily limit across several records; whatever the
    // hourly spread, the remaining headroom is under two hours of burn.
    for _ in 0..10 {
        accountant
            .record_usage(meta("claude", "sonnet", "a"), 490_000, 0)
            .await
            .unwrap();
    }

    let predictions = accountant.limit_predictions().await;
    assert_eq!(predictions.len(), 1);
    let p = &predictions[0];
    assert_eq!(p.provider_id, "claude-code");
    assert_eq!(p.current_daily_tokens, 4_900_000);
    assert!(p.hours_to_limit < 2.0);
    assert_eq!(p.recommendation, Recommendation::Stop);
    assert!(p.confidence >= 0.1 && p.confidence <= 1.0);
}

#[tokio::test]
async fn zero_token_usage_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let accountant = accountant_at(&dir);
    assert_matches!(
        accountant
            .record_usage(meta("openai", "gpt-4o", "x"), 0, 0)
            .await,
        Err(TokenOpsError::InvalidTokenCount(_))
    );
}

#[tokio::test]
async fn persistence_round_trip_preserves_totals() {
    // Record usages spanning two providers, flush, reload into a fresh
    // accountant, and compare rolled-up totals bit-exactly.
    let dir = tempfile::tempdir().unwrap();
    let first = accountant_at(&dir);

    for i in 0..50 {
        first
            .record_usage(meta("anthropic", "sonnet", "agent-a"), 1000 + i, 500)
            .await
            .unwrap();
        first
            .record_usage(meta("openai", "gpt-4o-mini", "agent-b"), 2000, 100 + i)
            .await
            .unwrap();
    }
    let before = first.provider_usage().await;
    first.flush().await.unwrap();

    let second = accountant_at(&dir);
    second.load().await.unwrap();
    let after = second.provider_usage().await;

    assert_eq!(second.record_count().await, 100);
    for provider in &before {
        let reloaded = after
            .iter()
            .find(|u| u.provider_id == provider.provider_id)
            .unwrap();
        assert_eq!(reloaded.total_tokens, provider.total_tokens);
        assert_eq!(reloaded.total_cost, provider.total_cost);
        assert_eq!(reloaded.total_requests, provider.total_requests);
    }
}

#[tokio::test]
async fn disabled_provider_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let first = accountant_at(&dir);
    first.set_provider_enabled("gemini", false).await.unwrap();
    first.flush().await.unwrap();

    let second = accountant_at(&dir);
    second.load().await.unwrap();
    let gemini = second
        .providers()
        .await
        .into_iter()
        .find(|p| p.id == "gemini")
        .unwrap();
    assert!(!gemini.enabled);

    // Disabled providers are excluded from usage rollups.
    assert!(!second
        .provider_usage()
        .await
        .iter()
        .any(|u| u.provider_id == "gemini"));
}
