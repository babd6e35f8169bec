//! Provider and model attribution. Metadata is flattened to a lowercased
//! search blob and walked against an ordered matcher list; the first gate
//! match wins, mirroring the pattern registry's first-match semantics.

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal_macros::dec;

use crate::domain::{ModelPricing, ModelSpec, Provider, RateLimits, UsageMetadata};

#[derive(Debug, Clone)]
pub struct Attribution {
    pub provider_id: String,
    /// None when no model rule matched; the caller falls back to the
    /// provider's first model.
    pub model_id: Option<String>,
}

struct ModelRule {
    pattern: Regex,
    model_id: &'static str,
}

struct ProviderMatcher {
    provider_id: &'static str,
    gate: Regex,
    model_rules: Vec<ModelRule>,
}

static MATCHERS: Lazy<Vec<ProviderMatcher>> = Lazy::new(|| {
    let re = |p: &str| Regex::new(p).expect("built-in attribution regex");
    vec![
        ProviderMatcher {
            provider_id: "claude-code",
            gate: re(r"\b(anthropic|claude)\b"),
            model_rules: vec![
                ModelRule {
                    pattern: re(r"claude-3-5-sonnet|sonnet"),
                    model_id: "claude-3-5-sonnet-20241022",
                },
                ModelRule {
                    pattern: re(r"claude-3-opus|opus"),
                    model_id: "claude-3-opus-20240229",
                },
                ModelRule {
                    pattern: re(r"haiku"),
                    model_id: "claude-3-5-haiku-20241022",
                },
            ],
        },
        ProviderMatcher {
            provider_id: "openai",
            gate: re(r"\b(openai|gpt-?\d|o1)\b"),
            model_rules: vec![
                ModelRule {
                    pattern: re(r"gpt-4o-mini"),
                    model_id: "gpt-4o-mini",
                },
                ModelRule {
                    pattern: re(r"gpt-4o"),
                    model_id: "gpt-4o",
                },
                ModelRule {
                    pattern: re(r"\bo1\b"),
                    model_id: "o1",
                },
            ],
        },
        ProviderMatcher {
            provider_id: "gemini",
            gate: re(r"\b(gemini|vertex|google)\b"),
            model_rules: vec![
                ModelRule {
                    pattern: re(r"flash"),
                    model_id: "gemini-1.5-flash",
                },
                ModelRule {
                    pattern: re(r"pro"),
                    model_id: "gemini-1.5-pro",
                },
            ],
        },
    ]
});

pub struct AttributionEngine;

impl AttributionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Map metadata to a (provider, model) pair, or `None` when no provider
    /// gate matches. Records without attribution are dropped upstream.
    pub fn attribute(&self, metadata: &UsageMetadata) -> Option<Attribution> {
        let blob = metadata.search_blob();
        if blob.is_empty() {
            return None;
        }

        let matcher = MATCHERS.iter().find(|m| m.gate.is_match(&blob))?;
        let model_id = matcher
            .model_rules
            .iter()
            .find(|r| r.pattern.is_match(&blob))
            .map(|r| r.model_id.to_string());

        Some(Attribution {
            provider_id: matcher.provider_id.to_string(),
            model_id,
        })
    }
}

impl Default for AttributionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in provider catalog, created at initialization. Pricing is per
/// 1000 tokens in USD.
pub fn builtin_providers() -> Vec<Provider> {
    vec![
        Provider::new(
            "claude-code",
            "Claude Code",
            vec![
                ModelSpec::new(
                    "claude-3-5-sonnet-20241022",
                    200_000,
                    8_192,
                    ModelPricing::new(dec!(0.003), dec!(0.015)),
                )
                .with_capabilities(vec!["chat".into(), "tools".into(), "vision".into()]),
                ModelSpec::new(
                    "claude-3-opus-20240229",
                    200_000,
                    4_096,
                    ModelPricing::new(dec!(0.015), dec!(0.075)),
                )
                .with_capabilities(vec!["chat".into(), "tools".into()]),
                ModelSpec::new(
                    "claude-3-5-haiku-20241022",
                    200_000,
                    8_192,
                    ModelPricing::new(dec!(0.0008), dec!(0.004)),
                )
                .with_capabilities(vec!["chat".into(), "tools".into()]),
            ],
            RateLimits {
                requests_per_minute: 50,
                tokens_per_minute: 160_000,
                tokens_per_day: 5_000_000,
            },
        ),
        Provider::new(
            "openai",
            "OpenAI",
            vec![
                ModelSpec::new(
                    "gpt-4o",
                    128_000,
                    16_384,
                    ModelPricing::new(dec!(0.0025), dec!(0.01)),
                ),
                ModelSpec::new(
                    "gpt-4o-mini",
                    128_000,
                    16_384,
                    ModelPricing::new(dec!(0.00015), dec!(0.0006)),
                ),
                ModelSpec::new(
                    "o1",
                    200_000,
                    100_000,
                    ModelPricing::new(dec!(0.015), dec!(0.06)),
                ),
            ],
            RateLimits {
                requests_per_minute: 60,
                tokens_per_minute: 150_000,
                tokens_per_day: 4_000_000,
            },
        ),
        Provider::new(
            "gemini",
            "Google Gemini",
            vec![
                ModelSpec::new(
                    "gemini-1.5-pro",
                    2_000_000,
                    8_192,
                    ModelPricing::new(dec!(0.00125), dec!(0.005)),
                ),
                ModelSpec::new(
                    "gemini-1.5-flash",
                    1_000_000,
                    8_192,
                    ModelPricing::new(dec!(0.000075), dec!(0.0003)),
                ),
            ],
            RateLimits {
                requests_per_minute: 60,
                tokens_per_minute: 120_000,
                tokens_per_day: 4_000_000,
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anthropic_line_attributes_to_claude_code() {
        let meta = UsageMetadata::new()
            .with_provider("anthropic")
            .with_model("claude-3-5-sonnet");

        let attr = AttributionEngine::new().attribute(&meta).unwrap();
        assert_eq!(attr.provider_id, "claude-code");
        assert_eq!(attr.model_id.as_deref(), Some("claude-3-5-sonnet-20241022"));
    }

    #[test]
    fn test_unknown_model_falls_back_to_none() {
        let meta = UsageMetadata::new().with_provider("claude");
        let attr = AttributionEngine::new().attribute(&meta).unwrap();
        assert_eq!(attr.provider_id, "claude-code");
        assert!(attr.model_id.is_none());
    }

    #[test]
    fn test_no_provider_match_yields_none() {
        let meta = UsageMetadata::new().with_model("mystery-llm-9000");
        assert!(AttributionEngine::new().attribute(&meta).is_none());
    }

    #[test]
    fn test_empty_metadata_yields_none() {
        assert!(AttributionEngine::new()
            .attribute(&UsageMetadata::new())
            .is_none());
    }

    #[test]
    fn test_mini_matches_before_gpt_4o() {
        let meta = UsageMetadata::new().with_model("gpt-4o-mini");
        let attr = AttributionEngine::new().attribute(&meta).unwrap();
        assert_eq!(attr.model_id.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn test_builtin_catalog_ids_match_matchers() {
        let providers = builtin_providers();
        for matcher in MATCHERS.iter() {
            let provider = providers
                .iter()
                .find(|p| p.id == matcher.provider_id)
                .expect("matcher without catalog entry");
            for rule in &matcher.model_rules {
                assert!(
                    provider.model(rule.model_id).is_some(),
                    "model rule {} missing from catalog",
                    rule.model_id
                );
            }
        }
    }
}
