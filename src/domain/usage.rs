use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{Result, TokenOpsError};
use super::metadata::UsageMetadata;
use super::provider::Currency;

/// The canonical unit of accounting. Append-only; evicted by the retention
/// sweep after the rolling retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    /// Unique within a process lifetime.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    pub timestamp: DateTime<Utc>,

    pub provider_id: String,
    pub model_id: String,
    pub agent_id: String,
    pub operation: String,

    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,

    /// Derived from the model's pricing at record timestamp.
    pub cost: Decimal,
    pub currency: Currency,

    #[serde(default)]
    pub metadata: UsageMetadata,
}

impl UsageRecord {
    pub fn new(
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        agent_id: impl Into<String>,
        operation: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        cost: Decimal,
        currency: Currency,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            agent_id: agent_id.into(),
            operation: operation.into(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cost,
            currency,
            metadata: UsageMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: UsageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.total_tokens == 0 {
            return Err(TokenOpsError::InvalidTokenCount(
                "total tokens cannot be zero".to_string(),
            ));
        }

        let calculated = self.input_tokens + self.output_tokens;
        if calculated != self.total_tokens {
            return Err(TokenOpsError::TokenCountMismatch {
                calculated,
                reported: self.total_tokens,
            });
        }

        if self.cost < Decimal::ZERO {
            return Err(TokenOpsError::validation("cost cannot be negative"));
        }

        if self.provider_id.is_empty() {
            return Err(TokenOpsError::validation("provider id cannot be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn record(input: u64, output: u64) -> UsageRecord {
        UsageRecord::new(
            "claude-code",
            "claude-3-5-sonnet-20241022",
            "inspector",
            "detection",
            input,
            output,
            dec!(0.0105),
            Currency::USD,
        )
    }

    #[test]
    fn test_valid_record() {
        let r = record(1000, 500);
        assert_eq!(r.total_tokens, 1500);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_zero_token_record_rejected() {
        let r = record(0, 0);
        assert_matches!(
            r.validate(),
            Err(TokenOpsError::InvalidTokenCount(_))
        );
    }

    #[test]
    fn test_token_count_mismatch() {
        let mut r = record(1000, 500);
        r.total_tokens = 2000;
        assert_matches!(
            r.validate(),
            Err(TokenOpsError::TokenCountMismatch {
                calculated: 1500,
                reported: 2000
            })
        );
    }

    #[test]
    fn test_negative_cost_rejected() {
        let mut r = record(10, 10);
        r.cost = dec!(-0.01);
        assert!(r.validate().is_err());
    }
}
