use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Currency a provider bills in. Cross-currency aggregation is out of scope;
/// every aggregate query assumes one currency per provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    USD,
    EUR,
    GBP,
    Custom(String),
}

impl Currency {
    pub fn as_str(&self) -> &str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::Custom(s) => s,
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provider-level rate limits. `tokens_per_day` anchors the daily quota;
/// weekly and monthly quotas are derived as 7x and 30x.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    pub tokens_per_day: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingPolicy {
    pub currency: Currency,
    /// Seconds between pricing refreshes when `auto_update` is set.
    pub update_interval_secs: u64,
    pub auto_update: bool,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            currency: Currency::USD,
            update_interval_secs: 86_400,
            auto_update: false,
        }
    }
}

/// Per-1000-token pricing for a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input: Decimal,
    pub output: Decimal,
}

impl ModelPricing {
    pub fn new(input: Decimal, output: Decimal) -> Self {
        Self { input, output }
    }

    /// Cost of a request: `(input/1000)·input_price + (output/1000)·output_price`.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> Decimal {
        let thousand = Decimal::from(1000);
        let input_cost = Decimal::from(input_tokens) * self.input / thousand;
        let output_cost = Decimal::from(output_tokens) * self.output / thousand;
        (input_cost + output_cost).round_dp(10)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub id: String,
    pub context_window: u64,
    pub max_output_tokens: u64,
    pub pricing: ModelPricing,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>, context_window: u64, max_output_tokens: u64, pricing: ModelPricing) -> Self {
        Self {
            id: id.into(),
            context_window,
            max_output_tokens,
            pricing,
            capabilities: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// A named LLM vendor with an ordered model list. Providers are created at
/// initialization; mutations (pricing refresh, enable/disable) are serialized
/// on the accountant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: String,
    pub display_name: String,
    /// Ordered; the first model is the attribution default.
    pub models: Vec<ModelSpec>,
    pub rate_limits: RateLimits,
    #[serde(default)]
    pub pricing_policy: PricingPolicy,
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Provider {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        models: Vec<ModelSpec>,
        rate_limits: RateLimits,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            models,
            rate_limits,
            pricing_policy: PricingPolicy::default(),
            enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn model(&self, model_id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == model_id)
    }

    /// First model in the ordered list; attribution falls back to it when no
    /// model-detection rule matches.
    pub fn default_model(&self) -> Option<&ModelSpec> {
        self.models.first()
    }

    pub fn daily_token_limit(&self) -> u64 {
        self.rate_limits.tokens_per_day
    }
}
