pub mod accountant;
pub mod attribution;
pub mod store;

pub use accountant::{
    Accountant, LimitPrediction, PricingSource, ProviderStatus, ProviderUsage, Recommendation,
    WindowUsage,
};
pub use attribution::{builtin_providers, Attribution, AttributionEngine};
pub use store::{PersistedState, UsageStore, STATE_VERSION};
