use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Typed metadata envelope carried by detections and usage records.
///
/// Replaces the free-form dictionaries found in log lines: the attribution
/// step reads the typed fields first and falls back to `extra` only for the
/// lowercased search blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
}

impl UsageMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Lowercased blob of every field, scanned by the provider gate regexes.
    pub fn search_blob(&self) -> String {
        let mut blob = String::new();
        for field in [&self.provider, &self.model, &self.operation, &self.agent] {
            if let Some(value) = field {
                blob.push_str(value);
                blob.push(' ');
            }
        }
        for (key, value) in &self.extra {
            blob.push_str(key);
            blob.push(' ');
            blob.push_str(value);
            blob.push(' ');
        }
        blob.to_lowercase()
    }

    pub fn is_empty(&self) -> bool {
        self.provider.is_none()
            && self.model.is_none()
            && self.operation.is_none()
            && self.agent.is_none()
            && self.extra.is_empty()
    }
}
