use thiserror::Error;

pub type Result<T> = std::result::Result<T, TokenOpsError>;

#[derive(Error, Debug)]
pub enum TokenOpsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid token count: {0}")]
    InvalidTokenCount(String),

    #[error("Token count mismatch: calculated={calculated}, reported={reported}")]
    TokenCountMismatch { calculated: u64, reported: u64 },

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Model not found for provider={provider}: {model}")]
    ModelNotFound { provider: String, model: String },

    #[error("Invalid detection pattern {name}: {reason}")]
    InvalidPattern { name: String, reason: String },

    #[error("Unknown metric name: {0}")]
    UnknownMetric(String),

    #[error("Attribution failed: {0}")]
    Attribution(String),

    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Action dispatch error: {0}")]
    Action(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TokenOpsError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        TokenOpsError::Config(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        TokenOpsError::Validation(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        TokenOpsError::Internal(msg.into())
    }
}
