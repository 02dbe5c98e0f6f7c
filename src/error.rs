//! Error types shared across the operator

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The LLM endpoint answered, but the content did not conform to the
    /// proposal schema.
    #[error("LLM response error: {0}")]
    LlmResponseError(String),

    /// The proposal parsed but violates the mutation policy
    /// (forbidden image tag or disallowed mutation class).
    #[error("policy violation: {0}")]
    PolicyError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// Whether a retry is likely to help.
    ///
    /// Transport-level failures (cluster API, LLM HTTP) are retriable;
    /// schema, policy and configuration errors are not.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::KubeError(_) | Error::HttpError(_))
    }
}
