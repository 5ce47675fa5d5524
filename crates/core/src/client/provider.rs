use std::fmt;
use std::time::Duration;

use crate::request::{GenerationRequest, ModelClass};

/// Classified failure of a single provider call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderError {
    /// Timeouts, 5xx, rate limits and empty bodies. Retried on the same provider.
    Retryable {
        message: String,
        retry_after: Option<Duration>,
    },
    /// Auth failures, malformed requests and exhausted quota. Never retried.
    Fatal { message: String },
}

impl ProviderError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Retryable {
            message: message.into(),
            retry_after,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Retryable { retry_after, .. } => *retry_after,
            Self::Fatal { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable { message, .. } | Self::Fatal { message } => message,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable { message, .. } => write!(f, "retryable: {message}"),
            Self::Fatal { message } => write!(f, "fatal: {message}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Uniform capability over one vendor transport. The client depends only on
/// this trait.
pub trait ProviderAdapter: Send + Sync {
    /// Model name used for `class`, reported back with each output.
    fn model(&self, class: ModelClass) -> String;

    fn invoke(&self, request: &GenerationRequest, timeout: Duration)
        -> Result<String, ProviderError>;

    fn health_probe(
        &self,
        probe: &GenerationRequest,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        self.invoke(probe, timeout).map(|_| ())
    }
}
