use std::time::Duration;

use longform_core::{ConfigError, ProviderError};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;

const QUOTA_MARKERS: [&str; 3] = ["insufficient_quota", "quota exhausted", "quota_exhausted"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("API returned an empty response")]
    EmptyResponse,
    #[error("failed to assemble generation client: {0}")]
    Client(#[from] ConfigError),
}

impl From<AdapterError> for ProviderError {
    /// Transient transport trouble is retryable; anything a retry cannot fix
    /// is fatal.
    fn from(err: AdapterError) -> Self {
        let message = err.to_string();
        match err {
            AdapterError::Http(source) if source.is_builder() => ProviderError::fatal(message),
            AdapterError::Http(_) | AdapterError::Json(_) | AdapterError::EmptyResponse => {
                ProviderError::retryable(message)
            }
            AdapterError::InvalidConfig(_) | AdapterError::Client(_) => {
                ProviderError::fatal(message)
            }
            AdapterError::HttpStatus {
                status,
                body,
                retry_after,
            } => classify_status(status, &body, retry_after, message),
        }
    }
}

pub fn classify_status(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
    message: String,
) -> ProviderError {
    if is_quota_exhausted(status, body, retry_after) {
        return ProviderError::fatal(message);
    }
    match status.as_u16() {
        429 => ProviderError::rate_limited(message, retry_after),
        408 | 409 | 425 => ProviderError::retryable(message),
        code if code >= 500 => ProviderError::retryable(message),
        _ => ProviderError::fatal(message),
    }
}

/// Billing exhaustion looks like rate limiting on some vendors; a retry hint
/// marks the recoverable kind.
fn is_quota_exhausted(status: StatusCode, body: &str, retry_after: Option<Duration>) -> bool {
    if status == StatusCode::PAYMENT_REQUIRED {
        return true;
    }
    let lower = body.to_ascii_lowercase();
    retry_after.is_none() && QUOTA_MARKERS.iter().any(|marker| lower.contains(marker))
}

pub(crate) fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
