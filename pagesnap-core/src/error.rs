use std::fmt;

use thiserror::Error;

/// Reason a target URL was refused by the SSRF guard.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SsrfRejection {
    InvalidProtocol,
    MissingHost,
    PrivateAddressRejected,
}

impl fmt::Display for SsrfRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SsrfRejection::InvalidProtocol => {
                write!(f, "only http and https URLs are allowed")
            }
            SsrfRejection::MissingHost => write!(f, "URL has no host"),
            SsrfRejection::PrivateAddressRejected => {
                write!(f, "URL resolves to a private or reserved address")
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("URL rejected: {0}")]
    SsrfRejected(SsrfRejection),

    #[error("DNS resolution failed for {host}: {reason}")]
    DnsFailure { host: String, reason: String },

    #[error("Capture timed out after {0}s")]
    CaptureTimeout(u64),

    #[error("Capture failed: {0}")]
    CaptureEngine(String),

    #[error("Preview image fallback failed: {0}")]
    FallbackExhausted(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Lock lost for job {0}")]
    LockLost(String),

    #[error("Capture abandoned: {0}")]
    Abandoned(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CaptureError {
    /// Errors the caller caused; surfaced synchronously as 400 and never
    /// enqueued.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CaptureError::Validation(_)
                | CaptureError::SsrfRejected(_)
                | CaptureError::DnsFailure { .. }
        )
    }

    /// Failures that should consume another attempt instead of failing the
    /// job outright.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaptureError::Storage(_))
    }

    /// Human-readable message safe to hand to API clients.
    pub fn public_message(&self) -> String {
        match self {
            CaptureError::Storage(_) => "failed to store screenshot".into(),
            CaptureError::Queue(_) => "job queue unavailable".into(),
            CaptureError::Serialization(_) => "internal encoding error".into(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Storage(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CaptureError {
    fn from(err: redis::RedisError) -> Self {
        CaptureError::Queue(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;
