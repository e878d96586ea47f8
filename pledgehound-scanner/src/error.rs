use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid proxy: {0}")]
    InvalidProxy(String),

    #[error("Anti-forgery token not found on {0}")]
    TokenNotFound(String),

    #[error("{operation} exhausted after {attempts} attempts, last error: {last_error}")]
    Exhausted {
        operation: String,
        attempts: usize,
        last_error: String,
    },

    #[error("{operation} did not finish within {limit:?}")]
    DeadlineExceeded { operation: String, limit: Duration },

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl ScanError {
    /// Retry exhaustion is the only failure a caller may choose to degrade on.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, ScanError::Exhausted { .. })
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;

/// Why a single attempt inside the retry loop failed.
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("undecodable body: {0}")]
    Decode(String),

    /// Not retried; surfaces from the executor as-is.
    #[error(transparent)]
    Fatal(ScanError),
}

impl AttemptError {
    /// 429 and 403 are how the site says "slow down" or "not you".
    pub fn is_blocked(&self) -> bool {
        matches!(self, AttemptError::Status(429) | AttemptError::Status(403))
    }
}
