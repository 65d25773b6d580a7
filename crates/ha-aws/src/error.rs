//! EC2 adapter error type and classification.

use thiserror::Error;

/// An EC2 adapter failure, classified by how the engine should treat it.
#[derive(Debug, Error)]
pub enum AwsError {
    /// A referenced resource does not exist (bad device index, unknown
    /// ENI or route table). Surfaced as fatal at startup validation.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Provider-side trouble (5xx, throttling, timeouts). The next
    /// reconcile tick retries.
    #[error("transient AWS failure: {0}")]
    Transient(String),

    /// Authorization or malformed-input failures. Retrying cannot help;
    /// recovery needs operator reconfiguration.
    #[error("permanent AWS failure: {0}")]
    Permanent(String),
}

impl AwsError {
    /// Classify an EC2 API error response by its error code and HTTP status.
    pub(crate) fn from_api_error(status: u16, code: &str, message: &str) -> Self {
        let detail = format!("{code}: {message} (http {status})");
        if code.ends_with(".NotFound") {
            AwsError::NotFound(detail)
        } else if status >= 500
            || code == "RequestLimitExceeded"
            || code.starts_with("Throttling")
        {
            AwsError::Transient(detail)
        } else {
            AwsError::Permanent(detail)
        }
    }
}

impl From<reqwest::Error> for AwsError {
    fn from(err: reqwest::Error) -> Self {
        // Connectivity trouble (connect failures, timeouts, resets) is
        // worth retrying on the next tick.
        AwsError::Transient(err.to_string())
    }
}
