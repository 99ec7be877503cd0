//! Upstream error types

use thiserror::Error;

/// Errors returned by the upstream terrarium API
///
/// Neither kind is fatal: the poller skips a tick on a directory failure and
/// degrades a single device to an absent reading on a reading failure.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Network failure, timeout or non-success HTTP status
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    /// The response body did not have the expected shape
    #[error("Upstream response malformed: {0}")]
    Malformed(String),
}

impl UpstreamError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, UpstreamError::Unavailable(_))
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, UpstreamError::Malformed(_))
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            UpstreamError::Malformed(err.to_string())
        } else if err.is_timeout() {
            UpstreamError::Unavailable(format!("request timed out: {}", err))
        } else {
            UpstreamError::Unavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for UpstreamError {
    fn from(err: serde_json::Error) -> Self {
        UpstreamError::Malformed(err.to_string())
    }
}

/// Result type alias for upstream operations
pub type UpstreamResult<T> = Result<T, UpstreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = UpstreamError::Unavailable("connection refused".to_string());
        assert_eq!(err.to_string(), "Upstream unavailable: connection refused");
        assert!(err.is_unavailable());

        let err = UpstreamError::Malformed("expected object".to_string());
        assert_eq!(err.to_string(), "Upstream response malformed: expected object");
        assert!(err.is_malformed());
    }

    #[test]
    fn test_json_error_is_malformed() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: UpstreamError = json_err.into();
        assert!(err.is_malformed());
    }
}
