use thiserror::Error;

/// Result type used by `quarry-net`.
pub type NetResult<T> = Result<T, NetError>;

/// Centralized error type for `quarry-net`.
///
/// `Clone` is deliberate: a single transfer outcome may be fanned out to
/// several waiters by higher layers.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    #[error("HTTP {status} for URL: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,
}

impl NetError {
    /// Creates an HTTP status error.
    pub fn http_status(status: u16, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    /// Checks if this error is worth retrying: server-side failures and
    /// network-level errors are transient, client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetError::HttpStatus { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            NetError::Network(_) | NetError::Timeout => true,
        }
    }

    /// Checks if the remote source has confirmed the resource does not exist.
    /// Such an outcome is permanent and must short-circuit any retry loop.
    pub fn is_not_found(&self) -> bool {
        matches!(self, NetError::HttpStatus { status, .. } if *status == 404 || *status == 410)
    }

    /// Gets the HTTP status code if this is an HTTP status error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            NetError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for NetError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(500, true, "500 should retry")]
    #[case(502, true, "502 should retry")]
    #[case(503, true, "503 should retry")]
    #[case(429, true, "429 should retry")]
    #[case(408, true, "408 should retry")]
    #[case(404, false, "404 should not retry")]
    #[case(410, false, "410 should not retry")]
    #[case(403, false, "403 should not retry")]
    fn status_retryability(#[case] status: u16, #[case] expected: bool, #[case] _desc: &str) {
        let err = NetError::http_status(status, "http://test.example/a.tar.gz");
        assert_eq!(err.is_retryable(), expected);
    }

    #[rstest]
    #[case(404, true)]
    #[case(410, true)]
    #[case(500, false)]
    #[case(403, false)]
    fn not_found_classification(#[case] status: u16, #[case] expected: bool) {
        let err = NetError::http_status(status, "http://test.example/a.tar.gz");
        assert_eq!(err.is_not_found(), expected);
    }

    #[rstest]
    fn network_errors_are_retryable_but_not_not_found() {
        let err = NetError::Network("connection reset".to_string());
        assert!(err.is_retryable());
        assert!(!err.is_not_found());
        assert_eq!(err.status_code(), None);

        assert!(NetError::Timeout.is_retryable());
        assert!(!NetError::Timeout.is_not_found());
    }
}
