#![forbid(unsafe_code)]

use thiserror::Error;

/// Result type used by `quarry-cache`.
pub type CacheResult<T> = Result<T, CacheError>;

/// Outcome taxonomy of the cache.
///
/// `Clone` is required because a single construction outcome is fanned out to
/// every caller waiting on the same key; error payloads are therefore plain
/// strings rather than source chains.
#[derive(Debug, Error, Clone)]
pub enum CacheError {
    /// The remote source definitively rejected the key (absent or access
    /// refused). Permanent: the cache never retries this on its own, but the
    /// key stays retryable for a later `acquire`.
    #[error("artifact not available: {0}")]
    NotFound(String),

    /// A network or storage hiccup that survived the downloader's own retry
    /// budget. A later `acquire` starts a fresh construction.
    #[error("transient failure: {reason}")]
    Transient { reason: String },

    /// An installed artifact failed a consumer's structural check. Consumers
    /// report this and call `invalidate` to force a fresh construction.
    #[error("artifact is corrupt: {0}")]
    Corrupt(String),

    /// Caller- or shutdown-initiated abort. Never poisons the key.
    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(String),

    /// The key's directory encoding is empty, hidden, or escapes the storage
    /// root. A bug in the `CacheKey` implementation, not in the caller.
    #[error("invalid cache key: {0}")]
    InvalidKey(String),
}

impl From<std::io::Error> for CacheError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}
