#![forbid(unsafe_code)]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Result of one construction attempt by a [`Fetcher`].
#[derive(Debug)]
pub enum FetchOutcome {
    /// The raw artifact (file or directory) now sits at `path`, somewhere
    /// under the private temp directory handed to `fetch`. `bytes` is the
    /// amount transferred, for logging only; the authoritative entry size is
    /// measured after installation.
    Obtained { path: PathBuf, bytes: u64 },

    /// The remote source definitively rejected the key: it does not exist,
    /// or access is refused outright. Permanent.
    NotAvailable { reason: String },

    /// The fetcher's own retry budget is exhausted. The key stays retryable.
    Transient { reason: String },

    /// The transfer was aborted by the cancellation token. Partial temp files
    /// have already been cleaned up.
    Cancelled,
}

/// Produces the raw artifact for a key.
///
/// ## Normative
/// - `fetch` writes only under `temp_dir`, which is private to this
///   construction and purged by the cache afterwards.
/// - Transient upstream failures are retried *inside* the fetcher (it owns
///   the retry budget); the cache never retries on its own.
/// - Cancellation must abort the transfer promptly and report `Cancelled`,
///   never a success and never a cacheable failure.
#[async_trait]
pub trait Fetcher<K>: Send + Sync + 'static {
    async fn fetch(&self, key: &K, temp_dir: &Path, cancel: &CancellationToken) -> FetchOutcome;
}

/// Delegation so a shared fetcher can be handed to the cache by handle.
#[async_trait]
impl<K: Sync, T: Fetcher<K> + ?Sized> Fetcher<K> for Arc<T> {
    async fn fetch(&self, key: &K, temp_dir: &Path, cancel: &CancellationToken) -> FetchOutcome {
        (**self).fetch(key, temp_dir, cancel).await
    }
}
