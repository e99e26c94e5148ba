#![forbid(unsafe_code)]

use std::{io, marker::PhantomData, path::Path, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use quarry_net::{HttpClient, Net, NetError, RetryPolicy};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::{
    fetch::{FetchOutcome, Fetcher},
    key::CacheKey,
};

/// Maps a key to the URL it is served from. `None` means the key has no
/// source at all, which the downloader reports as not available without
/// touching the network.
pub type UrlResolver<K> = Arc<dyn Fn(&K) -> Option<Url> + Send + Sync>;

/// [`Fetcher`] that downloads artifacts over HTTP with bounded retries.
///
/// Each attempt streams into a fresh private temp file; a failed or
/// cancelled attempt never leaves partial bytes for the next one. A
/// definitive rejection from the server (404, 403 and kin) short-circuits
/// the retry loop as permanent, transient failures back off exponentially,
/// and anything still failing after the attempt budget is reported as
/// transient so a later acquisition can try again.
pub struct UrlDownloader<K, N = HttpClient> {
    net: N,
    resolve: UrlResolver<K>,
    retry: RetryPolicy,
    _key: PhantomData<fn(K)>,
}

impl<K, N> UrlDownloader<K, N> {
    pub fn new(
        net: N,
        resolve: impl Fn(&K) -> Option<Url> + Send + Sync + 'static,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            net,
            resolve: Arc::new(resolve),
            retry,
            _key: PhantomData,
        }
    }
}

enum AttemptFailure {
    Cancelled,
    Net(NetError),
    Disk(io::Error),
}

impl<K, N: Net> UrlDownloader<K, N> {
    async fn attempt(
        &self,
        url: &Url,
        temp_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(std::path::PathBuf, u64), AttemptFailure> {
        let file_name = url
            .path_segments()
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .last()
            .unwrap_or("artifact");

        // Keep the remote file name as a suffix so the installer can tell an
        // archive from a plain file.
        let temp = tempfile::Builder::new()
            .prefix("dl-")
            .suffix(&format!("-{file_name}"))
            .tempfile_in(temp_dir)
            .map_err(AttemptFailure::Disk)?;
        let (std_file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(AttemptFailure::Cancelled),
            res = self.net.stream(url.clone()) => res.map_err(AttemptFailure::Net)?,
        };

        let mut bytes = 0u64;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(AttemptFailure::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    bytes += chunk.len() as u64;
                    file.write_all(&chunk).await.map_err(AttemptFailure::Disk)?;
                }
                Some(Err(e)) => return Err(AttemptFailure::Net(e)),
                None => break,
            }
        }
        file.flush().await.map_err(AttemptFailure::Disk)?;
        drop(file);

        let path = temp_path
            .keep()
            .map_err(|e| AttemptFailure::Disk(e.error))?;
        Ok((path, bytes))
    }
}

#[async_trait]
impl<K: CacheKey, N: Net + 'static> Fetcher<K> for UrlDownloader<K, N> {
    async fn fetch(&self, key: &K, temp_dir: &Path, cancel: &CancellationToken) -> FetchOutcome {
        let Some(url) = (self.resolve)(key) else {
            return FetchOutcome::NotAvailable {
                reason: format!("no download URL for {key}"),
            };
        };

        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts.max(1) {
            // Backoff only after a failed attempt; the first try goes out
            // immediately.
            let delay = self.retry.delay_for_attempt(attempt - 1);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return FetchOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return FetchOutcome::Cancelled;
            }

            debug!(%key, %url, attempt, "downloading artifact");
            match self.attempt(&url, temp_dir, cancel).await {
                Ok((path, bytes)) => {
                    debug!(%key, bytes, "download complete");
                    return FetchOutcome::Obtained { path, bytes };
                }
                Err(AttemptFailure::Cancelled) => return FetchOutcome::Cancelled,
                Err(AttemptFailure::Net(e)) if e.is_not_found() => {
                    return FetchOutcome::NotAvailable {
                        reason: format!("{url}: {e}"),
                    };
                }
                Err(AttemptFailure::Net(e)) if e.is_retryable() => {
                    warn!(%key, attempt, error = %e, "download attempt failed");
                    last_error = e.to_string();
                }
                // A definitive client-side rejection (401, 403, ...) is as
                // permanent as a 404; retrying later cannot change it.
                Err(AttemptFailure::Net(e)) => {
                    return FetchOutcome::NotAvailable {
                        reason: format!("{url}: rejected upstream: {e}"),
                    };
                }
                Err(AttemptFailure::Disk(e)) => {
                    return FetchOutcome::Transient {
                        reason: format!("writing download: {e}"),
                    };
                }
            }
        }

        FetchOutcome::Transient {
            reason: format!("{url}: giving up after {} attempts: {last_error}", self.retry.max_attempts),
        }
    }
}
