#![forbid(unsafe_code)]

use std::{path::Path, sync::Arc};

use crate::{entry::CacheEntry, key::CacheKey};

/// Hook invoked when the last lease of an evicting entry is dropped. The
/// cache implements this to perform the deferred physical deletion.
pub(crate) trait Reaper<K>: Send + Sync {
    fn reap(&self, entry: &Arc<CacheEntry<K>>);
}

/// A counted handle to a ready artifact.
///
/// While any lease is alive the backing files are guaranteed to stay on
/// disk: eviction and invalidation may mark the entry, but deletion waits
/// for the final release.
///
/// ## Normative
/// - Dropping the lease releases it; explicit [`release`](Lease::release) is
///   equivalent and reads better at scope exits.
/// - The path is valid only for the lifetime of the lease. Do not stash it.
pub struct Lease<K: CacheKey> {
    entry: Arc<CacheEntry<K>>,
    reaper: Arc<dyn Reaper<K>>,
    released: bool,
}

impl<K: CacheKey> Lease<K> {
    pub(crate) fn new(entry: Arc<CacheEntry<K>>, reaper: Arc<dyn Reaper<K>>) -> Self {
        Self {
            entry,
            reaper,
            released: false,
        }
    }

    pub fn key(&self) -> &K {
        self.entry.key()
    }

    /// Absolute path of the installed artifact (a file or a directory).
    pub fn path(&self) -> &Path {
        self.entry.path()
    }

    /// On-disk size recorded at installation.
    pub fn size_bytes(&self) -> u64 {
        self.entry.size_bytes()
    }

    /// Release the lease now instead of at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.entry.release() {
            self.reaper.reap(&self.entry);
        }
    }
}

impl<K: CacheKey> Drop for Lease<K> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<K: CacheKey> std::fmt::Debug for Lease<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", self.entry.key())
            .field("path", &self.entry.path())
            .finish()
    }
}
