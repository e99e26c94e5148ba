#![forbid(unsafe_code)]

use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::CacheOptions,
    entry::{CacheEntry, EvictDecision},
    error::{CacheError, CacheResult},
    fetch::{FetchOutcome, Fetcher},
    install::install_artifact,
    key::CacheKey,
    lease::{Lease, Reaper},
    store::DiskStore,
};

/// Per-key occupancy. `Pending` carries the broadcast every concurrent
/// acquirer of the key subscribes to; `Ready` holds the installed entry,
/// which stays in place through a deferred eviction until its files are
/// physically gone.
enum Slot<K> {
    Pending(broadcast::Sender<Result<Arc<CacheEntry<K>>, CacheError>>),
    Ready(Arc<CacheEntry<K>>),
}

struct CacheInner<K: CacheKey, F> {
    store: DiskStore<K>,
    slots: Mutex<HashMap<K, Slot<K>>>,
    fetcher: F,
    cancel: CancellationToken,
    /// Process-wide recency clock; every lease draw gets the next tick.
    access_seq: AtomicU64,
}

/// Concurrency-safe store of expensive disk artifacts.
///
/// ## Normative
/// - `acquire` coalesces concurrent requests for the same key into one
///   construction; every caller gets the same outcome.
/// - A returned [`Lease`] pins the artifact: its files survive eviction and
///   invalidation until the last lease is released.
/// - Usage above `quota_bytes` triggers LRU eviction of unleased entries,
///   after the new entry is recorded, so eviction always sees the worst
///   case. Nothing is ever evicted mid-construction or while leased.
/// - Construction failures are not cached. `NotFound`, `Transient` and
///   `Cancelled` all leave the key acquirable again.
///
/// Cloning is cheap and shares the cache.
pub struct ResourceCache<K: CacheKey, F> {
    inner: Arc<CacheInner<K, F>>,
}

impl<K: CacheKey, F> Clone for ResourceCache<K, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, F: Fetcher<K>> ResourceCache<K, F> {
    /// Open the cache at `options.root_dir`, adopting artifacts left by a
    /// previous process and purging half-finished staging leftovers.
    ///
    /// `cancel` aborts in-flight constructions and makes subsequent
    /// acquisitions fail fast; it is the shutdown signal of the cache.
    pub fn open(options: CacheOptions, fetcher: F, cancel: CancellationToken) -> CacheResult<Self> {
        let access_seq = AtomicU64::new(0);
        let (store, recovered) = DiskStore::<K>::open(&options, &access_seq)?;

        // The store already accounts for recovered entries; publish them.
        let mut slots = HashMap::with_capacity(recovered.len());
        for entry in recovered {
            slots.insert(entry.key().clone(), Slot::Ready(entry));
        }

        info!(
            root = %options.root_dir.display(),
            quota = options.quota_bytes,
            entries = slots.len(),
            "cache opened"
        );
        let cache = Self {
            inner: Arc::new(CacheInner {
                store,
                slots: Mutex::new(slots),
                fetcher,
                cancel,
                access_seq,
            }),
        };
        // A shrunken quota takes effect immediately.
        cache.inner.evict_if_over_budget();
        Ok(cache)
    }

    /// Get a leased handle to the artifact for `key`, constructing it if it
    /// is not cached.
    ///
    /// Concurrent calls for the same key share one construction. If the key
    /// is mid-eviction, the call waits for the old files to disappear and
    /// then constructs afresh.
    pub async fn acquire(&self, key: &K) -> CacheResult<Lease<K>> {
        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let step = {
                let mut slots = self.inner.slots.lock();
                match slots.get(key) {
                    Some(Slot::Ready(entry)) => {
                        if entry.try_lease(self.inner.next_seq()) {
                            AcquireStep::Leased(Arc::clone(entry))
                        } else {
                            AcquireStep::AwaitDeletion(entry.subscribe_deleted())
                        }
                    }
                    Some(Slot::Pending(tx)) => AcquireStep::AwaitConstruction(tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        slots.insert(key.clone(), Slot::Pending(tx.clone()));
                        AcquireStep::Construct(tx)
                    }
                }
            };

            match step {
                AcquireStep::Leased(entry) => {
                    return Ok(Lease::new(entry, self.reaper()));
                }
                AcquireStep::AwaitDeletion(mut deleted) => {
                    debug!(%key, "key is mid-eviction, waiting for deletion");
                    loop {
                        if *deleted.borrow_and_update() {
                            break;
                        }
                        tokio::select! {
                            _ = self.inner.cancel.cancelled() => {
                                return Err(CacheError::Cancelled);
                            }
                            changed = deleted.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                AcquireStep::AwaitConstruction(mut rx) => {
                    let outcome = tokio::select! {
                        _ = self.inner.cancel.cancelled() => {
                            return Err(CacheError::Cancelled);
                        }
                        outcome = rx.recv() => outcome,
                    };
                    match outcome {
                        Ok(Ok(entry)) => {
                            if entry.try_lease(self.inner.next_seq()) {
                                return Ok(Lease::new(entry, self.reaper()));
                            }
                            // Evicted between broadcast and lease; retry.
                        }
                        Ok(Err(error)) => return Err(error),
                        // The constructor was dropped before finishing;
                        // race to take over the construction.
                        Err(_) => {}
                    }
                }
                AcquireStep::Construct(tx) => {
                    return self.construct(key, tx).await;
                }
            }
        }
    }

    /// Force a fresh construction on next acquire, e.g. after a consumer
    /// found the installed artifact structurally broken.
    ///
    /// Outstanding leases stay valid; the files disappear when the last one
    /// is released. A key that is mid-construction is left alone, the
    /// in-flight result is what those callers asked for.
    pub fn invalidate(&self, key: &K) {
        let entry = {
            let slots = self.inner.slots.lock();
            match slots.get(key) {
                Some(Slot::Ready(entry)) => Arc::clone(entry),
                _ => return,
            }
        };
        match entry.begin_evict() {
            EvictDecision::DeleteNow => {
                debug!(%key, "invalidated, deleting now");
                self.inner.delete_entry(&entry);
            }
            EvictDecision::Deferred => {
                debug!(%key, "invalidated, deletion deferred until last release");
            }
            EvictDecision::AlreadyEvicting => {}
        }
    }

    /// Current bytes occupied by ready entries, including those awaiting
    /// deferred deletion.
    pub fn total_bytes(&self) -> u64 {
        self.inner.store.total_bytes()
    }

    /// Signal shutdown: abort in-flight constructions and fail new
    /// acquisitions with `Cancelled`.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    fn reaper(&self) -> Arc<dyn Reaper<K>> {
        Arc::clone(&self.inner) as Arc<dyn Reaper<K>>
    }

    /// Run the construction this caller won: fetch, install, publish, then
    /// enforce the quota. The fresh entry is leased before eviction runs so
    /// it can never evict itself.
    async fn construct(
        &self,
        key: &K,
        tx: broadcast::Sender<Result<Arc<CacheEntry<K>>, CacheError>>,
    ) -> CacheResult<Lease<K>> {
        let mut guard = PendingGuard {
            inner: &self.inner,
            key: key.clone(),
            armed: true,
        };

        match self.build(key).await {
            Ok(entry) => {
                let leased = entry.try_lease(self.inner.next_seq());
                debug_assert!(leased, "a fresh entry cannot be evicting");
                {
                    let mut slots = self.inner.slots.lock();
                    slots.insert(key.clone(), Slot::Ready(Arc::clone(&entry)));
                }
                guard.armed = false;
                self.inner.store.record(&entry);
                let _ = tx.send(Ok(Arc::clone(&entry)));
                self.inner.evict_if_over_budget();
                Ok(Lease::new(entry, self.reaper()))
            }
            Err(error) => {
                // Free the key first so late arrivals start a fresh
                // construction instead of subscribing to a dead channel.
                drop(guard);
                let _ = tx.send(Err(error.clone()));
                Err(error)
            }
        }
    }

    /// Fetch the raw artifact into a private staging directory and install
    /// it at its final location.
    async fn build(&self, key: &K) -> CacheResult<Arc<CacheEntry<K>>> {
        let temp = TempDir::with_prefix_in("fetch-", self.inner.store.staging())?;

        let raw = match self
            .inner
            .fetcher
            .fetch(key, temp.path(), &self.inner.cancel)
            .await
        {
            FetchOutcome::Obtained { path, bytes } => {
                debug!(%key, bytes, "raw artifact fetched");
                path
            }
            FetchOutcome::NotAvailable { reason } => return Err(CacheError::NotFound(reason)),
            FetchOutcome::Transient { reason } => return Err(CacheError::Transient { reason }),
            FetchOutcome::Cancelled => return Err(CacheError::Cancelled),
        };

        let final_path = self.inner.store.entry_dir(key)?;
        let staging = self.inner.store.staging().to_path_buf();
        let cancel = self.inner.cancel.clone();
        let dest = final_path.clone();
        let size = tokio::task::spawn_blocking(move || {
            if dest.exists() {
                // A crash can leave an orphaned directory the recovery scan
                // ran before; the rename below needs the slot empty.
                std::fs::remove_dir_all(&dest)?;
            }
            install_artifact(&raw, &staging, &dest, &cancel)
        })
        .await
        .map_err(|e| CacheError::Io(format!("install task failed: {e}")))??;

        Ok(Arc::new(CacheEntry::new(
            key.clone(),
            final_path,
            size,
            self.inner.next_seq(),
        )))
    }
}

enum AcquireStep<K> {
    Leased(Arc<CacheEntry<K>>),
    AwaitDeletion(tokio::sync::watch::Receiver<bool>),
    AwaitConstruction(broadcast::Receiver<Result<Arc<CacheEntry<K>>, CacheError>>),
    Construct(broadcast::Sender<Result<Arc<CacheEntry<K>>, CacheError>>),
}

impl<K: CacheKey, F> CacheInner<K, F> {
    fn next_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Evict least-recently-used unleased entries until usage fits the
    /// quota. Entries with live leases are skipped; if everything left is
    /// leased the overshoot is tolerated until releases come in.
    fn evict_if_over_budget(&self) {
        while self.store.over_budget() {
            let Some(victim) = self.store.pick_coldest_unleased() else {
                warn!(
                    total = self.store.total_bytes(),
                    quota = self.store.quota_bytes(),
                    "cache over quota but every entry is leased or evicting"
                );
                return;
            };
            match victim.begin_evict() {
                EvictDecision::DeleteNow => {
                    debug!(key = %victim.key(), size = victim.size_bytes(), "evicting");
                    self.delete_entry(&victim);
                }
                // Deferred and AlreadyEvicting entries stop being candidates,
                // so the loop moves on to the next-coldest.
                EvictDecision::Deferred => {
                    debug!(key = %victim.key(), "eviction deferred until last release");
                }
                EvictDecision::AlreadyEvicting => {}
            }
        }
    }

    /// Physically remove an evicting entry: unpublish the slot, drop it from
    /// the accounting, move the files aside, then wake waiters. The moved
    /// tree is removed off the caller's path; a multi-gigabyte build tree
    /// must not stall a lease drop or an eviction sweep.
    fn delete_entry(&self, entry: &Arc<CacheEntry<K>>) {
        {
            let mut slots = self.slots.lock();
            if let Some(Slot::Ready(current)) = slots.get(entry.key()) {
                if Arc::ptr_eq(current, entry) {
                    slots.remove(entry.key());
                }
            }
        }
        self.store.forget(entry);
        match self.store.condemn(entry.path()) {
            Ok(Some(doomed)) => remove_tree_detached(doomed),
            Ok(None) => {}
            Err(error) => {
                warn!(key = %entry.key(), %error, "failed to move artifact aside, deleting in place");
                if let Err(error) = std::fs::remove_dir_all(entry.path()) {
                    if error.kind() != io::ErrorKind::NotFound {
                        warn!(key = %entry.key(), %error, "failed to delete artifact files");
                    }
                }
            }
        }
        entry.mark_deleted();
        debug!(key = %entry.key(), "artifact deleted");
    }
}

/// Delete a condemned tree on the blocking pool when a runtime is around
/// (lease drops may run on plain threads).
fn remove_tree_detached(doomed: std::path::PathBuf) {
    let remove = move || {
        if let Err(error) = std::fs::remove_dir_all(&doomed) {
            if error.kind() != io::ErrorKind::NotFound {
                warn!(path = %doomed.display(), %error, "failed to delete condemned artifact tree");
            }
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let _ = handle.spawn_blocking(remove);
        }
        Err(_) => remove(),
    }
}

impl<K: CacheKey, F: Send + Sync> Reaper<K> for CacheInner<K, F> {
    fn reap(&self, entry: &Arc<CacheEntry<K>>) {
        self.delete_entry(entry);
    }
}

/// Removes the `Pending` slot if construction never published a result, so
/// a dropped or failed constructor cannot wedge the key.
struct PendingGuard<'a, K: CacheKey, F> {
    inner: &'a CacheInner<K, F>,
    key: K,
    armed: bool,
}

impl<K: CacheKey, F> Drop for PendingGuard<'_, K, F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.inner.slots.lock();
        if matches!(slots.get(&self.key), Some(Slot::Pending(_))) {
            slots.remove(&self.key);
        }
    }
}
