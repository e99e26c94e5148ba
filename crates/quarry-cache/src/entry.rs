#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::key::CacheKey;

/// Mutable per-entry state, always accessed under the entry's own lock so
/// refcount checks and state transitions are a single critical section.
#[derive(Debug)]
struct EntryState {
    ref_count: u32,
    /// Monotonic recency stamp; higher means hotter. Assigned from the
    /// cache-wide sequence on every lease acquisition.
    last_access_seq: u64,
    evicting: bool,
}

/// What the caller of [`CacheEntry::begin_evict`] must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EvictDecision {
    /// No leases outstanding: delete the backing files now.
    DeleteNow,
    /// A lease slipped in between selection and marking; deletion is deferred
    /// to the last `release()`.
    Deferred,
    /// Someone else already marked this entry; nothing to do.
    AlreadyEvicting,
}

/// One installed, ready artifact.
///
/// `size_bytes` is measured once at installation and never recomputed
/// implicitly; the recovery scan is the only place that re-measures.
/// An evicting entry issues no new leases and its files are deleted only
/// after the refcount reaches zero.
#[derive(Debug)]
pub struct CacheEntry<K> {
    key: K,
    path: PathBuf,
    size_bytes: u64,
    state: Mutex<EntryState>,
    deleted_tx: watch::Sender<bool>,
}

impl<K: CacheKey> CacheEntry<K> {
    pub(crate) fn new(key: K, path: PathBuf, size_bytes: u64, access_seq: u64) -> Self {
        let (deleted_tx, _) = watch::channel(false);
        Self {
            key,
            path,
            size_bytes,
            state: Mutex::new(EntryState {
                ref_count: 0,
                last_access_seq: access_seq,
                evicting: false,
            }),
            deleted_tx,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Take one lease: bump the refcount and refresh the recency stamp.
    /// Refused once the entry is marked evicting.
    pub(crate) fn try_lease(&self, access_seq: u64) -> bool {
        let mut state = self.state.lock();
        if state.evicting {
            return false;
        }
        state.ref_count += 1;
        // Monotonically non-decreasing even if callers race on seq draw.
        state.last_access_seq = state.last_access_seq.max(access_seq);
        true
    }

    /// Mark the entry evicting. Marking and the refcount check are one
    /// critical section, so the decision is never stale.
    pub(crate) fn begin_evict(&self) -> EvictDecision {
        let mut state = self.state.lock();
        if state.evicting {
            return EvictDecision::AlreadyEvicting;
        }
        state.evicting = true;
        if state.ref_count == 0 {
            EvictDecision::DeleteNow
        } else {
            EvictDecision::Deferred
        }
    }

    /// Drop one lease. Returns `true` when this was the last lease of an
    /// evicting entry, i.e. the caller must now delete the backing files.
    pub(crate) fn release(&self) -> bool {
        let mut state = self.state.lock();
        debug_assert!(state.ref_count > 0, "release without a matching lease");
        state.ref_count = state.ref_count.saturating_sub(1);
        state.evicting && state.ref_count == 0
    }

    /// Snapshot used by eviction candidate selection.
    pub(crate) fn eviction_candidate_seq(&self) -> Option<u64> {
        let state = self.state.lock();
        if state.evicting || state.ref_count > 0 {
            None
        } else {
            Some(state.last_access_seq)
        }
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> u32 {
        self.state.lock().ref_count
    }

    /// Subscribe to the physical-deletion event. Used by `acquire` to wait
    /// out a deferred eviction before constructing the key afresh.
    pub(crate) fn subscribe_deleted(&self) -> watch::Receiver<bool> {
        self.deleted_tx.subscribe()
    }

    pub(crate) fn mark_deleted(&self) {
        let _ = self.deleted_tx.send(true);
    }
}
