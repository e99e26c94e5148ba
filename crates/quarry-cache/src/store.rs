#![forbid(unsafe_code)]

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    config::CacheOptions,
    entry::CacheEntry,
    error::{CacheError, CacheResult},
    install::dir_size,
    key::CacheKey,
};

const STAGING_DIR: &str = ".staging";

#[derive(Debug)]
struct Inventory<K> {
    entries: HashMap<K, Arc<CacheEntry<K>>>,
    total_bytes: u64,
}

/// On-disk layout and byte accounting for the cache.
///
/// One directory per key under the root, named by [`CacheKey::dir_name`],
/// plus a hidden staging area for in-flight downloads and unpacks. The
/// inventory mirrors the ready directories and carries their summed size;
/// eviction consults it to decide when and what to delete.
#[derive(Debug)]
pub(crate) struct DiskStore<K> {
    root: PathBuf,
    staging: PathBuf,
    quota_bytes: u64,
    inventory: Mutex<Inventory<K>>,
    condemned: AtomicU64,
}

impl<K: CacheKey> DiskStore<K> {
    /// Prepare the layout and recover entries left by a previous process.
    ///
    /// Staging leftovers are purged wholesale: anything in there is a
    /// half-finished download or unpack. Directories whose name parses as a
    /// key are adopted as ready entries, re-measured, and stamped in
    /// modification-time order so the recovered LRU matches past usage;
    /// foreign files and directories are left untouched.
    pub(crate) fn open(
        options: &CacheOptions,
        access_seq: &AtomicU64,
    ) -> CacheResult<(Self, Vec<Arc<CacheEntry<K>>>)> {
        let root = options.root_dir.clone();
        let staging = root.join(STAGING_DIR);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let mut found: Vec<(K, PathBuf, u64, SystemTime)> = Vec::new();
        for dir_entry in fs::read_dir(&root)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if !dir_entry.file_type()?.is_dir() || path == staging {
                continue;
            }
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(key) = K::from_dir_name(name) else {
                debug!(dir = name, "skipping foreign directory in cache root");
                continue;
            };
            let size = dir_size(&path)?;
            let mtime = dir_entry
                .metadata()?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((key, path, size, mtime));
        }
        found.sort_by(|a, b| a.3.cmp(&b.3).then_with(|| a.0.cmp(&b.0)));

        let mut entries = HashMap::with_capacity(found.len());
        let mut total_bytes = 0u64;
        let mut recovered = Vec::with_capacity(found.len());
        for (key, path, size, _) in found {
            let seq = access_seq.fetch_add(1, Ordering::Relaxed);
            let entry = Arc::new(CacheEntry::new(key.clone(), path, size, seq));
            total_bytes += size;
            entries.insert(key, Arc::clone(&entry));
            recovered.push(entry);
        }
        if !recovered.is_empty() {
            debug!(
                entries = recovered.len(),
                total_bytes, "recovered cache inventory"
            );
        }

        Ok((
            Self {
                root,
                staging,
                quota_bytes: options.quota_bytes,
                inventory: Mutex::new(Inventory {
                    entries,
                    total_bytes,
                }),
                condemned: AtomicU64::new(0),
            },
            recovered,
        ))
    }

    /// Directory an installed artifact for `key` lives in.
    ///
    /// The name is validated before joining: an empty or hidden name, or one
    /// with a path separator, would alias the storage root, the staging area
    /// or something outside the root, and deleting a stale entry there could
    /// take the whole cache with it.
    pub(crate) fn entry_dir(&self, key: &K) -> CacheResult<PathBuf> {
        let name = key.dir_name();
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(CacheError::InvalidKey(format!(
                "key {key} maps to unusable directory name {name:?}"
            )));
        }
        Ok(self.root.join(name))
    }

    pub(crate) fn staging(&self) -> &Path {
        &self.staging
    }

    /// Move a doomed artifact tree into the staging area, freeing its
    /// published path immediately; the caller removes the returned path at
    /// leisure. `None` means the tree was already gone. Staging is purged at
    /// the next open, so a crash cannot strand the tree forever.
    pub(crate) fn condemn(&self, path: &Path) -> io::Result<Option<PathBuf>> {
        let n = self.condemned.fetch_add(1, Ordering::Relaxed);
        let doomed = self.staging.join(format!("doomed-{n}"));
        match fs::rename(path, &doomed) {
            Ok(()) => Ok(Some(doomed)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.inventory.lock().total_bytes
    }

    pub(crate) fn over_budget(&self) -> bool {
        self.total_bytes() > self.quota_bytes
    }

    /// Add a freshly installed entry to the accounting. An artifact larger
    /// than the whole quota is admitted anyway, with a warning; eviction will
    /// clear everything else around it.
    pub(crate) fn record(&self, entry: &Arc<CacheEntry<K>>) {
        if entry.size_bytes() > self.quota_bytes {
            warn!(
                key = %entry.key(),
                size = entry.size_bytes(),
                quota = self.quota_bytes,
                "artifact alone exceeds the cache quota"
            );
        }
        let mut inv = self.inventory.lock();
        inv.total_bytes += entry.size_bytes();
        inv.entries.insert(entry.key().clone(), Arc::clone(entry));
    }

    /// Remove an entry from the accounting. Guarded by pointer identity so a
    /// re-constructed successor under the same key is never knocked out by a
    /// late deletion of its predecessor.
    pub(crate) fn forget(&self, entry: &Arc<CacheEntry<K>>) {
        let mut inv = self.inventory.lock();
        match inv.entries.get(entry.key()) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                inv.entries.remove(entry.key());
                inv.total_bytes = inv.total_bytes.saturating_sub(entry.size_bytes());
            }
            _ => {}
        }
    }

    /// Least recently used entry that is neither leased nor already evicting.
    pub(crate) fn pick_coldest_unleased(&self) -> Option<Arc<CacheEntry<K>>> {
        let inv = self.inventory.lock();
        inv.entries
            .values()
            .filter_map(|e| e.eviction_candidate_seq().map(|seq| (seq, e)))
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, e)| Arc::clone(e))
    }
}
