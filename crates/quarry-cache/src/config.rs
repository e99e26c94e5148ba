#![forbid(unsafe_code)]

use std::path::PathBuf;

/// Cache configuration, fixed for the process lifetime.
///
/// Passed explicitly into [`ResourceCache::open`](crate::ResourceCache::open);
/// there is no ambient global settings lookup.
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Storage root. One subdirectory per artifact plus a hidden staging
    /// area; exclusively mutated by the cache.
    pub root_dir: PathBuf,
    /// Soft ceiling on the total bytes occupied by ready entries. Eviction
    /// drives usage back under this bound whenever unleased entries exist.
    pub quota_bytes: u64,
}

impl CacheOptions {
    pub fn new<P: Into<PathBuf>>(root_dir: P, quota_bytes: u64) -> Self {
        Self {
            root_dir: root_dir.into(),
            quota_bytes,
        }
    }
}
