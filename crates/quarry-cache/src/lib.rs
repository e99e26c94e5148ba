#![forbid(unsafe_code)]

//! Shared on-disk cache for expensive artifacts (IDE distributions, plugin
//! archives, parsed descriptor sets).
//!
//! [`ResourceCache`] coalesces concurrent constructions of the same key,
//! hands out reference-counted [`Lease`]s that pin artifacts on disk, and
//! keeps total usage under a byte quota by LRU-evicting unleased entries.
//! [`UrlDownloader`] is the stock [`Fetcher`]: an HTTP transfer with bounded
//! retries, feeding the archive installer that publishes each artifact with
//! a single atomic rename.

mod cache;
mod config;
mod download;
mod entry;
mod error;
mod fetch;
mod install;
mod key;
mod lease;
mod store;

pub use cache::ResourceCache;
pub use config::CacheOptions;
pub use download::{UrlDownloader, UrlResolver};
pub use entry::CacheEntry;
pub use error::{CacheError, CacheResult};
pub use fetch::{FetchOutcome, Fetcher};
pub use key::{decode_dir_name, encode_dir_name, CacheKey};
pub use lease::Lease;
