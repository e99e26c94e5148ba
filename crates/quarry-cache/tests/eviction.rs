//! Quota enforcement: LRU selection, lease pinning, oversized artifacts.

mod support;

use support::{open_cache, FakeFetcher, Plan};

fn dir_of(root: &std::path::Path, key: &str) -> std::path::PathBuf {
    root.join(quarry_cache::encode_dir_name(key))
}

#[tokio::test]
async fn evicts_least_recently_used_when_over_quota() {
    let root = tempfile::tempdir().unwrap();
    let fetcher = FakeFetcher::new()
        .plan("a", Plan::artifact(400))
        .plan("b", Plan::artifact(400))
        .plan("c", Plan::artifact(300));
    let cache = open_cache(root.path(), 1_000, fetcher.clone());

    cache.acquire(&"a".to_string()).await.unwrap().release();
    cache.acquire(&"b".to_string()).await.unwrap().release();
    assert_eq!(cache.total_bytes(), 800, "under quota, nothing evicted");

    cache.acquire(&"c".to_string()).await.unwrap().release();

    assert_eq!(cache.total_bytes(), 700, "the oldest entry was evicted");
    assert!(!dir_of(root.path(), "a").exists(), "a was coldest");
    assert!(dir_of(root.path(), "b").exists());
    assert!(dir_of(root.path(), "c").exists());
}

#[tokio::test]
async fn reacquire_refreshes_recency() {
    let root = tempfile::tempdir().unwrap();
    let fetcher = FakeFetcher::new()
        .plan("a", Plan::artifact(400))
        .plan("b", Plan::artifact(400))
        .plan("c", Plan::artifact(300));
    let cache = open_cache(root.path(), 1_000, fetcher.clone());

    cache.acquire(&"a".to_string()).await.unwrap().release();
    cache.acquire(&"b".to_string()).await.unwrap().release();
    // Touch a again; b becomes the coldest.
    cache.acquire(&"a".to_string()).await.unwrap().release();

    cache.acquire(&"c".to_string()).await.unwrap().release();

    assert!(dir_of(root.path(), "a").exists(), "a was refreshed");
    assert!(!dir_of(root.path(), "b").exists(), "b was coldest");
    assert_eq!(fetcher.calls("a"), 1, "the refresh was a cache hit");
}

#[tokio::test]
async fn leased_entries_are_never_evicted() {
    let root = tempfile::tempdir().unwrap();
    let fetcher = FakeFetcher::new()
        .plan("a", Plan::artifact(400))
        .plan("b", Plan::artifact(400))
        .plan("c", Plan::artifact(300));
    let cache = open_cache(root.path(), 1_000, fetcher.clone());

    let pinned = cache.acquire(&"a".to_string()).await.unwrap();
    cache.acquire(&"b".to_string()).await.unwrap().release();

    cache.acquire(&"c".to_string()).await.unwrap().release();

    assert!(
        dir_of(root.path(), "a").exists(),
        "a is coldest but leased, so the next-coldest goes"
    );
    assert!(!dir_of(root.path(), "b").exists());
    assert!(std::fs::read(pinned.path().join("payload.bin")).is_ok());
    pinned.release();
}

#[tokio::test]
async fn fully_leased_cache_tolerates_overshoot() {
    let root = tempfile::tempdir().unwrap();
    let fetcher = FakeFetcher::new()
        .plan("a", Plan::artifact(80))
        .plan("b", Plan::artifact(80));
    let cache = open_cache(root.path(), 100, fetcher.clone());

    let a = cache.acquire(&"a".to_string()).await.unwrap();
    let b = cache.acquire(&"b".to_string()).await.unwrap();

    assert_eq!(cache.total_bytes(), 160, "over quota but everything leased");
    assert!(dir_of(root.path(), "a").exists());
    assert!(dir_of(root.path(), "b").exists());
    drop(a);
    drop(b);
}

#[tokio::test]
async fn oversized_artifact_is_admitted_then_evicted_first() {
    let root = tempfile::tempdir().unwrap();
    let fetcher = FakeFetcher::new()
        .plan("huge", Plan::artifact(500))
        .plan("tiny", Plan::artifact(10));
    let cache = open_cache(root.path(), 100, fetcher.clone());

    let huge = cache.acquire(&"huge".to_string()).await.unwrap();
    assert_eq!(huge.size_bytes(), 500, "admitted despite exceeding quota");
    huge.release();

    cache.acquire(&"tiny".to_string()).await.unwrap().release();

    assert!(!dir_of(root.path(), "huge").exists());
    assert_eq!(cache.total_bytes(), 10);
}

#[tokio::test]
async fn constructing_entry_never_evicts_itself() {
    let root = tempfile::tempdir().unwrap();
    let fetcher = FakeFetcher::new().plan("big", Plan::artifact(900));
    let cache = open_cache(root.path(), 100, fetcher.clone());

    // The only candidate over quota is the fresh entry itself, which holds
    // the constructor's lease.
    let lease = cache.acquire(&"big".to_string()).await.unwrap();
    assert!(lease.path().join("payload.bin").is_file());
    lease.release();
    assert!(
        dir_of(root.path(), "big").exists(),
        "eviction runs at construction, not at release"
    );
}

#[tokio::test]
async fn shrunken_quota_is_enforced_at_open() {
    let root = tempfile::tempdir().unwrap();
    {
        let fetcher = FakeFetcher::new()
            .plan("a", Plan::artifact(400))
            .plan("b", Plan::artifact(400));
        let cache = open_cache(root.path(), 1_000, fetcher);
        cache.acquire(&"a".to_string()).await.unwrap().release();
        cache.acquire(&"b".to_string()).await.unwrap().release();
    }

    let cache = open_cache(root.path(), 500, FakeFetcher::new());

    assert_eq!(cache.total_bytes(), 400, "recovered usage trimmed to quota");
    assert!(!dir_of(root.path(), "a").exists(), "older entry evicted");
    assert!(dir_of(root.path(), "b").exists());
}
