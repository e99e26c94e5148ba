//! Shared fixtures: a scripted fetcher and cache construction helpers.
#![allow(dead_code)] // each test binary uses a different subset

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use quarry_cache::{CacheOptions, FetchOutcome, Fetcher, ResourceCache};
use tokio_util::sync::CancellationToken;

/// What one scripted fetch should do.
pub struct Plan {
    pub delay_ms: u64,
    pub outcome: Planned,
}

pub enum Planned {
    /// Produce a raw file of exactly `size` bytes.
    Artifact { size: u64 },
    NotFound,
    Transient,
    /// Block until cancelled.
    Hang,
}

impl Plan {
    pub fn artifact(size: u64) -> Self {
        Self {
            delay_ms: 0,
            outcome: Planned::Artifact { size },
        }
    }

    pub fn artifact_after(size: u64, delay_ms: u64) -> Self {
        Self {
            delay_ms,
            outcome: Planned::Artifact { size },
        }
    }

    pub fn not_found_after(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            outcome: Planned::NotFound,
        }
    }

    pub fn transient() -> Self {
        Self {
            delay_ms: 0,
            outcome: Planned::Transient,
        }
    }

    pub fn hang() -> Self {
        Self {
            delay_ms: 0,
            outcome: Planned::Hang,
        }
    }
}

/// Fetcher driven by a per-key script, counting how often each key is
/// actually fetched.
#[derive(Default)]
pub struct FakeFetcher {
    calls: Mutex<HashMap<String, usize>>,
    plans: Mutex<HashMap<String, VecDeque<Plan>>>,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn plan(self: &Arc<Self>, key: &str, plan: Plan) -> Arc<Self> {
        self.plans
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(plan);
        Arc::clone(self)
    }

    pub fn calls(&self, key: &str) -> usize {
        self.calls.lock().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher<String> for FakeFetcher {
    async fn fetch(&self, key: &String, temp_dir: &Path, cancel: &CancellationToken) -> FetchOutcome {
        *self.calls.lock().entry(key.clone()).or_insert(0) += 1;
        let plan = self.plans.lock().get_mut(key).and_then(VecDeque::pop_front);
        let Some(plan) = plan else {
            panic!("no fetch plan for key {key}");
        };

        if plan.delay_ms > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return FetchOutcome::Cancelled,
                _ = tokio::time::sleep(Duration::from_millis(plan.delay_ms)) => {}
            }
        }

        match plan.outcome {
            Planned::Artifact { size } => {
                let path = temp_dir.join("payload.bin");
                tokio::fs::write(&path, vec![0u8; size as usize])
                    .await
                    .unwrap();
                FetchOutcome::Obtained { path, bytes: size }
            }
            Planned::NotFound => FetchOutcome::NotAvailable {
                reason: format!("{key} does not exist upstream"),
            },
            Planned::Transient => FetchOutcome::Transient {
                reason: "upstream flaked out".to_string(),
            },
            Planned::Hang => {
                cancel.cancelled().await;
                FetchOutcome::Cancelled
            }
        }
    }
}

pub fn open_cache(
    root: &Path,
    quota_bytes: u64,
    fetcher: Arc<FakeFetcher>,
) -> ResourceCache<String, Arc<FakeFetcher>> {
    init_logs();
    ResourceCache::open(
        CacheOptions::new(root, quota_bytes),
        fetcher,
        CancellationToken::new(),
    )
    .unwrap()
}

pub fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
