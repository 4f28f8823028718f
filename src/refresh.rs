//! Refresh orchestration: source → record store → vector index.
//!
//! One refresh runs these steps in order, aborting on the first failure:
//!
//! 1. Fetch ad rows and format rows from the [`SourceProvider`].
//! 2. Build the [`Snapshot`], merging format lookup entries.
//! 3. Write the snapshot to the [`RecordStore`] with the configured TTL.
//! 4. Ensure the index schema, then rebuild the [`VectorIndex`].
//!
//! The cache is written before the index. If step 4 fails, keyword search
//! over the cache is already current while semantic search lags one cycle.
//!
//! Refreshes are single-flight. A trigger that arrives while another refresh
//! runs waits for it; if that refresh succeeded its snapshot is reused,
//! otherwise the waiter runs its own attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::RecordStore;
use crate::config::IngestConfig;
use crate::error::{with_timeout, CatalogError, CatalogResult};
use crate::index::VectorIndex;
use crate::ingest::build_snapshot;
use crate::models::Snapshot;
use crate::sources::SourceProvider;

pub struct Refresher {
    provider: Arc<dyn SourceProvider>,
    store: RecordStore,
    index: Arc<VectorIndex>,
    ingest: IngestConfig,
    cache_key: String,
    ttl: Duration,
    source_timeout: Duration,
    last_success: Mutex<Option<Snapshot>>,
    completed: AtomicU64,
}

impl Refresher {
    pub fn new(
        provider: Arc<dyn SourceProvider>,
        store: RecordStore,
        index: Arc<VectorIndex>,
        ingest: IngestConfig,
        cache_key: String,
        ttl: Duration,
        source_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            index,
            ingest,
            cache_key,
            ttl,
            source_timeout,
            last_success: Mutex::new(None),
            completed: AtomicU64::new(0),
        }
    }

    /// Number of refreshes that have completed successfully.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Run a refresh, or join the one already in progress.
    pub async fn refresh(&self) -> CatalogResult<Snapshot> {
        let seen = self.completed.load(Ordering::SeqCst);
        let mut last = self.last_success.lock().await;

        if self.completed.load(Ordering::SeqCst) != seen {
            if let Some(snapshot) = last.as_ref() {
                tracing::debug!("joined concurrent refresh");
                return Ok(snapshot.clone());
            }
        }

        let snapshot = self.run_once().await?;
        *last = Some(snapshot.clone());
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(snapshot)
    }

    async fn run_once(&self) -> CatalogResult<Snapshot> {
        let started = Instant::now();
        tracing::info!(provider = self.provider.name(), "refresh started");

        let rows = with_timeout(
            self.source_timeout,
            async {
                self.provider
                    .fetch()
                    .await
                    .map_err(|e| CatalogError::Provider(format!("{:#}", e)))
            },
            CatalogError::Provider,
        )
        .await?;

        let snapshot = build_snapshot(&rows, &self.ingest);
        self.store.put(&self.cache_key, &snapshot, self.ttl).await?;

        self.index.ensure_schema().await?;
        self.index.rebuild(&snapshot).await?;

        tracing::info!(
            ads = snapshot.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "refresh complete"
        );
        Ok(snapshot)
    }
}

/// Spawn the recurring refresh task. The first tick fires immediately.
///
/// Failures are logged and the task waits for the next tick.
pub fn spawn_refresh_timer(refresher: Arc<Refresher>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = refresher.refresh().await {
                tracing::error!(error = %e, "scheduled refresh failed");
            }
        }
    })
}
