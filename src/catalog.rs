//! The catalog service: the four operations the HTTP layer and CLI call.
//!
//! [`AdCatalog`] wires a source provider, a record store, an embedder, and a
//! vector index together. [`AdCatalog::open`] builds the production wiring
//! from a [`Config`]; [`AdCatalog::from_parts`] accepts any backends, which
//! is how tests substitute in-memory ones.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cache::{CacheBackend, RecordStore, SqliteCache};
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, Embedder};
use crate::error::CatalogResult;
use crate::index::{SqliteVectorBackend, VectorBackend, VectorIndex};
use crate::migrate;
use crate::models::{Ad, Snapshot};
use crate::refresh::{spawn_refresh_timer, Refresher};
use crate::search::{validate_query, SearchOrchestrator};
use crate::sources::{create_provider, SourceProvider};

/// Collaborators injected into [`AdCatalog::from_parts`].
pub struct CatalogParts {
    pub provider: Arc<dyn SourceProvider>,
    pub cache: Arc<dyn CacheBackend>,
    pub vectors: Arc<dyn VectorBackend>,
    pub embedder: Arc<dyn Embedder>,
}

pub struct AdCatalog {
    store: RecordStore,
    refresher: Arc<Refresher>,
    search: SearchOrchestrator,
    cache_key: String,
    refresh_interval: Duration,
}

impl AdCatalog {
    /// Production wiring: SQLite cache and vector index in `[db].path`,
    /// provider and embedder from their config sections.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool, config.embedding.dims).await?;

        let parts = CatalogParts {
            provider: create_provider(config)?,
            cache: Arc::new(SqliteCache::new(pool.clone())),
            vectors: Arc::new(SqliteVectorBackend::new(pool)),
            embedder: create_embedder(&config.embedding)?,
        };
        Ok(Self::from_parts(parts, config))
    }

    pub fn from_parts(parts: CatalogParts, config: &Config) -> Self {
        let store = RecordStore::new(parts.cache, config.timeouts.cache());
        let index = Arc::new(VectorIndex::new(
            parts.vectors,
            parts.embedder.clone(),
            config.embedding.batch_size,
            config.timeouts.index(),
        ));
        let refresher = Arc::new(Refresher::new(
            parts.provider,
            store.clone(),
            index.clone(),
            config.ingest.clone(),
            config.cache.key.clone(),
            Duration::from_secs(config.cache.ttl_secs),
            config.timeouts.source(),
        ));
        let search = SearchOrchestrator::new(
            parts.embedder,
            index,
            config.retrieval.top_k,
            Duration::from_secs(config.embedding.timeout_secs),
        );

        Self {
            store,
            refresher,
            search,
            cache_key: config.cache.key.clone(),
            refresh_interval: Duration::from_secs(config.refresh.interval_secs),
        }
    }

    /// The cached snapshot, refreshing first on a miss.
    ///
    /// A cache read failure counts as a miss. If the refresh gets as far as
    /// writing the cache but the index step fails, the freshly cached
    /// snapshot is still served.
    pub async fn get_ads(&self) -> CatalogResult<Snapshot> {
        if let Some(snapshot) = self.store.get_or_absent(&self.cache_key).await {
            return Ok(snapshot);
        }
        tracing::info!(key = %self.cache_key, "cache miss, refreshing");
        match self.refresher.refresh().await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) if e.is_recoverable_in_search() => {
                tracing::warn!(error = %e, "index not rebuilt, serving cached snapshot");
                match self.store.get_or_absent(&self.cache_key).await {
                    Some(snapshot) => Ok(snapshot),
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Force a refresh and return the new snapshot.
    pub async fn refresh(&self) -> CatalogResult<Snapshot> {
        self.refresher.refresh().await
    }

    /// Hybrid search over the current snapshot.
    pub async fn search(&self, query: &str) -> CatalogResult<Vec<Ad>> {
        let query = validate_query(query)?;
        let corpus = self.get_ads().await?;
        self.search.search(query, &corpus).await
    }

    pub async fn clear_cache(&self) -> CatalogResult<()> {
        self.store.clear(&self.cache_key).await
    }

    /// Start the recurring refresh at `[refresh].interval_secs`.
    pub fn spawn_refresh_timer(&self) -> JoinHandle<()> {
        spawn_refresh_timer(self.refresher.clone(), self.refresh_interval)
    }
}
