//! Record store: the cached catalog snapshot.
//!
//! [`RecordStore`] serializes a [`Snapshot`] to JSON and keeps it in a
//! [`CacheBackend`] under a single key with a time-to-live. Backends:
//!
//! - **[`SqliteCache`]**: `cache_entries` table in the catalog database.
//! - **[`MemoryCache`]**: process-local map, used by tests and embedders.
//!
//! A read that fails is reported as absent by [`RecordStore::get_or_absent`];
//! writes always surface their error.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::error::{with_timeout, CatalogError, CatalogResult};
use crate::models::{Ad, Snapshot};

/// Key-value store with per-entry expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Store `value` under `key`, replacing any prior value and resetting
    /// its expiry to `ttl` from now.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Fetch the value under `key`, or `None` if missing or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove `key` immediately.
    async fn delete(&self, key: &str) -> Result<()>;
}

// ============ SQLite backend ============

/// Cache entries in SQLite. Expiry is a unix-millisecond column compared at
/// read time; expired rows are purged on each write.
pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl CacheBackend for SqliteCache {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = now_millis();
        let expires_at = now + ttl.as_millis() as i64;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM cache_entries WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(now_millis())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============ In-memory backend ============

/// Process-local cache. Expired entries are dropped lazily on read.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("cache lock poisoned")
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        match entries.get(key) {
            Some((value, expires)) if Instant::now() < *expires => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().map_err(poisoned)?.remove(key);
        Ok(())
    }
}

// ============ Record store ============

/// Snapshot-level view over a [`CacheBackend`].
///
/// A snapshot becomes visible only once the backend write completes; there
/// is no partially written state to observe.
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn CacheBackend>,
    timeout: Duration,
}

impl RecordStore {
    pub fn new(backend: Arc<dyn CacheBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub async fn put(&self, key: &str, snapshot: &[Ad], ttl: Duration) -> CatalogResult<()> {
        let value = serde_json::to_string(snapshot)
            .map_err(|e| CatalogError::Cache(format!("failed to encode snapshot: {}", e)))?;
        with_timeout(
            self.timeout,
            async {
                self.backend
                    .set_with_ttl(key, &value, ttl)
                    .await
                    .map_err(|e| CatalogError::Cache(format!("{:#}", e)))
            },
            CatalogError::Cache,
        )
        .await?;
        tracing::info!(key, ads = snapshot.len(), ttl_secs = ttl.as_secs(), "snapshot cached");
        Ok(())
    }

    /// Fetch the cached snapshot. `Ok(None)` means missing or expired.
    pub async fn get(&self, key: &str) -> CatalogResult<Option<Snapshot>> {
        let raw = with_timeout(
            self.timeout,
            async {
                self.backend
                    .get(key)
                    .await
                    .map_err(|e| CatalogError::Cache(format!("{:#}", e)))
            },
            CatalogError::Cache,
        )
        .await?;

        match raw {
            Some(json) => {
                let ads: Vec<Ad> = serde_json::from_str(&json).map_err(|e| {
                    CatalogError::Cache(format!("undecodable snapshot under '{}': {}", key, e))
                })?;
                Ok(Some(Arc::from(ads)))
            }
            None => Ok(None),
        }
    }

    /// Read path variant of [`get`](Self::get): backend failures are logged
    /// and reported as a miss.
    pub async fn get_or_absent(&self, key: &str) -> Option<Snapshot> {
        match self.get(key).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn clear(&self, key: &str) -> CatalogResult<()> {
        with_timeout(
            self.timeout,
            async {
                self.backend
                    .delete(key)
                    .await
                    .map_err(|e| CatalogError::Cache(format!("{:#}", e)))
            },
            CatalogError::Cache,
        )
        .await?;
        tracing::info!(key, "cache cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeatureSet;

    fn snapshot() -> Vec<Ad> {
        vec![
            Ad {
                id: 1,
                brand: "Mercedes".into(),
                features: FeatureSet::from_flags(["video", "gallery"]),
                ..Ad::default()
            },
            Ad {
                id: 2,
                brand: "Nike".into(),
                ..Ad::default()
            },
        ]
    }

    fn store() -> RecordStore {
        RecordStore::new(Arc::new(MemoryCache::new()), Duration::from_secs(1))
    }

    struct FailingCache;

    #[async_trait]
    impl CacheBackend for FailingCache {
        async fn set_with_ttl(&self, _: &str, _: &str, _: Duration) -> Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn get(&self, _: &str) -> Result<Option<String>> {
            anyhow::bail!("connection refused")
        }
        async fn delete(&self, _: &str) -> Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = store();
        store
            .put("ads_data", &snapshot(), Duration::from_secs(60))
            .await
            .unwrap();
        let got = store.get("ads_data").await.unwrap().unwrap();
        assert_eq!(&*got, snapshot().as_slice());
    }

    #[tokio::test]
    async fn test_put_replaces_prior_value() {
        let store = store();
        let ttl = Duration::from_secs(60);
        store.put("ads_data", &snapshot(), ttl).await.unwrap();
        store.put("ads_data", &snapshot()[..1], ttl).await.unwrap();
        assert_eq!(store.get("ads_data").await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = store();
        store
            .put("ads_data", &snapshot(), Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.get("ads_data").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear() {
        let store = store();
        store
            .put("ads_data", &snapshot(), Duration::from_secs(60))
            .await
            .unwrap();
        store.clear("ads_data").await.unwrap();
        assert!(store.get("ads_data").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let store = RecordStore::new(Arc::new(FailingCache), Duration::from_secs(1));
        let put = store
            .put("ads_data", &snapshot(), Duration::from_secs(60))
            .await;
        assert!(matches!(put, Err(CatalogError::Cache(_))));
        assert!(matches!(
            store.get("ads_data").await,
            Err(CatalogError::Cache(_))
        ));
        assert!(store.get_or_absent("ads_data").await.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_value_is_cache_error() {
        let backend = Arc::new(MemoryCache::new());
        backend
            .set_with_ttl("ads_data", "not json", Duration::from_secs(60))
            .await
            .unwrap();
        let store = RecordStore::new(backend, Duration::from_secs(1));
        assert!(matches!(
            store.get("ads_data").await,
            Err(CatalogError::Cache(_))
        ));
    }
}
