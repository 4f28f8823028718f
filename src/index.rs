//! Vector index over ad embeddings.
//!
//! [`VectorIndex`] embeds every ad of a snapshot and answers k-nearest-neighbor
//! queries by cosine distance. Storage sits behind [`VectorBackend`]:
//!
//! - **[`SqliteVectorBackend`]**: `ad_vectors` + `vector_generations` tables,
//!   embeddings as little-endian f32 BLOBs, brute-force cosine scan.
//! - **[`MemoryVectorBackend`]**: process-local, used by tests.
//!
//! # Generations
//!
//! A rebuild writes every record under a fresh generation number and only
//! then flips the active pointer. Older generations are dropped in the same
//! transaction as the flip. Queries read the active generation alone, so they
//! see either the complete old catalog or the complete new one, and ids from
//! a shrunk catalog do not linger. A rebuild that fails part-way leaves the
//! active generation untouched; its orphaned rows are swept by the next
//! [`VectorBackend::begin_generation`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, Embedder};
use crate::error::{with_timeout, CatalogError, CatalogResult};
use crate::models::{Ad, AdAttributes, Neighbor, VectorRecord};

/// Outcome of [`VectorBackend::create_schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    Created,
    AlreadyExists,
}

/// Storage and k-NN primitives for the vector index.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Create the index definition for `dims`-wide vectors.
    ///
    /// An existing definition with the same width is reported as
    /// [`SchemaStatus::AlreadyExists`]; a width mismatch is an error.
    async fn create_schema(&self, dims: usize) -> Result<SchemaStatus>;

    /// Allocate a new generation number, discarding rows of any generation
    /// that was written but never activated.
    async fn begin_generation(&self) -> Result<u64>;

    /// Upsert records into `generation`, keyed by id.
    async fn upsert_batch(&self, generation: u64, records: &[VectorRecord]) -> Result<()>;

    /// Make `generation` the one queries read, and drop every other.
    async fn activate_generation(&self, generation: u64) -> Result<()>;

    /// Nearest records of the active generation, nearest-first.
    /// Empty when nothing is active.
    async fn knn(&self, vector: &[f32], limit: usize) -> Result<Vec<Neighbor>>;
}

/// Scores candidates against `query` and keeps the `limit` nearest.
///
/// Distance is `1 - cosine_similarity`; ties go to the lower id.
pub fn rank_neighbors<I>(query: &[f32], candidates: I, limit: usize) -> Vec<Neighbor>
where
    I: IntoIterator<Item = (u64, Vec<f32>, AdAttributes)>,
{
    let mut scored: Vec<Neighbor> = candidates
        .into_iter()
        .map(|(id, embedding, attributes)| Neighbor {
            id,
            attributes,
            distance: 1.0 - cosine_similarity(query, &embedding),
        })
        .collect();

    scored.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    scored.truncate(limit);
    scored
}

// ============ SQLite backend ============

pub struct SqliteVectorBackend {
    pool: SqlitePool,
}

impl SqliteVectorBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorBackend for SqliteVectorBackend {
    async fn create_schema(&self, dims: usize) -> Result<SchemaStatus> {
        let created = sqlx::query(
            r#"
            CREATE TABLE vector_generations (
                slot INTEGER PRIMARY KEY CHECK (slot = 0),
                dims INTEGER NOT NULL,
                active INTEGER,
                last_generation INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await;

        let status = match created {
            Ok(_) => SchemaStatus::Created,
            Err(e) if e.to_string().contains("already exists") => SchemaStatus::AlreadyExists,
            Err(e) => return Err(e.into()),
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ad_vectors (
                generation INTEGER NOT NULL,
                id INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                attributes_json TEXT NOT NULL,
                PRIMARY KEY (generation, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO vector_generations (slot, dims) VALUES (0, ?)")
            .bind(dims as i64)
            .execute(&self.pool)
            .await?;

        let existing: i64 = sqlx::query_scalar("SELECT dims FROM vector_generations WHERE slot = 0")
            .fetch_one(&self.pool)
            .await?;
        if existing as usize != dims {
            bail!(
                "vector index was created for {}-dimensional vectors, not {}",
                existing,
                dims
            );
        }

        Ok(status)
    }

    async fn begin_generation(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM ad_vectors
            WHERE generation IS NOT (SELECT active FROM vector_generations WHERE slot = 0)
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE vector_generations SET last_generation = last_generation + 1 WHERE slot = 0")
            .execute(&mut *tx)
            .await?;
        let generation: i64 =
            sqlx::query_scalar("SELECT last_generation FROM vector_generations WHERE slot = 0")
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;
        Ok(generation as u64)
    }

    async fn upsert_batch(&self, generation: u64, records: &[VectorRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let attributes_json = serde_json::to_string(&record.attributes)?;
            sqlx::query(
                r#"
                INSERT INTO ad_vectors (generation, id, embedding, attributes_json)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(generation, id) DO UPDATE SET
                    embedding = excluded.embedding,
                    attributes_json = excluded.attributes_json
                "#,
            )
            .bind(generation as i64)
            .bind(record.id as i64)
            .bind(vec_to_blob(&record.embedding))
            .bind(attributes_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn activate_generation(&self, generation: u64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE vector_generations SET active = ? WHERE slot = 0")
            .bind(generation as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM ad_vectors WHERE generation != ?")
            .bind(generation as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn knn(&self, vector: &[f32], limit: usize) -> Result<Vec<Neighbor>> {
        let rows = sqlx::query(
            r#"
            SELECT v.id, v.embedding, v.attributes_json
            FROM ad_vectors v
            JOIN vector_generations g ON g.slot = 0 AND v.generation = g.active
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let blob: Vec<u8> = row.get("embedding");
            let attributes_json: String = row.get("attributes_json");
            let attributes: AdAttributes = serde_json::from_str(&attributes_json)?;
            candidates.push((id as u64, blob_to_vec(&blob), attributes));
        }

        Ok(rank_neighbors(vector, candidates, limit))
    }
}

// ============ In-memory backend ============

#[derive(Default)]
struct MemoryIndexState {
    dims: Option<usize>,
    last_generation: u64,
    active: Option<u64>,
    generations: HashMap<u64, HashMap<u64, VectorRecord>>,
}

/// Process-local [`VectorBackend`].
#[derive(Default)]
pub struct MemoryVectorBackend {
    state: RwLock<MemoryIndexState>,
}

impl MemoryVectorBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in the active generation.
    pub fn active_len(&self) -> usize {
        self.state
            .read()
            .map(|s| {
                s.active
                    .and_then(|g| s.generations.get(&g))
                    .map_or(0, HashMap::len)
            })
            .unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("vector index lock poisoned")
}

#[async_trait]
impl VectorBackend for MemoryVectorBackend {
    async fn create_schema(&self, dims: usize) -> Result<SchemaStatus> {
        let mut state = self.state.write().map_err(poisoned)?;
        match state.dims {
            None => {
                state.dims = Some(dims);
                Ok(SchemaStatus::Created)
            }
            Some(existing) if existing == dims => Ok(SchemaStatus::AlreadyExists),
            Some(existing) => bail!(
                "vector index was created for {}-dimensional vectors, not {}",
                existing,
                dims
            ),
        }
    }

    async fn begin_generation(&self) -> Result<u64> {
        let mut state = self.state.write().map_err(poisoned)?;
        let active = state.active;
        state.generations.retain(|g, _| Some(*g) == active);
        state.last_generation += 1;
        Ok(state.last_generation)
    }

    async fn upsert_batch(&self, generation: u64, records: &[VectorRecord]) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        let slot = state.generations.entry(generation).or_default();
        for record in records {
            slot.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn activate_generation(&self, generation: u64) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        state.generations.entry(generation).or_default();
        state.generations.retain(|g, _| *g == generation);
        state.active = Some(generation);
        Ok(())
    }

    async fn knn(&self, vector: &[f32], limit: usize) -> Result<Vec<Neighbor>> {
        let state = self.state.read().map_err(poisoned)?;
        let records = match state.active.and_then(|g| state.generations.get(&g)) {
            Some(records) => records,
            None => return Ok(Vec::new()),
        };
        Ok(rank_neighbors(
            vector,
            records
                .values()
                .map(|r| (r.id, r.embedding.clone(), r.attributes.clone())),
            limit,
        ))
    }
}

// ============ Index ============

/// Embeds snapshots into a [`VectorBackend`] and queries it.
///
/// Every failure surfaces as [`CatalogError::IndexUnavailable`], including
/// embedding failures during a rebuild. Each backend call and each embedding
/// batch is bounded by the index timeout.
pub struct VectorIndex {
    backend: Arc<dyn VectorBackend>,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    timeout: Duration,
}

fn unavailable(e: impl std::fmt::Display) -> CatalogError {
    CatalogError::IndexUnavailable(e.to_string())
}

impl VectorIndex {
    pub fn new(
        backend: Arc<dyn VectorBackend>,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            embedder,
            batch_size: batch_size.max(1),
            timeout,
        }
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }

    async fn call<T, F>(&self, fut: F) -> CatalogResult<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        with_timeout(
            self.timeout,
            async { fut.await.map_err(|e| unavailable(format!("{:#}", e))) },
            CatalogError::IndexUnavailable,
        )
        .await
    }

    /// Idempotently create the index definition.
    pub async fn ensure_schema(&self) -> CatalogResult<SchemaStatus> {
        let status = self.call(self.backend.create_schema(self.dims())).await?;
        if status == SchemaStatus::Created {
            tracing::info!(dims = self.dims(), "vector index schema created");
        }
        Ok(status)
    }

    /// Replace the indexed catalog with `snapshot`.
    pub async fn rebuild(&self, snapshot: &[Ad]) -> CatalogResult<usize> {
        let generation = self.call(self.backend.begin_generation()).await?;
        let dims = self.dims();

        for batch in snapshot.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(Ad::embedding_text).collect();
            let vectors = with_timeout(
                self.timeout,
                self.embedder.embed_batch(&texts),
                CatalogError::ModelUnavailable,
            )
            .await
            .map_err(|e| unavailable(format!("embedding failed: {}", e)))?;
            if vectors.len() != batch.len() {
                return Err(unavailable(format!(
                    "embedder returned {} vectors for {} ads",
                    vectors.len(),
                    batch.len()
                )));
            }

            let mut records = Vec::with_capacity(batch.len());
            for (ad, embedding) in batch.iter().zip(vectors) {
                if embedding.len() != dims {
                    return Err(unavailable(format!(
                        "ad {} embedded to {} dimensions, index expects {}",
                        ad.id,
                        embedding.len(),
                        dims
                    )));
                }
                records.push(VectorRecord {
                    id: ad.id,
                    embedding,
                    attributes: ad.attributes(),
                });
            }
            self.call(self.backend.upsert_batch(generation, &records))
                .await?;
        }

        self.call(self.backend.activate_generation(generation))
            .await?;
        tracing::info!(generation, records = snapshot.len(), "vector index rebuilt");
        Ok(snapshot.len())
    }

    /// The `limit` nearest records to `vector`, nearest-first.
    pub async fn query(&self, vector: &[f32], limit: usize) -> CatalogResult<Vec<Neighbor>> {
        if vector.len() != self.dims() {
            return Err(unavailable(format!(
                "query vector has {} dimensions, index expects {}",
                vector.len(),
                self.dims()
            )));
        }
        self.call(self.backend.knn(vector, limit)).await
    }
}
