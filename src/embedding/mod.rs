//! Embedding generator abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`DisabledEmbedder`]**: always fails with `ModelUnavailable`; semantic search
//!   falls back to keyword scoring.
//! - **[`LocalEmbedder`]**: runs a fastembed model in-process. The model is loaded
//!   on first use and shared by every caller afterwards. Loading and each
//!   batch are bounded by `[embedding].timeout_secs`.
//! - **[`OpenAIEmbedder`]**: calls the OpenAI embeddings API with retry and backoff.
//!
//! Also provides vector utilities used by the index backends:
//! - [`cosine_similarity`]: similarity between two embedding vectors
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes
//! - [`blob_to_vec`]: decode those bytes back into a `Vec<f32>`
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use ad_catalog::config::EmbeddingConfig;
//! # use ad_catalog::embedding::create_embedder;
//! let config = EmbeddingConfig { provider: "disabled".into(), ..Default::default() };
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.model_name(), "disabled");
//! ```
//!
//! # Retry Strategy
//!
//! The OpenAI embedder uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::EmbeddingConfig;
use crate::error::{with_timeout, CatalogError, CatalogResult};

/// Maps text to a fixed-length dense vector.
///
/// Implementations must be deterministic for a given model: the same text
/// always yields the same vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"all-minilm-l6-v2"`).
    fn model_name(&self) -> &str;

    /// Returns the vector dimensionality every call produces.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> CatalogResult<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> CatalogResult<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CatalogError::ModelUnavailable("empty embedding response".into()))
    }
}

/// Rejects responses whose count or width does not match the request.
pub fn ensure_shape(vectors: &[Vec<f32>], expected_len: usize, dims: usize) -> CatalogResult<()> {
    if vectors.len() != expected_len {
        return Err(CatalogError::ModelUnavailable(format!(
            "expected {} embeddings, got {}",
            expected_len,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(CatalogError::ModelUnavailable(format!(
            "expected {}-dimensional embeddings, got {}",
            dims,
            bad.len()
        )));
    }
    Ok(())
}

// ============ Lazy model holder ============

/// A model that is loaded at most once, on first use.
///
/// Concurrent first callers share one in-flight load. A failed load is not
/// cached: the next caller tries again.
pub struct LazyModel<T> {
    cell: OnceCell<Arc<T>>,
}

impl<T> Default for LazyModel<T> {
    fn default() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }
}

impl<T> LazyModel<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get_or_load<F, Fut>(&self, load: F) -> CatalogResult<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CatalogResult<T>>,
    {
        self.cell
            .get_or_try_init(|| async move { load().await.map(Arc::new) })
            .await
            .map(Arc::clone)
    }
}

/// Runs `f` on the model if no other call is using it.
///
/// Inference runs on the blocking pool and keeps going after its caller
/// times out. A call that finds the model still busy fails immediately
/// instead of parking another blocking thread on the lock.
pub fn run_exclusive<T, R>(
    model: &std::sync::Mutex<T>,
    f: impl FnOnce(&mut T) -> Result<R>,
) -> CatalogResult<R> {
    let mut guard = match model.try_lock() {
        Ok(guard) => guard,
        Err(std::sync::TryLockError::WouldBlock) => {
            return Err(CatalogError::ModelUnavailable(
                "embedding model is busy with an earlier request".into(),
            ))
        }
        Err(std::sync::TryLockError::Poisoned(e)) => {
            return Err(CatalogError::ModelUnavailable(format!(
                "model lock poisoned: {}",
                e
            )))
        }
    };
    f(&mut guard)
        .map_err(|e| CatalogError::ModelUnavailable(format!("local embedding failed: {}", e)))
}

// ============ Disabled ============

/// Used when `embedding.provider = "disabled"`.
pub struct DisabledEmbedder {
    dims: usize,
}

impl DisabledEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_batch(&self, _texts: &[String]) -> CatalogResult<Vec<Vec<f32>>> {
        Err(CatalogError::ModelUnavailable(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ Local (fastembed) ============

/// In-process embedding model via fastembed.
///
/// Model files are downloaded from Hugging Face on first use and cached;
/// after that no network access is needed. Inference runs on the blocking
/// thread pool.
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    timeout: Duration,
    model: LazyModel<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        // Fail fast on typos; the model itself loads lazily.
        config_to_fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims: config.dims,
            batch_size: config.batch_size,
            timeout: Duration::from_secs(config.timeout_secs),
            model: LazyModel::new(),
        })
    }

    /// Loads the model on first use, waiting at most the embedding timeout.
    ///
    /// A caller that gives up abandons its wait; the next caller starts a
    /// fresh load, which reuses any model files already downloaded.
    async fn load(&self) -> CatalogResult<Arc<std::sync::Mutex<fastembed::TextEmbedding>>> {
        let name = self.model_name.clone();
        let load = self.model.get_or_load(|| async move {
            tracing::info!(model = %name, "loading local embedding model");
            let model = config_to_fastembed_model(&name)
                .map_err(|e| CatalogError::ModelUnavailable(e.to_string()))?;
            tokio::task::spawn_blocking(move || {
                fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(false),
                )
            })
            .await
            .map_err(|e| CatalogError::ModelUnavailable(format!("model load task: {}", e)))?
            .map(std::sync::Mutex::new)
            .map_err(|e| {
                tracing::error!(error = %e, "failed to load local embedding model");
                CatalogError::ModelUnavailable(format!(
                    "failed to initialize local embedding model: {}",
                    e
                ))
            })
        });
        with_timeout(self.timeout, load, CatalogError::ModelUnavailable).await
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> CatalogResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.load().await?;
        let batch_size = self.batch_size;
        let owned = texts.to_vec();

        let task = tokio::task::spawn_blocking(move || {
            run_exclusive(&model, |m| {
                m.embed(owned, Some(batch_size))
                    .map_err(|e| anyhow::anyhow!("{}", e))
            })
        });
        let vectors = with_timeout(
            self.timeout,
            async {
                task.await
                    .map_err(|e| CatalogError::ModelUnavailable(format!("embedding task: {}", e)))?
            },
            CatalogError::ModelUnavailable,
        )
        .await?;

        ensure_shape(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

#[cfg(feature = "local-embeddings")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        other => anyhow::bail!(
            "Unknown local embedding model: '{}'. Supported 384-dimension models: \
             all-minilm-l6-v2, bge-small-en-v1.5, multilingual-e5-small",
            other
        ),
    }
}

// ============ OpenAI ============

/// Embedder backed by `POST https://api.openai.com/v1/embeddings`.
///
/// Requires `OPENAI_API_KEY`. The configured `dims` is sent as the
/// `dimensions` request parameter so the index width stays fixed.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    max_retries: u32,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims,
            max_retries: config.max_retries,
            api_key,
            client,
        })
    }

    async fn call(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_openai_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(%status, attempt, "OpenAI embeddings call failed, retrying");
                        last_err = Some(anyhow::anyhow!(
                            "OpenAI API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    anyhow::bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> CatalogResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self
            .call(texts)
            .await
            .map_err(|e| CatalogError::ModelUnavailable(format!("{:#}", e)))?;
        ensure_shape(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

/// Extracts `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(pos as u64);

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Create the [`Embedder`] selected by `[embedding].provider`.
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires the `local-embeddings` feature) |
/// | `"openai"` | [`OpenAIEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder::new(config.dims))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => anyhow::bail!("Local embedding provider requires --features local-embeddings"),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as little-endian f32 bytes (`len × 4` bytes).
///
/// # Example
///
/// ```rust
/// use ad_catalog::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode little-endian f32 bytes. Trailing bytes that do not form a whole
/// float are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-magnitude input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
