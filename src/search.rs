//! Hybrid search: semantic k-NN first, keyword scoring as the fallback.
//!
//! # Algorithm
//!
//! 1. Reject a blank query with [`CatalogError::Validation`].
//! 2. Embed the query under the embedding timeout and fetch the top-K
//!    nearest ads from the vector index.
//! 3. If any hits come back, rebuild an [`Ad`] view from each hit's stored
//!    attributes and return them nearest-first.
//! 4. If there are no hits, or the embedder or index is unavailable, score
//!    the fallback corpus with [`keyword::fallback_search`].
//!
//! An empty semantic result is treated the same as an index failure, so a
//! non-empty corpus never yields an empty result.

use std::sync::Arc;
use std::time::Duration;

use crate::embedding::Embedder;
use crate::error::{with_timeout, CatalogError, CatalogResult};
use crate::index::VectorIndex;
use crate::keyword;
use crate::models::Ad;

pub struct SearchOrchestrator {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    top_k: usize,
    embed_timeout: Duration,
}

/// Rejects blank queries.
pub fn validate_query(query: &str) -> CatalogResult<&str> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(CatalogError::Validation("Query is required".to_string()));
    }
    Ok(trimmed)
}

impl SearchOrchestrator {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
        top_k: usize,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            index,
            top_k,
            embed_timeout,
        }
    }

    pub async fn search(&self, query: &str, fallback_corpus: &[Ad]) -> CatalogResult<Vec<Ad>> {
        let query = validate_query(query)?;

        match self.semantic(query).await {
            Ok(hits) if !hits.is_empty() => {
                tracing::debug!(hits = hits.len(), "semantic search");
                Ok(hits)
            }
            Ok(_) => {
                tracing::debug!("no semantic hits, using keyword fallback");
                Ok(keyword::fallback_search(query, fallback_corpus))
            }
            Err(e) if e.is_recoverable_in_search() => {
                tracing::warn!(error = %e, "semantic search unavailable, using keyword fallback");
                Ok(keyword::fallback_search(query, fallback_corpus))
            }
            Err(e) => Err(e),
        }
    }

    async fn semantic(&self, query: &str) -> CatalogResult<Vec<Ad>> {
        let vector = with_timeout(
            self.embed_timeout,
            self.embedder.embed(query),
            CatalogError::ModelUnavailable,
        )
        .await?;
        let neighbors = self.index.query(&vector, self.top_k).await?;
        Ok(neighbors
            .into_iter()
            .map(|n| Ad::from_attributes(n.id, n.attributes))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledEmbedder;
    use crate::index::MemoryVectorBackend;
    use crate::models::FeatureSet;
    use async_trait::async_trait;

    /// Never answers, like a model stuck downloading its weights.
    struct StalledEmbedder;

    #[async_trait]
    impl Embedder for StalledEmbedder {
        fn model_name(&self) -> &str {
            "stalled"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed_batch(&self, _texts: &[String]) -> CatalogResult<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    fn orchestrator_with(embedder: Arc<dyn Embedder>) -> SearchOrchestrator {
        let index = Arc::new(VectorIndex::new(
            Arc::new(MemoryVectorBackend::new()),
            embedder.clone(),
            8,
            Duration::from_secs(1),
        ));
        SearchOrchestrator::new(embedder, index, 20, Duration::from_millis(100))
    }

    fn orchestrator() -> SearchOrchestrator {
        orchestrator_with(Arc::new(DisabledEmbedder::new(4)))
    }

    fn corpus() -> Vec<Ad> {
        vec![
            Ad {
                id: 1,
                brand: "Acme".into(),
                industry: "Food".into(),
                ..Ad::default()
            },
            Ad {
                id: 2,
                brand: "Mercedes".into(),
                industry: "Automotive".into(),
                features: FeatureSet::from_flags(["video"]),
                ..Ad::default()
            },
        ]
    }

    #[tokio::test]
    async fn test_blank_query_rejected() {
        let result = orchestrator().search("   ", &corpus()).await;
        assert!(matches!(result, Err(CatalogError::Validation(_))));
    }

    #[tokio::test]
    async fn test_model_unavailable_falls_back() {
        let corpus = corpus();
        let results = orchestrator().search("mercedes", &corpus).await.unwrap();
        assert_eq!(results, keyword::fallback_search("mercedes", &corpus));
        assert_eq!(results[0].id, 2);
    }

    #[tokio::test]
    async fn test_fallback_never_empty_for_non_empty_corpus() {
        let results = orchestrator().search("zzzz", &corpus()).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_stalled_embedder_falls_back_after_timeout() {
        let corpus = corpus();
        let results = tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator_with(Arc::new(StalledEmbedder)).search("mercedes", &corpus),
        )
        .await
        .expect("search must not wait on a stalled embedder")
        .unwrap();
        assert_eq!(results, keyword::fallback_search("mercedes", &corpus));
        assert_eq!(results[0].id, 2);
    }
}
