//! Error taxonomy for catalog operations.
//!
//! Every failure that crosses a component boundary is one of these variants.
//! The search path recovers [`CatalogError::ModelUnavailable`] and
//! [`CatalogError::IndexUnavailable`] locally; everything else is surfaced.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// The source record provider was unreachable or returned malformed rows.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The cache backend was unreachable or returned an undecodable value.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Schema creation, rebuild, or query against the vector index failed.
    #[error("Vector index unavailable: {0}")]
    IndexUnavailable(String),

    /// The embedding model could not be loaded or produced bad output.
    #[error("Embedding model unavailable: {0}")]
    ModelUnavailable(String),

    /// Caller input was rejected.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The service was wired with an unusable configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CatalogError {
    /// Whether the search path may swallow this error and fall back to
    /// keyword scoring.
    pub fn is_recoverable_in_search(&self) -> bool {
        matches!(
            self,
            CatalogError::ModelUnavailable(_) | CatalogError::IndexUnavailable(_)
        )
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Runs `fut` under `limit`, turning an elapsed deadline into the error
/// produced by `on_timeout`.
pub async fn with_timeout<T, F>(
    limit: std::time::Duration,
    fut: F,
    on_timeout: impl FnOnce(String) -> CatalogError,
) -> CatalogResult<T>
where
    F: std::future::Future<Output = CatalogResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(format!(
            "operation timed out after {}ms",
            limit.as_millis()
        ))),
    }
}
