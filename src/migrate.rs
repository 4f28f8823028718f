use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::index::{SchemaStatus, SqliteVectorBackend, VectorBackend};

/// Create the cache table and the vector index schema. Safe to re-run.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let status = migrate_pool(&pool, config.embedding.dims).await?;
    tracing::info!(db = %config.db.path.display(), index = ?status, "database initialized");
    pool.close().await;
    Ok(())
}

pub async fn migrate_pool(pool: &SqlitePool, dims: usize) -> Result<SchemaStatus> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at ON cache_entries(expires_at)")
        .execute(pool)
        .await?;

    SqliteVectorBackend::new(pool.clone())
        .create_schema(dims)
        .await
}
