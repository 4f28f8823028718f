//! HTTP API over the catalog.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/ads` | Cached catalog, refreshing on a miss |
//! | `POST` | `/api/search` | Hybrid search, body `{"query": "..."}` |
//! | `POST` | `/api/refresh` | Force a refresh from the source |
//! | `POST` | `/api/clear-cache` | Drop the cached snapshot |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "success": false, "error": "Failed to perform search" }
//! ```
//!
//! A missing or blank search query is a 400 with `"Query is required"`.
//! Every other failure is a 500 with a fixed per-route message; the cause is
//! logged, never returned.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser frontends on
//! another origin can call the API.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::catalog::AdCatalog;
use crate::config::Config;
use crate::error::CatalogError;
use crate::models::Ad;

/// Opens the catalog, starts the refresh timer, and serves on `[server].bind`.
///
/// Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let catalog = Arc::new(AdCatalog::open(config).await?);
    let _timer = catalog.spawn_refresh_timer();
    serve(catalog, &config.server.bind).await
}

/// Serves `catalog` on `bind_addr` without starting a refresh timer.
pub async fn serve(catalog: Arc<AdCatalog>, bind_addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "ad catalog API listening");
    axum::serve(listener, router(catalog)).await?;
    Ok(())
}

pub fn router(catalog: Arc<AdCatalog>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ads", get(handle_ads))
        .route("/api/search", post(handle_search))
        .route("/api/refresh", post(handle_refresh))
        .route("/api/clear-cache", post(handle_clear_cache))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(catalog)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: &'static str,
}

struct AppError {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn query_required() -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: "Query is required",
    }
}

/// Logs `err` and hides it behind `message`.
fn internal(route: &str, message: &'static str, err: CatalogError) -> AppError {
    tracing::error!(route, error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message,
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /api/ads ============

#[derive(Serialize)]
struct AdsResponse {
    success: bool,
    data: Vec<Ad>,
}

async fn handle_ads(State(catalog): State<Arc<AdCatalog>>) -> Result<Json<AdsResponse>, AppError> {
    let snapshot = catalog
        .get_ads()
        .await
        .map_err(|e| internal("/api/ads", "Failed to fetch ads data", e))?;
    Ok(Json(AdsResponse {
        success: true,
        data: snapshot.to_vec(),
    }))
}

// ============ POST /api/search ============

#[derive(Deserialize)]
struct SearchRequest {
    #[serde(default)]
    query: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    success: bool,
    results: Vec<Ad>,
}

async fn handle_search(
    State(catalog): State<Arc<AdCatalog>>,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let query = match body {
        Ok(Json(SearchRequest { query: Some(q) })) if !q.trim().is_empty() => q,
        _ => return Err(query_required()),
    };

    let results = catalog.search(&query).await.map_err(|e| match e {
        CatalogError::Validation(_) => query_required(),
        e => internal("/api/search", "Failed to perform search", e),
    })?;
    Ok(Json(SearchResponse {
        success: true,
        results,
    }))
}

// ============ POST /api/refresh ============

#[derive(Serialize)]
struct RefreshResponse {
    success: bool,
    message: &'static str,
    count: usize,
}

async fn handle_refresh(
    State(catalog): State<Arc<AdCatalog>>,
) -> Result<Json<RefreshResponse>, AppError> {
    let snapshot = catalog
        .refresh()
        .await
        .map_err(|e| internal("/api/refresh", "Failed to refresh ads data", e))?;
    Ok(Json(RefreshResponse {
        success: true,
        message: "Data refreshed successfully",
        count: snapshot.len(),
    }))
}

// ============ POST /api/clear-cache ============

#[derive(Serialize)]
struct MessageResponse {
    success: bool,
    message: &'static str,
}

async fn handle_clear_cache(
    State(catalog): State<Arc<AdCatalog>>,
) -> Result<Json<MessageResponse>, AppError> {
    catalog
        .clear_cache()
        .await
        .map_err(|e| internal("/api/clear-cache", "Failed to clear cache", e))?;
    Ok(Json(MessageResponse {
        success: true,
        message: "Cache cleared successfully",
    }))
}
