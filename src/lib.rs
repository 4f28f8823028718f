//! # Ad Catalog
//!
//! Ingests a campaign-ad catalog from a spreadsheet, caches it, indexes it
//! for semantic search, and answers free-text queries with a keyword
//! fallback whenever semantic search is unavailable or finds nothing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │   Source    │──▶│   Ingest    │──▶│ Record Store │
//! │ Sheets/File │   │ rows → Ads  │   │  (cache)     │
//! └─────────────┘   └──────┬──────┘   └──────┬───────┘
//!                          ▼                 │
//!                   ┌─────────────┐          │
//!                   │ Vector Index│          │
//!                   │ embed + kNN │          │
//!                   └──────┬──────┘          │
//!                          ▼                 ▼
//!                   ┌────────────────────────────┐
//!                   │ Search: kNN, else keyword  │
//!                   └─────────────┬──────────────┘
//!                        ┌────────┴────────┐
//!                        ▼                 ▼
//!                   ┌──────────┐     ┌──────────┐
//!                   │   CLI    │     │   HTTP   │
//!                   │ (adcat)  │     │  (axum)  │
//!                   └──────────┘     └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! adcat init                      # create database and index schema
//! adcat refresh                   # fetch, cache, and index the catalog
//! adcat search "car launch video"
//! adcat serve                     # HTTP API + refresh timer
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`sources`] | Source row providers (Google Sheets, JSON file) |
//! | [`ingest`] | Row-to-ad mapping |
//! | [`cache`] | Record store over a TTL cache backend |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Generation-tagged vector index |
//! | [`keyword`] | Keyword fallback scorer |
//! | [`refresh`] | Single-flight refresh orchestration and timer |
//! | [`search`] | Hybrid search orchestration |
//! | [`catalog`] | Service facade used by the CLI and server |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod catalog;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ingest;
pub mod keyword;
pub mod migrate;
pub mod models;
pub mod refresh;
pub mod search;
pub mod server;
pub mod sources;
