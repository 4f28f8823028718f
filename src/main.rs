//! # Ad catalog CLI (`adcat`)
//!
//! ## Usage
//!
//! ```bash
//! adcat --config ./config/adcat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `adcat init` | Create the SQLite database, cache table, and vector index schema |
//! | `adcat refresh` | Fetch the source sheets, cache the catalog, rebuild the index |
//! | `adcat ads` | Print the cached catalog as JSON (refreshing on a miss) |
//! | `adcat search "<query>"` | Hybrid search, results as JSON |
//! | `adcat clear-cache` | Drop the cached catalog |
//! | `adcat serve` | Start the HTTP API and the refresh timer |
//!
//! Logs go to stderr; set `RUST_LOG` to adjust (default `ad_catalog=info`).

use ad_catalog::catalog::AdCatalog;
use ad_catalog::{config, migrate, server};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Ad catalog: spreadsheet ingestion, caching, and hybrid search.
#[derive(Parser)]
#[command(name = "adcat", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/adcat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Force a refresh from the configured source.
    Refresh,

    /// Print the cached catalog, refreshing first on a cache miss.
    Ads {
        /// Print at most this many ads.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Search the catalog.
    Search {
        /// Free-text query.
        query: String,
    },

    /// Remove the cached catalog.
    ClearCache,

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("ad_catalog=info".parse()?))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Refresh => {
            let catalog = AdCatalog::open(&cfg).await?;
            let snapshot = catalog.refresh().await?;
            println!("Refreshed {} ads.", snapshot.len());
        }
        Commands::Ads { limit } => {
            let catalog = AdCatalog::open(&cfg).await?;
            let snapshot = catalog.get_ads().await?;
            let shown = limit.unwrap_or(snapshot.len()).min(snapshot.len());
            print_json(&snapshot[..shown])?;
        }
        Commands::Search { query } => {
            let catalog = AdCatalog::open(&cfg).await?;
            let results = catalog.search(&query).await?;
            print_json(&results)?;
        }
        Commands::ClearCache => {
            let catalog = AdCatalog::open(&cfg).await?;
            catalog.clear_cache().await?;
            println!("Cache cleared.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
