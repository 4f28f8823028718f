//! TOML configuration.
//!
//! Only `[db]` is required; every other section falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/adcat.sqlite"
//!
//! [source]
//! kind = "sheets"
//! spreadsheet_id = "1AbC..."
//!
//! [cache]
//! ttl_secs = 3600
//!
//! [embedding]
//! provider = "local"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Where source rows come from.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Google Sheets v4 REST API.
    Sheets(SheetsSourceConfig),
    /// A local JSON file holding `{"ads": [...], "formats": [...]}`.
    File(FileSourceConfig),
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Sheets(SheetsSourceConfig::default())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SheetsSourceConfig {
    #[serde(default)]
    pub spreadsheet_id: String,
    /// Position of the ad sheet within the spreadsheet.
    #[serde(default)]
    pub ads_sheet_index: usize,
    /// Position of the format lookup sheet within the spreadsheet.
    #[serde(default = "default_formats_sheet_index")]
    pub formats_sheet_index: usize,
    /// Service-account JSON key file. Takes precedence over every other
    /// credential when set.
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
    /// Environment variable holding the key file path, used when
    /// `credentials_path` is unset.
    #[serde(default = "default_credentials_env")]
    pub credentials_env: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_sheets_base_url")]
    pub base_url: String,
}

impl Default for SheetsSourceConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id: String::new(),
            ads_sheet_index: 0,
            formats_sheet_index: default_formats_sheet_index(),
            credentials_path: None,
            credentials_env: default_credentials_env(),
            api_key_env: default_api_key_env(),
            token_env: default_token_env(),
            base_url: default_sheets_base_url(),
        }
    }
}

fn default_formats_sheet_index() -> usize {
    1
}
fn default_credentials_env() -> String {
    "GOOGLE_SERVICE_ACCOUNT_KEY".to_string()
}
fn default_api_key_env() -> String {
    "GOOGLE_SHEETS_API_KEY".to_string()
}
fn default_token_env() -> String {
    "GOOGLE_SHEETS_TOKEN".to_string()
}
fn default_sheets_base_url() -> String {
    "https://sheets.googleapis.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileSourceConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Prefix joined with each row's `screenshot_path` to form the thumbnail URL.
    #[serde(default = "default_image_base_url")]
    pub image_base_url: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            image_base_url: default_image_base_url(),
        }
    }
}

fn default_image_base_url() -> String {
    "https://dev-mizu-adcreator.s3.ap-south-1.amazonaws.com/dev-asset/".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_key")]
    pub key: String,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key: default_cache_key(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_cache_key() -> String {
    "ads_data".to_string()
}
fn default_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RefreshConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    20
}

/// Upper bounds for each class of external call.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    #[serde(default = "default_source_secs")]
    pub source_secs: u64,
    #[serde(default = "default_cache_secs")]
    pub cache_secs: u64,
    #[serde(default = "default_index_secs")]
    pub index_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            source_secs: default_source_secs(),
            cache_secs: default_cache_secs(),
            index_secs: default_index_secs(),
        }
    }
}

fn default_source_secs() -> u64 {
    30
}
fn default_cache_secs() -> u64 {
    5
}
fn default_index_secs() -> u64 {
    120
}

impl TimeoutConfig {
    pub fn source(&self) -> Duration {
        Duration::from_secs(self.source_secs)
    }
    pub fn cache(&self) -> Duration {
        Duration::from_secs(self.cache_secs)
    }
    pub fn index(&self) -> Duration {
        Duration::from_secs(self.index_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3001".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Checks cross-field constraints that serde defaults cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.cache.key.trim().is_empty() {
        anyhow::bail!("cache.key must not be empty");
    }
    if config.cache.ttl_secs == 0 {
        anyhow::bail!("cache.ttl_secs must be > 0");
    }
    if config.refresh.interval_secs == 0 {
        anyhow::bail!("refresh.interval_secs must be > 0");
    }
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.timeout_secs == 0 {
        anyhow::bail!("embedding.timeout_secs must be > 0");
    }
    if config.timeouts.source_secs == 0
        || config.timeouts.cache_secs == 0
        || config.timeouts.index_secs == 0
    {
        anyhow::bail!("timeouts must all be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or local.",
            other
        ),
    }

    Ok(())
}
