//! Source record providers.
//!
//! A provider returns the two row sets the refresh pipeline consumes: ad rows
//! and format lookup rows. Built-in providers:
//!
//! | Kind | Provider |
//! |------|----------|
//! | `sheets` | [`SheetsProvider`]: Google Sheets v4 REST API |
//! | `file` | [`FileProvider`]: local JSON document |
//!
//! # Sheets credentials
//!
//! Checked in this order:
//! 1. A service-account JSON key, from `[source].credentials_path` or the
//!    file named by `GOOGLE_SERVICE_ACCOUNT_KEY`. Access tokens are minted
//!    with a signed JWT assertion and re-minted shortly before they expire.
//! 2. `GOOGLE_SHEETS_TOKEN`: a pre-minted OAuth bearer token
//! 3. `GOOGLE_SHEETS_API_KEY`: API key for sheets shared by link

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::{Config, FileSourceConfig, SheetsSourceConfig, SourceConfig};
use crate::models::{SourceRow, SourceRows};

/// Supplies raw catalog rows.
///
/// Implementations perform their own I/O; the refresh orchestrator applies
/// the overall timeout and wraps failures as provider errors.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Short label for logs (e.g. `"sheets"`).
    fn name(&self) -> &str;

    /// Fetch ad rows and format rows.
    async fn fetch(&self) -> Result<SourceRows>;
}

/// Create the provider selected by `[source].kind`.
pub fn create_provider(config: &Config) -> Result<Arc<dyn SourceProvider>> {
    match &config.source {
        SourceConfig::Sheets(sheets) => Ok(Arc::new(SheetsProvider::new(
            sheets.clone(),
            config.timeouts.source(),
        )?)),
        SourceConfig::File(file) => Ok(Arc::new(FileProvider::new(file.clone()))),
    }
}

// ============ File provider ============

/// Reads `{"ads": [...], "formats": [...]}` from disk on every fetch.
///
/// Column names are normalized the same way as spreadsheet headers.
pub struct FileProvider {
    config: FileSourceConfig,
}

impl FileProvider {
    pub fn new(config: FileSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SourceProvider for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch(&self) -> Result<SourceRows> {
        let path = &self.config.path;
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read source file: {}", path.display()))?;
        let rows: SourceRows = serde_json::from_str(&content)
            .with_context(|| format!("Malformed source file: {}", path.display()))?;
        Ok(SourceRows {
            ads: rows.ads.into_iter().map(normalize_row).collect(),
            formats: rows.formats.into_iter().map(normalize_row).collect(),
        })
    }
}

fn normalize_row(row: SourceRow) -> SourceRow {
    row.into_iter()
        .map(|(k, v)| (normalize_header(&k), v))
        .collect()
}

fn normalize_header(header: &str) -> String {
    header.trim().to_lowercase()
}

// ============ Service account ============

const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets.readonly";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// A cached token this close to expiry is replaced before use.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Mints and caches OAuth access tokens for a Google service account.
struct ServiceAccount {
    client_email: String,
    token_uri: String,
    signing_key: EncodingKey,
    client: reqwest::Client,
    cached: Mutex<Option<AccessToken>>,
}

impl ServiceAccount {
    fn from_file(path: &Path, client: reqwest::Client) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service account key: {}", path.display()))?;
        let key: ServiceAccountKey = serde_json::from_str(&content)
            .with_context(|| format!("Malformed service account key: {}", path.display()))?;
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("Service account private_key is not an RSA PEM key")?;
        Ok(Self {
            client_email: key.client_email,
            token_uri: key.token_uri,
            signing_key,
            client,
            cached: Mutex::new(None),
        })
    }

    /// A token valid for at least [`EXPIRY_SKEW`], minting one if needed.
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + EXPIRY_SKEW {
                return Ok(token.value.clone());
            }
        }
        let token = self.mint().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn mint(&self) -> Result<AccessToken> {
        let iat = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: SHEETS_SCOPE,
            aud: &self.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };
        let header = Header::new(Algorithm::RS256);
        let assertion = jsonwebtoken::encode(&header, &claims, &self.signing_key)
            .context("Failed to sign service account assertion")?;

        let requested = Instant::now();
        let resp = self
            .client
            .post(&self.token_uri)
            .form(&[
                ("grant_type", JWT_BEARER_GRANT),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .context("Service account token request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Token endpoint error {}: {}", status, body);
        }
        let token: TokenResponse = resp.json().await.context("Malformed token response")?;

        tracing::debug!(
            account = %self.client_email,
            expires_in = token.expires_in,
            "minted service account token"
        );
        Ok(AccessToken {
            value: token.access_token,
            expires_at: requested + Duration::from_secs(token.expires_in),
        })
    }
}

fn service_account_path(config: &SheetsSourceConfig) -> Option<PathBuf> {
    config.credentials_path.clone().or_else(|| {
        std::env::var_os(&config.credentials_env)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
}

// ============ Sheets provider ============

/// Reads the ad sheet and the format sheet of one spreadsheet.
///
/// Sheets are addressed by position: titles are looked up from the
/// spreadsheet metadata first, then each sheet's values are fetched. The
/// first row of each sheet is the header row.
pub struct SheetsProvider {
    config: SheetsSourceConfig,
    client: reqwest::Client,
    service_account: Option<ServiceAccount>,
}

enum SheetsAuth {
    Bearer(String),
    ApiKey(String),
}

#[derive(Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

impl SheetsProvider {
    pub fn new(config: SheetsSourceConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let service_account = service_account_path(&config)
            .map(|path| ServiceAccount::from_file(&path, client.clone()))
            .transpose()?;
        Ok(Self {
            config,
            client,
            service_account,
        })
    }

    async fn auth(&self) -> Result<SheetsAuth> {
        if let Some(account) = &self.service_account {
            return Ok(SheetsAuth::Bearer(account.access_token().await?));
        }
        if let Ok(token) = std::env::var(&self.config.token_env) {
            if !token.is_empty() {
                return Ok(SheetsAuth::Bearer(token));
            }
        }
        if let Ok(key) = std::env::var(&self.config.api_key_env) {
            if !key.is_empty() {
                return Ok(SheetsAuth::ApiKey(key));
            }
        }
        bail!(
            "No Google Sheets credentials: set source.credentials_path, {}, {} or {}",
            self.config.credentials_env,
            self.config.token_env,
            self.config.api_key_env
        )
    }

    fn url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.config.base_url)
            .with_context(|| format!("Invalid sheets base_url: {}", self.config.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("sheets base_url cannot be a base"))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.config.spreadsheet_id.as_str()])
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: reqwest::Url,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let mut req = self.client.get(url.clone()).query(query);
        req = match self.auth().await? {
            SheetsAuth::Bearer(token) => req.bearer_auth(token),
            SheetsAuth::ApiKey(key) => req.query(&[("key", key)]),
        };

        let resp = req
            .send()
            .await
            .with_context(|| format!("Sheets request failed: {}", url.path()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Sheets API error {}: {}", status, body);
        }
        Ok(resp.json().await?)
    }

    async fn sheet_titles(&self) -> Result<Vec<String>> {
        let meta: SpreadsheetMeta = self
            .get_json(self.url(&[])?, &[("fields", "sheets.properties.title")])
            .await?;
        Ok(meta.sheets.into_iter().map(|s| s.properties.title).collect())
    }

    async fn sheet_rows(&self, title: &str) -> Result<Vec<SourceRow>> {
        let range: ValueRange = self
            .get_json(self.url(&["values", title])?, &[])
            .await
            .with_context(|| format!("Failed to load sheet '{}'", title))?;
        Ok(rows_from_values(range.values))
    }
}

#[async_trait]
impl SourceProvider for SheetsProvider {
    fn name(&self) -> &str {
        "sheets"
    }

    async fn fetch(&self) -> Result<SourceRows> {
        if self.config.spreadsheet_id.is_empty() {
            bail!("source.spreadsheet_id is not configured");
        }

        let titles = self.sheet_titles().await?;
        let title_at = |index: usize| {
            titles.get(index).cloned().ok_or_else(|| {
                anyhow::anyhow!(
                    "Spreadsheet has {} sheets, no sheet at index {}",
                    titles.len(),
                    index
                )
            })
        };
        let ads_title = title_at(self.config.ads_sheet_index)?;
        let formats_title = title_at(self.config.formats_sheet_index)?;

        let (ads, formats) = tokio::try_join!(
            self.sheet_rows(&ads_title),
            self.sheet_rows(&formats_title)
        )?;

        tracing::debug!(
            ads = ads.len(),
            formats = formats.len(),
            "fetched rows from spreadsheet"
        );
        Ok(SourceRows { ads, formats })
    }
}

/// Converts a header row plus data rows into keyed rows.
///
/// Short rows leave trailing columns absent; empty header cells are skipped.
fn rows_from_values(values: Vec<Vec<String>>) -> Vec<SourceRow> {
    let mut iter = values.into_iter();
    let headers: Vec<String> = match iter.next() {
        Some(h) => h.iter().map(|s| normalize_header(s)).collect(),
        None => return Vec::new(),
    };

    iter.map(|cells| {
        headers
            .iter()
            .zip(cells)
            .filter(|(h, _)| !h.is_empty())
            .map(|(h, v)| (h.clone(), v))
            .collect()
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path as AxumPath, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Form, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn strings(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rows_from_values_headers_normalized() {
        let values = vec![
            strings(&[" Brand ", "Filtered Click", ""]),
            strings(&["Nike", "12", "ignored"]),
            strings(&["Adidas"]),
        ];
        let rows = rows_from_values(values);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["brand"], "Nike");
        assert_eq!(rows[0]["filtered click"], "12");
        assert_eq!(rows[0].len(), 2);
        assert_eq!(rows[1]["brand"], "Adidas");
        assert!(!rows[1].contains_key("filtered click"));
    }

    #[test]
    fn test_rows_from_values_empty() {
        assert!(rows_from_values(Vec::new()).is_empty());
        assert!(rows_from_values(vec![strings(&["brand"])]).is_empty());
    }

    #[test]
    fn test_sheets_url_encodes_title() {
        let provider = SheetsProvider::new(
            SheetsSourceConfig {
                spreadsheet_id: "abc".to_string(),
                ..SheetsSourceConfig::default()
            },
            Duration::from_secs(1),
        )
        .unwrap();
        let url = provider.url(&["values", "Ad List"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/abc/values/Ad%20List"
        );
    }

    #[tokio::test]
    async fn test_file_provider_normalizes_columns() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("rows.json");
        std::fs::write(
            &path,
            r#"{"ads": [{"Brand": "Nike", "Format": "Banner"}],
                "formats": [{"FORMAT": "Banner", "Description": "Top"}]}"#,
        )
        .unwrap();
        let provider = FileProvider::new(FileSourceConfig { path });
        let rows = provider.fetch().await.unwrap();
        assert_eq!(rows.ads[0]["brand"], "Nike");
        assert_eq!(rows.formats[0]["description"], "Top");
    }

    #[tokio::test]
    async fn test_file_provider_missing_file() {
        let provider = FileProvider::new(FileSourceConfig {
            path: "/nonexistent/rows.json".into(),
        });
        let err = provider.fetch().await.unwrap_err();
        assert!(err.to_string().contains("Failed to read source file"));
    }

    // ============ Service account ============

    const TEST_PRIVATE_KEY: &str = include_str!("../tests/fixtures/service_account_test_key.pem");
    const TEST_PUBLIC_KEY: &str =
        include_str!("../tests/fixtures/service_account_test_key.pub.pem");

    #[derive(Deserialize)]
    struct SeenClaims {
        iss: String,
        scope: String,
        aud: String,
    }

    #[derive(Deserialize)]
    struct TokenForm {
        grant_type: String,
        assertion: String,
    }

    struct FakeGoogle {
        token_uri: String,
        expires_in: u64,
        minted: AtomicUsize,
    }

    async fn fake_token(
        State(google): State<Arc<FakeGoogle>>,
        Form(form): Form<TokenForm>,
    ) -> Result<Json<serde_json::Value>, StatusCode> {
        if form.grant_type != JWT_BEARER_GRANT {
            return Err(StatusCode::BAD_REQUEST);
        }
        let mut validation = jsonwebtoken::Validation::new(Algorithm::RS256);
        validation.set_audience(&[google.token_uri.as_str()]);
        let key = jsonwebtoken::DecodingKey::from_rsa_pem(TEST_PUBLIC_KEY.as_bytes())
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let claims = jsonwebtoken::decode::<SeenClaims>(&form.assertion, &key, &validation)
            .map_err(|_| StatusCode::UNAUTHORIZED)?
            .claims;
        if claims.iss != "reader@adcat-test.iam.gserviceaccount.com"
            || claims.scope != SHEETS_SCOPE
            || claims.aud != google.token_uri
        {
            return Err(StatusCode::UNAUTHORIZED);
        }

        let n = google.minted.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Json(serde_json::json!({
            "access_token": format!("sa-token-{}", n),
            "expires_in": google.expires_in,
            "token_type": "Bearer",
        })))
    }

    fn authorized(headers: &HeaderMap) -> Result<(), StatusCode> {
        let bearer = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if bearer.starts_with("Bearer sa-token-") {
            Ok(())
        } else {
            Err(StatusCode::UNAUTHORIZED)
        }
    }

    async fn fake_meta(headers: HeaderMap) -> Result<Json<serde_json::Value>, StatusCode> {
        authorized(&headers)?;
        Ok(Json(serde_json::json!({
            "sheets": [
                {"properties": {"title": "Ads"}},
                {"properties": {"title": "Formats"}},
            ]
        })))
    }

    async fn fake_values(
        headers: HeaderMap,
        AxumPath((_, title)): AxumPath<(String, String)>,
    ) -> Result<Json<serde_json::Value>, StatusCode> {
        authorized(&headers)?;
        let values = match title.as_str() {
            "Ads" => serde_json::json!([["Brand", "Format"], ["Nike", "Banner"]]),
            _ => serde_json::json!([["Format", "Description"], ["Banner", "Top slot"]]),
        };
        Ok(Json(serde_json::json!({ "values": values })))
    }

    /// Serves the token endpoint and the two Sheets routes on a free port.
    async fn spawn_fake_google(expires_in: u64) -> (String, Arc<FakeGoogle>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let google = Arc::new(FakeGoogle {
            token_uri: format!("{}/token", base),
            expires_in,
            minted: AtomicUsize::new(0),
        });
        let app = Router::new()
            .route("/token", post(fake_token))
            .route("/v4/spreadsheets/{id}", get(fake_meta))
            .route("/v4/spreadsheets/{id}/values/{title}", get(fake_values))
            .with_state(google.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (base, google)
    }

    fn service_account_provider(
        tmp: &tempfile::TempDir,
        base: &str,
        token_uri: &str,
    ) -> SheetsProvider {
        let key_path = tmp.path().join("service-account.json");
        let key = serde_json::json!({
            "type": "service_account",
            "client_email": "reader@adcat-test.iam.gserviceaccount.com",
            "private_key": TEST_PRIVATE_KEY,
            "token_uri": token_uri,
        });
        std::fs::write(&key_path, key.to_string()).unwrap();
        SheetsProvider::new(
            SheetsSourceConfig {
                spreadsheet_id: "abc".to_string(),
                credentials_path: Some(key_path),
                base_url: base.to_string(),
                ..SheetsSourceConfig::default()
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_service_account_token_reused_until_near_expiry() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (base, google) = spawn_fake_google(3600).await;
        let provider = service_account_provider(&tmp, &base, &google.token_uri);

        let rows = provider.fetch().await.unwrap();
        assert_eq!(rows.ads[0]["brand"], "Nike");
        assert_eq!(rows.formats[0]["description"], "Top slot");
        provider.fetch().await.unwrap();

        // Six authorized requests, one minted token.
        assert_eq!(google.minted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_service_account_token_reminted_when_expiring() {
        let tmp = tempfile::TempDir::new().unwrap();
        // Shorter than the expiry skew: every request needs a new token.
        let (base, google) = spawn_fake_google(30).await;
        let provider = service_account_provider(&tmp, &base, &google.token_uri);

        provider.fetch().await.unwrap();
        assert_eq!(google.minted.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_service_account_rejects_bad_key() {
        let tmp = tempfile::TempDir::new().unwrap();
        let key_path = tmp.path().join("bad.json");
        std::fs::write(
            &key_path,
            r#"{"client_email": "x@y", "private_key": "not a pem"}"#,
        )
        .unwrap();
        let err = ServiceAccount::from_file(&key_path, reqwest::Client::new())
            .err()
            .expect("bad key must be rejected");
        assert!(err.to_string().contains("RSA PEM"));
    }
}
