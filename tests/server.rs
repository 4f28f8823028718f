//! HTTP API tests against a spawned server.

use ad_catalog::config::Config;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const ROWS: &str = r#"{
  "ads": [
    {"brand": "Mercedes", "industry": "Automotive", "format": "Interstitial", "video": "yes"},
    {"brand": "Fizz", "industry": "Beverages", "format": "Banner"}
  ],
  "formats": []
}"#;

fn test_config(tmp: &TempDir, rows_path: &Path, port: u16) -> Config {
    let toml_str = format!(
        r#"
[db]
path = "{db}"

[source]
kind = "file"
path = "{rows}"

[embedding]
provider = "disabled"

[server]
bind = "127.0.0.1:{port}"
"#,
        db = tmp.path().join("data/adcat.sqlite").display(),
        rows = rows_path.display(),
        port = port,
    );
    toml::from_str(&toml_str).unwrap()
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

async fn start_server(tmp: &TempDir, rows_path: &Path) -> String {
    let port = find_free_port();
    let cfg = test_config(tmp, rows_path, port);
    tokio::spawn(async move {
        ad_catalog::server::run_server(&cfg).await.unwrap();
    });
    wait_for_server(port).await;
    format!("http://127.0.0.1:{}", port)
}

#[tokio::test]
async fn test_api_routes() {
    let tmp = TempDir::new().unwrap();
    let rows_path = tmp.path().join("rows.json");
    fs::write(&rows_path, ROWS).unwrap();
    let base = start_server(&tmp, &rows_path).await;
    let client = reqwest::Client::new();

    // Health
    let health: serde_json::Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));

    // Ads
    let resp = client.get(format!("{}/api/ads", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"][0]["featureFlags"][0], "video");

    // Search
    let resp = client
        .post(format!("{}/api/search", base))
        .json(&serde_json::json!({ "query": "automotive launch" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["results"].as_array().unwrap().len(), 1);
    assert_eq!(body["results"][0]["brand"], "Mercedes");

    // Missing and blank queries
    for payload in [serde_json::json!({}), serde_json::json!({ "query": "  " })] {
        let resp = client
            .post(format!("{}/api/search", base))
            .json(&payload)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Query is required");
    }

    // Refresh fails at the index step with embeddings disabled; the cause
    // stays in the logs.
    let resp = client
        .post(format!("{}/api/refresh", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Failed to refresh ads data");

    // Clear cache
    let resp = client
        .post(format!("{}/api/clear-cache", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Cache cleared successfully");
}

#[tokio::test]
async fn test_unreachable_source_is_generic_500() {
    let tmp = TempDir::new().unwrap();
    let base = start_server(&tmp, &tmp.path().join("missing.json")).await;

    let resp = reqwest::get(format!("{}/api/ads", base)).await.unwrap();
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Failed to fetch ads data");
}
