use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn adcat_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("adcat");
    path
}

const ROWS: &str = r#"{
  "ads": [
    {"Account": "Acme Motors", "Brand": "Mercedes", "Industry": "Automotive",
     "Format": "Interstitial", "video": "yes", "gallery": "Yes",
     "screenshot_path": "shots/merc.png", "previewurl": "https://preview/1"},
    {"Account": "Fizz Co", "Brand": "Fizz", "Industry": "Beverages",
     "Format": "Banner", "feed_carousel": "yes"},
    {"Account": "Run Inc", "Brand": "Stride", "Industry": "Sportswear",
     "Format": "Interstitial"}
  ],
  "formats": [
    {"Format": "Interstitial", "Description": "Full screen", "Specs": "https://specs/int"}
  ]
}"#;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    fs::write(root.join("rows.json"), ROWS).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/adcat.sqlite"

[source]
kind = "file"
path = "{root}/rows.json"

[ingest]
image_base_url = "https://img.example/"

[embedding]
provider = "disabled"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("adcat.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_adcat(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = adcat_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run adcat binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env();

    let (stdout, stderr, ok) = run_adcat(&config, &["init"]);
    assert!(ok, "first init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully."));

    let (_, stderr, ok) = run_adcat(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let (stdout, stderr, ok) = run_adcat(Path::new("/nonexistent/adcat.toml"), &["init"]);
    assert!(!ok);
    assert!(stdout.is_empty());
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_refresh_without_embeddings_reports_index_failure() {
    let (_tmp, config) = setup_test_env();
    run_adcat(&config, &["init"]);

    let (_, stderr, ok) = run_adcat(&config, &["refresh"]);
    assert!(!ok);
    assert!(stderr.contains("Vector index unavailable"), "stderr: {}", stderr);
}

#[test]
fn test_ads_served_from_cache_when_index_unavailable() {
    let (_tmp, config) = setup_test_env();
    run_adcat(&config, &["init"]);

    let (stdout, stderr, ok) = run_adcat(&config, &["ads"]);
    assert!(ok, "ads failed: {}", stderr);

    let ads: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let ads = ads.as_array().unwrap();
    assert_eq!(ads.len(), 3);
    assert_eq!(ads[0]["id"], 1);
    assert_eq!(ads[0]["brand"], "Mercedes");
    assert_eq!(ads[0]["formatDescription"], "Full screen");
    assert_eq!(ads[0]["thumbnail"], "https://img.example/shots/merc.png");
    assert_eq!(ads[0]["features"], "gallery,video");
    assert_eq!(ads[1]["featureFlags"][0], "feed carousel");
    assert_eq!(ads[1]["formatDescription"], "");

    let (stdout, _, ok) = run_adcat(&config, &["ads", "--limit", "1"]);
    assert!(ok);
    let ads: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(ads.as_array().unwrap().len(), 1);
}

#[test]
fn test_search_falls_back_to_keywords() {
    let (_tmp, config) = setup_test_env();
    run_adcat(&config, &["init"]);

    let (stdout, stderr, ok) = run_adcat(&config, &["search", "Mercedes new model launch"]);
    assert!(ok, "search failed: {}", stderr);
    let results: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["brand"], "Mercedes");
}

#[test]
fn test_search_rejects_blank_query() {
    let (_tmp, config) = setup_test_env();
    run_adcat(&config, &["init"]);

    let (_, stderr, ok) = run_adcat(&config, &["search", "   "]);
    assert!(!ok);
    assert!(stderr.contains("Query is required"));
}

#[test]
fn test_clear_cache() {
    let (_tmp, config) = setup_test_env();
    run_adcat(&config, &["init"]);
    run_adcat(&config, &["ads"]);

    let (stdout, stderr, ok) = run_adcat(&config, &["clear-cache"]);
    assert!(ok, "clear-cache failed: {}", stderr);
    assert!(stdout.contains("Cache cleared."));
}
