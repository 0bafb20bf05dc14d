//! Integration tests that run the API in-process
//!
//! Downloads go through the real process launcher; the external tools are
//! replaced by small shell scripts that mimic wget/curl output and exit codes.

#![cfg(unix)]

use axum_test::TestServer;
use serde_json::Value;
use serial_test::serial;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use weights_manager::{
    ArtifactDescriptor, Catalog, CatalogSettings, DownloadSettings, Orchestrator,
    OrchestratorDeps, SessionStore, SourceCandidate, ToolKind,
    api::routes::{AppState, create_router},
    config::ToolPaths,
    metrics,
    strategy::{HttpFetcher, SystemToolLauncher},
    system::FixedProbe,
};

// Global metrics handle - only initialize once per test process
static METRICS_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> metrics_exporter_prometheus::PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| metrics::setup_metrics().expect("Failed to setup metrics"))
        .clone()
}

/// Writes the scratch file named after `-O`/`-o`, reporting progress on stderr
const SUCCEEDING_TOOL: &str = r#"#!/bin/sh
out=""
prev=""
for arg in "$@"; do
    if [ "$prev" = "-O" ] || [ "$prev" = "-o" ]; then out="$arg"; fi
    prev="$arg"
done
printf '  10%%\n' >&2
sleep 1
printf 'GGUF-weights' > "$out"
printf '##########  100.0%%\r' >&2
exit 0
"#;

const FAILING_TOOL: &str = r#"#!/bin/sh
echo "Resolving huggingface.co... failed: Name or service not known." >&2
exit 4
"#;

const SLOW_TOOL: &str = r#"#!/bin/sh
printf '  5%%\n' >&2
exec sleep 30
"#;

fn write_tool(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("Failed to write tool script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to chmod tool script");
    path.to_string_lossy().into_owned()
}

struct TestEnv {
    server: TestServer,
    temp_dir: TempDir,
}

impl TestEnv {
    fn download_dir(&self) -> PathBuf {
        self.temp_dir.path().join("models")
    }

    fn scratch_dir(&self) -> PathBuf {
        self.temp_dir.path().join("tmp")
    }
}

/// Helper to create a test server whose wget/curl are the given scripts
fn create_test_server(wget: &str, curl: &str) -> TestEnv {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let tools = ToolPaths {
        wget: write_tool(temp_dir.path(), "wget", wget),
        curl: write_tool(temp_dir.path(), "curl", curl),
    };

    let settings = CatalogSettings {
        download_path: temp_dir.path().join("models"),
        temp_path: temp_dir.path().join("tmp"),
        allowed_domains: vec!["huggingface.co".to_string()],
        stall_timeout: Duration::from_secs(60),
        ram_threshold_gb: 2.5,
    };
    let artifacts = vec![
        ArtifactDescriptor {
            id: "tiny-model".to_string(),
            name: "Tiny Model".to_string(),
            filename: "tiny-model.gguf".to_string(),
            size_gb: 0.5,
            sources: vec![SourceCandidate::Direct {
                url: "https://huggingface.co/org/tiny-model.gguf".to_string(),
            }],
        },
        ArtifactDescriptor {
            id: "curl-only".to_string(),
            name: "Curl Only".to_string(),
            filename: "curl-only.gguf".to_string(),
            size_gb: 1.0,
            sources: vec![SourceCandidate::Tool {
                method: ToolKind::Curl,
                url: "https://cdn.huggingface.co/org/curl-only.gguf".to_string(),
            }],
        },
    ];
    let catalog = Catalog::new(settings, artifacts).expect("Failed to build catalog");
    catalog.ensure_dirs().expect("Failed to create dirs");

    let download = DownloadSettings {
        tools,
        retry: weights_manager::retry::RetryPolicy {
            max_attempts: 2,
            backoff: Duration::from_millis(100),
        },
        ..Default::default()
    };

    let deps = OrchestratorDeps {
        fetcher: Arc::new(HttpFetcher::new(Duration::from_secs(5)).expect("client")),
        launcher: Arc::new(SystemToolLauncher::new(Duration::from_millis(500))),
        // Never enough memory: every download goes through the tools
        probe: Arc::new(FixedProbe(0.0)),
        sessions: SessionStore::new(),
    };

    let state = AppState {
        orchestrator: Orchestrator::new(catalog, download, deps),
        prometheus_handle: get_metrics_handle(),
    };

    let app = create_router(state);
    let server = TestServer::try_new(app).expect("Failed to create test server");

    TestEnv { server, temp_dir }
}

/// Parse the `data:` lines of an SSE body into JSON events
fn sse_events(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("event is JSON"))
        .collect()
}

fn event_types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|e| e["type"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
#[serial]
async fn test_health_endpoint() {
    let env = create_test_server(SUCCEEDING_TOOL, SUCCEEDING_TOOL);

    let response = env.server.get("/health").await;

    assert_eq!(response.status_code(), 200);

    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_downloads"], 0);
    assert_eq!(body["available_ram_gb"], 0.0);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
#[serial]
async fn test_metrics_endpoint() {
    let env = create_test_server(SUCCEEDING_TOOL, SUCCEEDING_TOOL);

    let response = env.server.get("/metrics").await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
#[serial]
async fn test_list_and_status() {
    let env = create_test_server(SUCCEEDING_TOOL, SUCCEEDING_TOOL);

    let body: Value = env.server.get("/api/models").await.json();
    assert_eq!(body["success"], true);
    let models = body["models"].as_array().unwrap();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0]["id"], "tiny-model");
    assert_eq!(models[0]["is_downloaded"], false);
    assert!(models[0]["file_path"].is_null());

    let response = env.server.get("/api/models/tiny-model/status").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["name"], "Tiny Model");
    assert_eq!(body["is_downloading"], false);
    assert_eq!(body["progress"], 0);
}

#[tokio::test]
#[serial]
async fn test_status_errors() {
    let env = create_test_server(SUCCEEDING_TOOL, SUCCEEDING_TOOL);

    let response = env.server.get("/api/models/missing/status").await;
    assert_eq!(response.status_code(), 404);
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("missing"));
    assert!(body["timestamp"].is_string());

    let response = env.server.get("/api/models/bad%20id/status").await;
    assert_eq!(response.status_code(), 400);

    let response = env.server.get("/api/models/bad%3Bid/download").await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
#[serial]
async fn test_download_streams_to_completion() {
    let env = create_test_server(SUCCEEDING_TOOL, FAILING_TOOL);

    let response = env.server.get("/api/models/tiny-model/download").await;
    assert_eq!(response.status_code(), 200);

    let events = sse_events(&response.text());
    let types = event_types(&events);
    assert_eq!(types.first().map(String::as_str), Some("started"));
    assert_eq!(types.last().map(String::as_str), Some("completed"));
    assert_eq!(events.last().unwrap()["method"], "wget");

    let progress: Vec<u64> = events
        .iter()
        .filter(|e| e["type"] == "progress")
        .map(|e| e["progress"].as_u64().unwrap())
        .collect();
    assert_eq!(progress.last(), Some(&100));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));

    let final_file = env.download_dir().join("tiny-model.gguf");
    assert_eq!(std::fs::read(&final_file).unwrap(), b"GGUF-weights");
    assert!(!env.scratch_dir().join("tiny-model.gguf.tmp").exists());

    // Second request is a no-op
    let response = env.server.get("/api/models/tiny-model/download").await;
    let events = sse_events(&response.text());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "completed");
    assert_eq!(events[0]["message"], "Already downloaded");

    let body: Value = env.server.get("/api/models/tiny-model/status").await.json();
    assert_eq!(body["is_downloaded"], true);
    assert!(body["file_path"].as_str().unwrap().ends_with("tiny-model.gguf"));
}

#[tokio::test]
#[serial]
async fn test_download_falls_back_to_curl() {
    let env = create_test_server(FAILING_TOOL, SUCCEEDING_TOOL);

    let response = env.server.get("/api/models/tiny-model/download").await;
    let events = sse_events(&response.text());

    let warnings = events.iter().filter(|e| e["type"] == "warning").count();
    assert_eq!(warnings, 1);
    assert!(events.iter().any(|e| e["message"] == "Attempt 2/2"));
    assert_eq!(events.last().unwrap()["type"], "completed");
    assert_eq!(events.last().unwrap()["method"], "curl");
}

#[tokio::test]
#[serial]
async fn test_download_all_methods_fail() {
    let env = create_test_server(FAILING_TOOL, FAILING_TOOL);

    let response = env.server.get("/api/models/curl-only/download").await;
    let events = sse_events(&response.text());

    let last = events.last().unwrap();
    assert_eq!(last["type"], "error");
    assert_eq!(last["message"], "all methods failed");
    assert_eq!(last["code"], "all_sources_exhausted");

    assert!(!env.download_dir().join("curl-only.gguf").exists());
    assert!(!env.scratch_dir().join("curl-only.gguf.tmp").exists());
}

#[tokio::test]
#[serial]
async fn test_cancel_unknown_download() {
    let env = create_test_server(SUCCEEDING_TOOL, SUCCEEDING_TOOL);

    let response = env.server.delete("/api/models/tiny-model/download").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "No active download");
}

#[tokio::test]
#[serial]
async fn test_cancel_running_download() {
    let env = create_test_server(SLOW_TOOL, SLOW_TOOL);

    let download = env.server.get("/api/models/tiny-model/download");
    let cancel = async {
        // Give the tool time to start
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let body: Value = env.server.get("/api/models/tiny-model/status").await.json();
            if body["is_downloading"] == true {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        env.server.delete("/api/models/tiny-model/download").await
    };

    let (download, cancel) = tokio::join!(download, cancel);

    let body: Value = cancel.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Cancelled");

    let events = sse_events(&download.text());
    let cancelled = events.iter().filter(|e| e["type"] == "cancelled").count();
    assert_eq!(cancelled, 1);
    assert_eq!(events.last().unwrap()["type"], "cancelled");

    let body: Value = env.server.get("/api/models/tiny-model/status").await.json();
    assert_eq!(body["is_downloading"], false);
    assert_eq!(body["is_downloaded"], false);
    assert!(!env.scratch_dir().join("tiny-model.gguf.tmp").exists());
}
