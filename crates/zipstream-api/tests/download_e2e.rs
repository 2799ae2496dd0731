//! End-to-end tests: the real router and middleware over in-memory
//! backends, exercised through a spawned listener with a real HTTP client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Semaphore};

use zipstream_api::config::{Config, StorageType};
use zipstream_api::server::Server;
use zipstream_api::signature::Verifier;
use zipstream_core::db::ManifestStore;
use zipstream_core::storage::{MemoryBackend, ObjectBackend, ObjectReader, S3Options};
use zipstream_core::{DownloadManifest, Error, Result};

// ============================================================================
// Harness
// ============================================================================

struct StaticManifests(HashMap<String, DownloadManifest>);

impl StaticManifests {
    fn one(manifest: DownloadManifest) -> Arc<Self> {
        let mut map = HashMap::new();
        map.insert(manifest.id.clone(), manifest);
        Arc::new(Self(map))
    }
}

#[async_trait]
impl ManifestStore for StaticManifests {
    async fn lookup(&self, id: &str) -> Result<DownloadManifest> {
        self.0
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("manifest {id}")))
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}

/// Backend whose fetches block until the test opens the gate; used to pin
/// a download in flight.
struct GatedBackend {
    inner: MemoryBackend,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl ObjectBackend for GatedBackend {
    async fn open(&self, bucket: &str, key: &str) -> Result<ObjectReader> {
        let _permit = self.gate.acquire().await.expect("gate closed");
        self.inner.open(bucket, key).await
    }

    async fn health(&self) -> Result<()> {
        self.inner.health().await
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

fn base_config() -> Config {
    Config {
        db_url: "postgres://unused/test".to_string(),
        db_engine: zipstream_core::db::Engine::Postgres,
        db_max_connections: 5,
        table_name: "downloads".to_string(),
        id_field: "id".to_string(),
        key_prefix: String::new(),
        storage_type: StorageType::S3,
        storage_path: None,
        s3: S3Options::default(),
        enforce_signing: false,
        signing_secret: Vec::new(),
        ignore_missing: false,
        max_concurrent_fetches: 4,
        max_active_downloads: 0,
        max_files_per_request: 0,
        rate_limit_per_ip: 0.0,
        allowed_extensions: Vec::new(),
        blocked_extensions: Vec::new(),
        allow_password_protected: false,
        append_ymd: false,
        sanitize_filenames: false,
        database_query_timeout: Duration::from_secs(5),
        storage_fetch_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(30),
        storage_max_retries: 0,
        storage_retry_delay: Duration::from_millis(1),
        circuit_breaker_threshold: 5,
        circuit_breaker_timeout: Duration::from_secs(60),
        circuit_breaker_max_requests: 2,
        callback_max_retries: 0,
        callback_retry_delay: Duration::from_millis(1),
        port: 0,
        metrics_username: None,
        metrics_password: None,
    }
}

fn manifest(id: &str, objects: &[&str]) -> DownloadManifest {
    DownloadManifest {
        id: id.to_string(),
        bucket: "b".to_string(),
        objects: objects.iter().map(|s| (*s).to_string()).collect(),
        ..DownloadManifest::default()
    }
}

async fn spawn_app(
    config: Config,
    manifests: Arc<dyn ManifestStore>,
    backend: Arc<dyn ObjectBackend>,
) -> (String, oneshot::Sender<()>) {
    // Idempotent; the first test to get here installs the recorder.
    let _ = zipstream_api::metrics::init_metrics();

    let server = Server::new(config, manifests, backend);
    let app = server
        .test_router()
        .into_make_service_with_connect_info::<SocketAddr>();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("serve app");
    });

    (format!("http://{addr}"), shutdown_tx)
}

async fn read_entries(bytes: Vec<u8>) -> Vec<(String, Vec<u8>)> {
    let reader = async_zip::base::read::mem::ZipFileReader::new(bytes)
        .await
        .expect("archive must parse");
    let mut entries = Vec::new();
    for index in 0..reader.file().entries().len() {
        let name = reader.file().entries()[index]
            .filename()
            .as_str()
            .expect("utf-8 entry name")
            .to_string();
        let mut body = Vec::new();
        reader
            .reader_with_entry(index)
            .await
            .expect("entry reader")
            .read_to_end_checked(&mut body)
            .await
            .expect("entry body");
        entries.push((name, body));
    }
    entries
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn s1_basic_single_file() {
    let backend = MemoryBackend::new();
    backend.insert("b", "a.txt", b"hello".as_slice());
    let (base, shutdown) = spawn_app(
        base_config(),
        StaticManifests::one(manifest("t1", &["a.txt"])),
        Arc::new(backend),
    )
    .await;

    let response = reqwest::get(format!("{base}/t1")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/zip"
    );
    assert_eq!(
        response.headers().get("content-disposition").unwrap(),
        "attachment; filename=\"download.zip\""
    );
    assert!(response.headers().contains_key("x-request-id"));

    let entries = read_entries(response.bytes().await.unwrap().to_vec()).await;
    assert_eq!(entries, vec![("a.txt".to_string(), b"hello".to_vec())]);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn s2_multi_file_bodies_byte_equal() {
    let backend = MemoryBackend::new();
    backend.insert("b", "a.txt", b"alpha".as_slice());
    backend.insert("b", "b.json", br#"{"ok":true}"#.as_slice());
    backend.insert("b", "c.csv", b"x,y\n1,2".as_slice());
    let (base, shutdown) = spawn_app(
        base_config(),
        StaticManifests::one(manifest("t2", &["a.txt", "b.json", "c.csv"])),
        Arc::new(backend),
    )
    .await;

    let response = reqwest::get(format!("{base}/t2")).await.unwrap();
    assert_eq!(response.status(), 200);

    let mut entries = read_entries(response.bytes().await.unwrap().to_vec()).await;
    entries.sort();
    assert_eq!(
        entries,
        vec![
            ("a.txt".to_string(), b"alpha".to_vec()),
            ("b.json".to_string(), br#"{"ok":true}"#.to_vec()),
            ("c.csv".to_string(), b"x,y\n1,2".to_vec()),
        ]
    );
    let _ = shutdown.send(());
}

#[tokio::test]
async fn s3_missing_object_skipped_when_ignoring() {
    let backend = MemoryBackend::new();
    backend.insert("b", "exists", b"kept".as_slice());
    let mut config = base_config();
    config.ignore_missing = true;
    let (base, shutdown) = spawn_app(
        config,
        StaticManifests::one(manifest("t3", &["exists", "missing"])),
        Arc::new(backend),
    )
    .await;

    let response = reqwest::get(format!("{base}/t3")).await.unwrap();
    assert_eq!(response.status(), 200);

    let entries = read_entries(response.bytes().await.unwrap().to_vec()).await;
    assert_eq!(entries, vec![("exists".to_string(), b"kept".to_vec())]);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn s4_missing_object_without_ignore_still_streams_prior_entries() {
    let backend = MemoryBackend::new();
    backend.insert("b", "exists", b"kept".as_slice());
    let mut config = base_config();
    config.max_concurrent_fetches = 1;
    let (base, shutdown) = spawn_app(
        config,
        StaticManifests::one(manifest("t4", &["exists", "missing"])),
        Arc::new(backend),
    )
    .await;

    // Headers were already sent; the outcome is failed but the client sees
    // a 200 and whatever was encoded before the fatal error.
    let response = reqwest::get(format!("{base}/t4")).await.unwrap();
    assert_eq!(response.status(), 200);
    let entries = read_entries(response.bytes().await.unwrap().to_vec()).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "exists");
    let _ = shutdown.send(());
}

#[tokio::test]
async fn s5_expired_request_is_410() {
    let backend = MemoryBackend::new();
    backend.insert("b", "a.txt", b"hello".as_slice());
    let (base, shutdown) = spawn_app(
        base_config(),
        StaticManifests::one(manifest("t5", &["a.txt"])),
        Arc::new(backend),
    )
    .await;

    let expired = chrono::Utc::now().timestamp() - 60;
    let response = reqwest::get(format!("{base}/t5?expiry={expired}")).await.unwrap();
    assert_eq!(response.status(), 410);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn s6_second_request_within_window_is_rate_limited() {
    let backend = MemoryBackend::new();
    backend.insert("b", "a.txt", b"hello".as_slice());
    let mut config = base_config();
    config.rate_limit_per_ip = 1.0;
    let (base, shutdown) = spawn_app(
        config,
        StaticManifests::one(manifest("t6", &["a.txt"])),
        Arc::new(backend),
    )
    .await;

    let first = reqwest::get(format!("{base}/t6")).await.unwrap();
    assert_eq!(first.status(), 200);
    let _ = first.bytes().await;

    let second = reqwest::get(format!("{base}/t6")).await.unwrap();
    assert_eq!(second.status(), 429);
    assert!(second.headers().contains_key("retry-after"));
    let _ = shutdown.send(());
}

#[tokio::test]
async fn s7_capacity_rejects_second_concurrent_download() {
    let backend = MemoryBackend::new();
    backend.insert("b", "a.txt", b"hello".as_slice());
    let gate = Arc::new(Semaphore::new(0));
    let gated = GatedBackend {
        inner: backend,
        gate: Arc::clone(&gate),
    };
    let mut config = base_config();
    config.max_active_downloads = 1;
    let (base, shutdown) = spawn_app(
        config,
        StaticManifests::one(manifest("t7", &["a.txt"])),
        Arc::new(gated),
    )
    .await;

    // First download is admitted and parks on the gated fetch.
    let first = reqwest::get(format!("{base}/t7")).await.unwrap();
    assert_eq!(first.status(), 200);

    let second = reqwest::get(format!("{base}/t7")).await.unwrap();
    assert_eq!(second.status(), 503);

    // Open the gate, drain the first download, and the slot frees up.
    gate.add_permits(16);
    let entries = read_entries(first.bytes().await.unwrap().to_vec()).await;
    assert_eq!(entries.len(), 1);

    let mut third_status = 503;
    for _ in 0..50 {
        third_status = reqwest::get(format!("{base}/t7"))
            .await
            .unwrap()
            .status()
            .as_u16();
        if third_status == 200 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(third_status, 200);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn s8_path_traversal_fails_the_attempt() {
    use axum::routing::post;
    use axum::{Json, Router};

    let seen = Arc::new(tokio::sync::Mutex::new(Vec::<serde_json::Value>::new()));
    let seen_state = Arc::clone(&seen);
    let hook = Router::new().route(
        "/hook",
        post(move |Json(body): Json<serde_json::Value>| {
            let seen_state = Arc::clone(&seen_state);
            async move {
                seen_state.lock().await.push(body);
                axum::http::StatusCode::OK
            }
        }),
    );
    let hook_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hook_addr = hook_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(hook_listener, hook).await.unwrap();
    });

    let base_dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(base_dir.path().join("files")).unwrap();
    let backend = zipstream_core::storage::LocalBackend::new(base_dir.path()).unwrap();

    let mut m = manifest("t8", &["../../etc/passwd"]);
    m.bucket = "files".to_string();
    m.callback = Some(format!("http://{hook_addr}/hook"));
    let (base, shutdown) = spawn_app(base_config(), StaticManifests::one(m), Arc::new(backend)).await;

    // Headers already say 200; the authoritative outcome arrives via the
    // callback and the archive carries no entries.
    let response = reqwest::get(format!("{base}/t8")).await.unwrap();
    assert_eq!(response.status(), 200);
    let entries = read_entries(response.bytes().await.unwrap().to_vec()).await;
    assert!(entries.is_empty());

    let mut delivered = None;
    for _ in 0..100 {
        {
            let seen = seen.lock().await;
            if let Some(first) = seen.first() {
                delivered = Some(first.clone());
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let payload = delivered.expect("callback must be delivered");
    assert_eq!(payload["status"], "failed");
    assert!(payload["message"]
        .as_str()
        .unwrap()
        .contains("path traversal"));
    let _ = shutdown.send(());
}

// ============================================================================
// Edges beyond the seeded scenarios
// ============================================================================

#[tokio::test]
async fn unknown_manifest_is_404() {
    let (base, shutdown) = spawn_app(
        base_config(),
        StaticManifests::one(manifest("known", &["a.txt"])),
        Arc::new(MemoryBackend::new()),
    )
    .await;

    let response = reqwest::get(format!("{base}/unknown")).await.unwrap();
    assert_eq!(response.status(), 404);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn root_path_is_missing_id() {
    let (base, shutdown) = spawn_app(
        base_config(),
        StaticManifests::one(manifest("x", &["a.txt"])),
        Arc::new(MemoryBackend::new()),
    )
    .await;

    let response = reqwest::get(format!("{base}/")).await.unwrap();
    assert_eq!(response.status(), 400);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn too_many_files_is_400() {
    let mut config = base_config();
    config.max_files_per_request = 1;
    let (base, shutdown) = spawn_app(
        config,
        StaticManifests::one(manifest("t", &["a.txt", "b.txt"])),
        Arc::new(MemoryBackend::new()),
    )
    .await;

    let response = reqwest::get(format!("{base}/t")).await.unwrap();
    assert_eq!(response.status(), 400);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn fully_filtered_manifest_is_400() {
    let mut config = base_config();
    config.blocked_extensions = vec!["txt".to_string()];
    let (base, shutdown) = spawn_app(
        config,
        StaticManifests::one(manifest("t", &["a.txt", "b.txt"])),
        Arc::new(MemoryBackend::new()),
    )
    .await;

    let response = reqwest::get(format!("{base}/t")).await.unwrap();
    assert_eq!(response.status(), 400);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn enforced_signing_gates_the_download() {
    let backend = MemoryBackend::new();
    backend.insert("b", "a.txt", b"signed".as_slice());
    let mut config = base_config();
    config.enforce_signing = true;
    config.signing_secret = b"e2e-secret".to_vec();
    let (base, shutdown) = spawn_app(
        config,
        StaticManifests::one(manifest("t", &["a.txt"])),
        Arc::new(backend),
    )
    .await;

    let unsigned = reqwest::get(format!("{base}/t")).await.unwrap();
    assert_eq!(unsigned.status(), 401);

    let expiry = (chrono::Utc::now().timestamp() + 600).to_string();
    let signature = Verifier::new(b"e2e-secret".to_vec(), true).sign("t", Some(&expiry));
    let signed = reqwest::get(format!("{base}/t?expiry={expiry}&signature={signature}"))
        .await
        .unwrap();
    assert_eq!(signed.status(), 200);

    let entries = read_entries(signed.bytes().await.unwrap().to_vec()).await;
    assert_eq!(entries[0].1, b"signed");
    let _ = shutdown.send(());
}

#[tokio::test]
async fn request_id_is_echoed_and_custom_headers_applied() {
    let backend = MemoryBackend::new();
    backend.insert("b", "a.txt", b"hello".as_slice());
    let mut m = manifest("t", &["a.txt"]);
    m.name = Some("Quarterly Report".to_string());
    m.custom_headers = Some(HashMap::from([(
        "x-origin".to_string(),
        "zipstream".to_string(),
    )]));
    let (base, shutdown) = spawn_app(base_config(), StaticManifests::one(m), Arc::new(backend)).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{base}/t"))
        .header("x-request-id", "corr-123")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("x-request-id").unwrap(), "corr-123");
    assert_eq!(response.headers().get("x-origin").unwrap(), "zipstream");
    assert_eq!(
        response.headers().get("content-disposition").unwrap(),
        "attachment; filename=\"Quarterly Report.zip\""
    );
    let _ = shutdown.send(());
}

#[tokio::test]
async fn callback_reports_completed_outcome() {
    use axum::routing::post;
    use axum::{Json, Router};

    let seen = Arc::new(tokio::sync::Mutex::new(Vec::<serde_json::Value>::new()));
    let seen_state = Arc::clone(&seen);
    let hook = Router::new().route(
        "/hook",
        post(move |Json(body): Json<serde_json::Value>| {
            let seen_state = Arc::clone(&seen_state);
            async move {
                seen_state.lock().await.push(body);
                axum::http::StatusCode::OK
            }
        }),
    );
    let hook_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hook_addr = hook_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(hook_listener, hook).await.unwrap();
    });

    let backend = MemoryBackend::new();
    backend.insert("b", "a.txt", b"hello".as_slice());
    let mut m = manifest("t", &["a.txt"]);
    m.callback = Some(format!("http://{hook_addr}/hook"));
    let (base, shutdown) = spawn_app(base_config(), StaticManifests::one(m), Arc::new(backend)).await;

    let response = reqwest::get(format!("{base}/t")).await.unwrap();
    let _ = response.bytes().await.unwrap();

    let mut delivered = None;
    for _ in 0..100 {
        {
            let seen = seen.lock().await;
            if let Some(first) = seen.first() {
                delivered = Some(first.clone());
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let payload = delivered.expect("callback must be delivered");
    assert_eq!(payload["id"], "t");
    assert_eq!(payload["status"], "completed");
    assert_eq!(payload["file_count"], 1);
    assert!(payload["compressed_size_bytes"].as_u64().unwrap() > 0);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn health_reports_unhealthy_storage() {
    let backend = MemoryBackend::new();
    let (base, shutdown) = spawn_app(
        base_config(),
        StaticManifests::one(manifest("t", &["a.txt"])),
        Arc::new(backend.clone()),
    )
    .await;

    let healthy = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(healthy.status(), 200);
    let body: serde_json::Value = healthy.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["database"], "ok");
    assert_eq!(body["checks"]["storage"], "ok");

    backend.set_unhealthy(true);
    let unhealthy = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(unhealthy.status(), 503);
    let body: serde_json::Value = unhealthy.json().await.unwrap();
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["storage"], "unavailable");
    let _ = shutdown.send(());
}

#[tokio::test]
async fn metrics_endpoint_honors_basic_auth() {
    let mut config = base_config();
    config.metrics_username = Some("ops".to_string());
    config.metrics_password = Some("hunter2".to_string());
    let (base, shutdown) = spawn_app(
        config,
        StaticManifests::one(manifest("t", &["a.txt"])),
        Arc::new(MemoryBackend::new()),
    )
    .await;

    let anonymous = reqwest::get(format!("{base}/metrics")).await.unwrap();
    assert_eq!(anonymous.status(), 401);

    let client = reqwest::Client::new();
    let authed = client
        .get(format!("{base}/metrics"))
        .basic_auth("ops", Some("hunter2"))
        .send()
        .await
        .unwrap();
    assert_eq!(authed.status(), 200);
    let _ = shutdown.send(());
}
