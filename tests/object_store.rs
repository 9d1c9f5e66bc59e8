use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use axum::routing::{head, put};
use backsweep::config::ObjectStoreConfig;
use backsweep::core::backend::{
    Backend, BackendError, BackendPhase, CATALOG_OBJECT_KEY, ObjectStoreBackend,
};
use backsweep::core::{ActionKind, BackupJob, EntryAttributes, ErrorTier, Orchestrator, RunState};
use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

const BUCKET: &str = "backups";
const TOKEN: &str = "secret";

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    storage_class: Option<String>,
    mtime_ns: Option<String>,
}

#[derive(Clone, Default)]
struct FakeStore {
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
}

impl FakeStore {
    fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn head_bucket(UrlPath(bucket): UrlPath<String>, headers: HeaderMap) -> StatusCode {
    if !authorized(&headers) {
        StatusCode::FORBIDDEN
    } else if bucket != BUCKET {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    }
}

async fn put_object(
    State(store): State<FakeStore>,
    UrlPath((bucket, key)): UrlPath<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::FORBIDDEN;
    }
    if bucket != BUCKET {
        return StatusCode::NOT_FOUND;
    }
    let object = StoredObject {
        body: body.to_vec(),
        storage_class: header(&headers, "x-amz-storage-class"),
        mtime_ns: header(&headers, "x-amz-meta-mtime-ns"),
    };
    store.objects.lock().unwrap().insert(key, object);
    StatusCode::OK
}

async fn get_object(
    State(store): State<FakeStore>,
    UrlPath((_, key)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> Result<Vec<u8>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::FORBIDDEN);
    }
    store.get(&key).map(|o| o.body).ok_or(StatusCode::NOT_FOUND)
}

async fn delete_object(
    State(store): State<FakeStore>,
    UrlPath((_, key)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::FORBIDDEN;
    }
    match store.objects.lock().unwrap().remove(&key) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

/// Serve a fake object store on its own thread, returning its base URL.
fn spawn_store() -> (String, FakeStore) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let store = FakeStore::default();
    let app = Router::new()
        .route("/{bucket}", head(head_bucket))
        .route(
            "/{bucket}/{*key}",
            put(put_object).get(get_object).delete(delete_object),
        )
        .with_state(store.clone());

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
    });

    (format!("http://{addr}"), store)
}

fn config(endpoint: &str) -> ObjectStoreConfig {
    ObjectStoreConfig {
        enabled: true,
        endpoint: endpoint.to_string(),
        bucket: BUCKET.to_string(),
        access_token: Some(TOKEN.to_string()),
        reduced_redundancy: true,
        test_only: false,
        timeout_secs: 10,
    }
}

#[test]
fn test_put_fetch_delete() {
    let (endpoint, store) = spawn_store();
    let backend = ObjectStoreBackend::new(&config(&endpoint)).unwrap();
    backend.setup_initial().unwrap();

    let temp = tempdir().unwrap();
    let source = temp.path().join("report.txt");
    fs::write(&source, b"quarterly numbers").unwrap();
    let attributes = EntryAttributes::from_metadata(&fs::metadata(&source).unwrap());

    let written = backend
        .write_file("docs/my report.txt", &source, &attributes)
        .unwrap();
    assert_eq!(written, 17);

    let stored = store.get("docs/my report.txt").unwrap();
    assert_eq!(stored.body, b"quarterly numbers");
    assert_eq!(stored.storage_class.as_deref(), Some("REDUCED_REDUNDANCY"));
    assert_eq!(stored.mtime_ns, Some(attributes.modified_ns().to_string()));

    let target = temp.path().join("out/fetched.txt");
    assert_eq!(backend.fetch_file("docs/my report.txt", &target).unwrap(), 17);
    assert_eq!(fs::read(&target).unwrap(), b"quarterly numbers");

    backend.delete_file("docs/my report.txt").unwrap();
    assert!(store.get("docs/my report.txt").is_none());
    // Deleting again is not an error
    backend.delete_file("docs/my report.txt").unwrap();
    backend.delete_purge("docs").unwrap();
}

#[test]
fn test_fetch_missing_object_fails() {
    let (endpoint, _store) = spawn_store();
    let backend = ObjectStoreBackend::new(&config(&endpoint)).unwrap();

    let temp = tempdir().unwrap();
    let target = temp.path().join("missing.txt");
    let err = backend.fetch_file("missing.txt", &target).unwrap_err();

    assert!(matches!(err, BackendError::Status { status: 404, .. }));
    assert_eq!(err.tier(BackendPhase::Transfer), ErrorTier::Warning);
    assert!(!target.exists());
}

#[test]
fn test_test_only_mode_writes_nothing() {
    let (endpoint, store) = spawn_store();
    let mut cfg = config(&endpoint);
    cfg.test_only = true;
    let backend = ObjectStoreBackend::new(&cfg).unwrap();
    assert!(backend.is_test_only());

    backend.setup_initial().unwrap();

    let temp = tempdir().unwrap();
    let source = temp.path().join("a.txt");
    fs::write(&source, b"alpha").unwrap();
    let attributes = EntryAttributes::from_metadata(&fs::metadata(&source).unwrap());

    assert_eq!(backend.write_file("a.txt", &source, &attributes).unwrap(), 0);
    assert!(store.keys().is_empty());
}

#[test]
fn test_rejected_token_is_auth_error() {
    let (endpoint, _store) = spawn_store();
    let mut cfg = config(&endpoint);
    cfg.access_token = Some("wrong".to_string());
    let backend = ObjectStoreBackend::new(&cfg).unwrap();

    let err = backend.setup_initial().unwrap_err();
    assert!(matches!(err, BackendError::Auth { status: 403, .. }));
    assert_eq!(err.tier(BackendPhase::Setup), ErrorTier::Fatal);
}

#[test]
fn test_unknown_bucket_fails_setup() {
    let (endpoint, _store) = spawn_store();
    let mut cfg = config(&endpoint);
    cfg.bucket = "elsewhere".to_string();
    let backend = ObjectStoreBackend::new(&cfg).unwrap();

    assert!(matches!(
        backend.setup_initial(),
        Err(BackendError::Status { status: 404, .. })
    ));
}

#[test]
fn test_backup_to_object_store() {
    let (endpoint, store) = spawn_store();
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    fs::create_dir_all(source.join("docs")).unwrap();
    fs::write(source.join("a.txt"), b"alpha").unwrap();
    fs::write(source.join("docs/b.txt"), b"bravo").unwrap();

    let backend = ObjectStoreBackend::new(&config(&endpoint)).unwrap();
    let job = BackupJob::new(&source, temp.path().join("catalog.db"), vec![Box::new(backend)]);
    let (events, summary) = Orchestrator::new().start_backup(job).unwrap().wait();

    assert_eq!(summary.state, RunState::Completed);
    assert!(!summary.warning_occurred);
    let copied = events
        .iter()
        .filter_map(|e| e.as_action())
        .filter(|item| item.kind == ActionKind::Copy && item.percentage == 100)
        .count();
    assert_eq!(copied, 2);

    assert_eq!(
        store.keys(),
        vec![CATALOG_OBJECT_KEY.to_string(), "a.txt".to_string(), "docs/b.txt".to_string()]
    );
    assert_eq!(store.get("docs/b.txt").unwrap().body, b"bravo");
}

#[test]
fn test_test_only_run_does_not_mark_files_stored() {
    let (endpoint, store) = spawn_store();
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    fs::create_dir_all(&source).unwrap();
    fs::write(source.join("a.txt"), b"alpha").unwrap();
    let catalog = temp.path().join("catalog.db");

    let mut dry = config(&endpoint);
    dry.test_only = true;
    let backend = ObjectStoreBackend::new(&dry).unwrap();
    let job = BackupJob::new(&source, &catalog, vec![Box::new(backend)]);
    let (events, summary) = Orchestrator::new().start_backup(job).unwrap().wait();

    assert_eq!(summary.state, RunState::Completed);
    assert!(store.keys().is_empty());
    assert!(
        events
            .iter()
            .filter_map(|e| e.as_action())
            .all(|item| item.kind != ActionKind::Copy)
    );

    // A real run over the same catalog still has everything to store
    let backend = ObjectStoreBackend::new(&config(&endpoint)).unwrap();
    let job = BackupJob::new(&source, &catalog, vec![Box::new(backend)]);
    let (_, summary) = Orchestrator::new().start_backup(job).unwrap().wait();

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(
        store.keys(),
        vec![CATALOG_OBJECT_KEY.to_string(), "a.txt".to_string()]
    );
    assert_eq!(store.get("a.txt").unwrap().body, b"alpha");
}
