use backsweep::core::backend::{Backend, BackendError, MirrorBackend};
use backsweep::core::orchestrator::FatalFailure;
use backsweep::core::{
    ActionKind, BackupJob, EntryAttributes, IgnoreRules, Orchestrator, RunEvent, RunState,
    RunSummary,
};
use backsweep::db::{Catalog, holdings, records, runs, settings};
use filetime::FileTime;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::{TempDir, tempdir};

struct Fixture {
    _temp: TempDir,
    source: PathBuf,
    mirror: PathBuf,
    catalog: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source");
        let mirror = temp.path().join("mirror");
        let catalog = temp.path().join("state/catalog.db");
        fs::create_dir_all(&source).unwrap();
        Self {
            _temp: temp,
            source,
            mirror,
            catalog,
        }
    }

    fn write(&self, relative: &str, content: &[u8]) {
        let path = self.source.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn mirror_backend(&self) -> Box<dyn Backend> {
        Box::new(MirrorBackend::new(&self.mirror).sync_files(false))
    }

    fn job(&self) -> BackupJob {
        BackupJob::new(&self.source, &self.catalog, vec![self.mirror_backend()])
    }

    fn backup(&self) -> (Vec<RunEvent>, RunSummary) {
        run(self.job())
    }
}

fn run(job: BackupJob) -> (Vec<RunEvent>, RunSummary) {
    Orchestrator::new().start_backup(job).unwrap().wait()
}

/// Paths of completed actions of one kind, in event order.
fn completed(events: &[RunEvent], kind: ActionKind) -> Vec<String> {
    events
        .iter()
        .filter_map(RunEvent::as_action)
        .filter(|item| item.kind == kind && item.percentage == 100)
        .map(|item| item.path.clone())
        .collect()
}

fn sorted(mut paths: Vec<String>) -> Vec<String> {
    paths.sort();
    paths
}

#[test]
fn test_backup_copies_new_files_then_skips_them() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    fx.write("docs/b.txt", b"bravo");
    fx.write("docs/deep/c.txt", b"charlie");

    let (events, summary) = fx.backup();
    assert_eq!(summary.state, RunState::Completed);
    assert!(!summary.cancelled);
    assert!(!summary.warning_occurred);
    assert_eq!(
        sorted(completed(&events, ActionKind::Copy)),
        vec!["a.txt", "docs/b.txt", "docs/deep/c.txt"]
    );
    assert!(matches!(events.first(), Some(RunEvent::State(RunState::Running))));
    assert!(matches!(events.last(), Some(RunEvent::Finished(_))));

    assert_eq!(fs::read(fx.mirror.join("docs/deep/c.txt")).unwrap(), b"charlie");
    let source_mtime =
        FileTime::from_last_modification_time(&fs::metadata(fx.source.join("a.txt")).unwrap());
    let mirror_mtime =
        FileTime::from_last_modification_time(&fs::metadata(fx.mirror.join("a.txt")).unwrap());
    assert_eq!(source_mtime, mirror_mtime);

    // Second run over an unchanged tree
    let (events, summary) = fx.backup();
    assert_eq!(summary.state, RunState::Completed);
    assert!(completed(&events, ActionKind::Copy).is_empty());
    assert!(completed(&events, ActionKind::Purge).is_empty());
    assert!(completed(&events, ActionKind::Hash).is_empty());
    assert_eq!(completed(&events, ActionKind::Skip).len(), 3);
    assert_eq!(summary.stats.files_skipped, 3);
}

#[test]
fn test_purge_of_deleted_file() {
    let fx = Fixture::new();
    fx.write("keep.txt", b"keep");
    fx.write("docs/gone.txt", b"gone");
    fx.backup();
    assert!(fx.mirror.join("docs/gone.txt").exists());

    fs::remove_file(fx.source.join("docs/gone.txt")).unwrap();
    let (events, summary) = fx.backup();

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(completed(&events, ActionKind::Purge), vec!["docs/gone.txt"]);
    assert!(!fx.mirror.join("docs/gone.txt").exists());
    assert!(fx.mirror.join("keep.txt").exists());

    let catalog = Catalog::open(&fx.catalog).unwrap();
    assert!(records::get(&catalog, "docs/gone.txt").unwrap().is_none());
    assert!(records::get(&catalog, "keep.txt").unwrap().is_some());
}

#[test]
fn test_purge_of_deleted_folder() {
    let fx = Fixture::new();
    fx.write("docs/old/a.txt", b"a");
    fx.write("docs/old/nested/b.txt", b"b");
    fx.write("docs/current.txt", b"current");
    fx.backup();

    fs::remove_dir_all(fx.source.join("docs/old")).unwrap();
    let (events, summary) = fx.backup();

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(
        sorted(completed(&events, ActionKind::Purge)),
        vec!["docs/old", "docs/old/a.txt", "docs/old/nested/b.txt"]
    );
    assert!(!fx.mirror.join("docs/old").exists());
    assert!(fx.mirror.join("docs/current.txt").exists());

    let catalog = Catalog::open(&fx.catalog).unwrap();
    assert_eq!(records::list_folders(&catalog).unwrap(), vec!["docs"]);
    assert_eq!(records::count(&catalog).unwrap(), 1);
}

#[test]
fn test_cancel_mid_hash_leaves_backends_untouched() {
    let fx = Fixture::new();
    let v1 = vec![b'1'; 4 * 1024 * 1024];
    let v2 = vec![b'2'; 4 * 1024 * 1024];

    fx.write("big.bin", &v1);
    let (_, summary) = run(fx.job().hash_chunk_size(4096));
    assert_eq!(summary.state, RunState::Completed);

    fx.write("big.bin", &v2);
    filetime::set_file_mtime(
        fx.source.join("big.bin"),
        FileTime::from_unix_time(2_000_000_000, 0),
    )
    .unwrap();

    let mut handle = Orchestrator::new()
        .start_backup(fx.job().hash_chunk_size(4096))
        .unwrap();

    let mut seen = Vec::new();
    while let Some(event) = handle.next_event() {
        let hashing = event
            .as_action()
            .is_some_and(|item| item.kind == ActionKind::Hash && item.path == "big.bin");
        seen.push(event);
        if hashing {
            break;
        }
    }
    handle.cancel();
    let (rest, summary) = handle.wait();
    seen.extend(rest);

    assert_eq!(summary.state, RunState::Cancelled);
    assert!(summary.cancelled);
    assert!(!summary.warning_occurred);
    assert!(
        seen.iter()
            .filter_map(RunEvent::as_action)
            .all(|item| item.kind != ActionKind::Copy)
    );

    assert_eq!(fs::read(fx.mirror.join("big.bin")).unwrap(), v1);
    assert!(!fx.mirror.join(".big.bin.partial").exists());

    let catalog = Catalog::open(&fx.catalog).unwrap();
    let record = records::get(&catalog, "big.bin").unwrap().unwrap();
    assert_eq!(record.hash, blake3::hash(&v1).into());
    assert_eq!(
        settings::get(&catalog, settings::LAST_BACKUP_STATUS)
            .unwrap()
            .as_deref(),
        Some("Cancelled")
    );
}

/// Deletes whichever top-level source folder is not being written on the
/// first write, simulating a subtree vanishing mid-scan.
struct VanishingBackend {
    inner: MirrorBackend,
    source: PathBuf,
    fired: AtomicBool,
}

impl Backend for VanishingBackend {
    fn name(&self) -> &str {
        "vanishing"
    }

    fn destination(&self) -> String {
        self.inner.destination()
    }

    fn setup_initial(&self) -> Result<(), BackendError> {
        self.inner.setup_initial()
    }

    fn write_file(
        &self,
        relative_path: &str,
        source: &Path,
        attributes: &EntryAttributes,
    ) -> Result<u64, BackendError> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let victim = if relative_path.starts_with("x/") { "y" } else { "x" };
            fs::remove_dir_all(self.source.join(victim)).unwrap();
        }
        self.inner.write_file(relative_path, source, attributes)
    }

    fn delete_file(&self, relative_path: &str) -> Result<(), BackendError> {
        self.inner.delete_file(relative_path)
    }

    fn delete_purge(&self, prefix: &str) -> Result<(), BackendError> {
        self.inner.delete_purge(prefix)
    }

    fn fetch_file(&self, relative_path: &str, target: &Path) -> Result<u64, BackendError> {
        self.inner.fetch_file(relative_path, target)
    }
}

#[test]
fn test_vanished_folder_does_not_abort_run() {
    let fx = Fixture::new();
    for folder in ["x", "y"] {
        for name in ["1.txt", "2.txt", "sub/3.txt"] {
            fx.write(&format!("{folder}/{name}"), name.as_bytes());
        }
    }

    let backend = VanishingBackend {
        inner: MirrorBackend::new(&fx.mirror).sync_files(false),
        source: fx.source.clone(),
        fired: AtomicBool::new(false),
    };
    let (events, summary) = run(BackupJob::new(&fx.source, &fx.catalog, vec![Box::new(backend)]));

    assert_eq!(summary.state, RunState::Completed);
    assert!(!summary.warning_occurred);

    let kept = if fx.source.join("x").exists() { "x" } else { "y" };
    let expected: Vec<String> = ["1.txt", "2.txt", "sub/3.txt"]
        .iter()
        .map(|name| format!("{kept}/{name}"))
        .collect();
    assert_eq!(sorted(completed(&events, ActionKind::Copy)), expected);
    for path in &expected {
        assert!(fx.mirror.join(path).exists());
    }

    let catalog = Catalog::open(&fx.catalog).unwrap();
    assert_eq!(records::count(&catalog).unwrap(), 3);
}

#[test]
fn test_backend_setup_failure_is_fatal() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    // A file where the mirror folder should be
    fs::write(&fx.mirror, b"not a folder").unwrap();

    let (events, summary) = fx.backup();

    assert_eq!(summary.state, RunState::Error);
    assert!(matches!(
        summary.failure,
        Some(FatalFailure::BackendSetup { ref backend, .. }) if backend == "mirror"
    ));
    assert!(completed(&events, ActionKind::Copy).is_empty());

    let catalog = Catalog::open(&fx.catalog).unwrap();
    assert_eq!(records::count(&catalog).unwrap(), 0);
}

#[test]
fn test_catalog_lock_contention_is_fatal() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");

    let held = Catalog::open(&fx.catalog).unwrap();
    let (events, summary) = fx.backup();

    assert_eq!(summary.state, RunState::Error);
    assert_eq!(
        summary.failure,
        Some(FatalFailure::CatalogInUse {
            lock_path: fx.catalog.with_file_name("catalog.db.lock")
        })
    );
    assert!(completed(&events, ActionKind::Copy).is_empty());
    assert!(!fx.mirror.join("a.txt").exists());

    held.close().unwrap();
    let (_, summary) = fx.backup();
    assert_eq!(summary.state, RunState::Completed);
}

#[test]
fn test_missing_source_root_is_fatal() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    fx.backup();

    fs::remove_dir_all(&fx.source).unwrap();
    let (events, summary) = fx.backup();

    assert_eq!(summary.state, RunState::Error);
    assert!(completed(&events, ActionKind::Purge).is_empty());
    assert!(fx.mirror.join("a.txt").exists());
}

#[test]
fn test_ignore_rules_and_catalog_self_exclusion() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    let mirror = temp.path().join("mirror");
    let catalog_path = source.join(".meta/catalog.db");

    for (path, content) in [
        ("keep.txt", &b"keep"[..]),
        ("scratch.tmp", b"tmp"),
        ("node_modules/lib.js", b"js"),
        ("src/node_modules/inner.js", b"js"),
    ] {
        let full = source.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    let rules = IgnoreRules::new("*.tmp", Vec::<String>::new(), ["node_modules"]).unwrap();
    let job = BackupJob::new(
        &source,
        &catalog_path,
        vec![Box::new(MirrorBackend::new(&mirror).sync_files(false))],
    )
    .rules(rules);
    let (events, summary) = run(job);

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(
        sorted(completed(&events, ActionKind::Copy)),
        vec!["keep.txt", "src/node_modules/inner.js"]
    );
    assert!(!mirror.join(".meta/catalog.db").exists());
    assert!(!mirror.join("node_modules").exists());
}

/// Accepts setup but rejects every write.
struct RejectingBackend;

impl Backend for RejectingBackend {
    fn name(&self) -> &str {
        "rejecting"
    }

    fn destination(&self) -> String {
        "nowhere".to_string()
    }

    fn setup_initial(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn write_file(&self, relative_path: &str, _: &Path, _: &EntryAttributes) -> Result<u64, BackendError> {
        Err(BackendError::Config {
            backend: "rejecting".to_string(),
            message: format!("refused {}", relative_path),
        })
    }

    fn delete_file(&self, _: &str) -> Result<(), BackendError> {
        Ok(())
    }

    fn delete_purge(&self, _: &str) -> Result<(), BackendError> {
        Ok(())
    }

    fn fetch_file(&self, relative_path: &str, _: &Path) -> Result<u64, BackendError> {
        Err(BackendError::Config {
            backend: "rejecting".to_string(),
            message: format!("no {}", relative_path),
        })
    }
}

#[test]
fn test_backend_write_failure_is_a_warning() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");

    let job = || {
        BackupJob::new(
            &fx.source,
            &fx.catalog,
            vec![fx.mirror_backend(), Box::new(RejectingBackend)],
        )
    };

    let (events, summary) = run(job());
    assert_eq!(summary.state, RunState::Completed);
    assert!(summary.warning_occurred);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::Warning { path, .. } if path == "a.txt"
    )));
    // The healthy backend still received the file
    assert_eq!(fs::read(fx.mirror.join("a.txt")).unwrap(), b"alpha");

    // The rejecting backend is retried on the next run, the mirror is not
    let (events, summary) = run(job());
    assert!(summary.warning_occurred);
    assert!(completed(&events, ActionKind::Copy).is_empty());
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::Warning { path, .. } if path == "a.txt"
    )));

    let catalog = Catalog::open(&fx.catalog).unwrap();
    assert!(records::get(&catalog, "a.txt").unwrap().is_some());
    let held: Vec<String> = holdings::for_path(&catalog, "a.txt").unwrap().into_keys().collect();
    assert_eq!(held, vec!["mirror"]);
    assert_eq!(
        settings::get(&catalog, settings::LAST_BACKUP_WARNING)
            .unwrap()
            .as_deref(),
        Some("true")
    );
}

#[test]
fn test_partially_stored_file_is_purged_where_held() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    fx.write("b.txt", b"bravo");

    let job = || {
        BackupJob::new(
            &fx.source,
            &fx.catalog,
            vec![fx.mirror_backend(), Box::new(RejectingBackend)],
        )
    };
    run(job());
    assert!(fx.mirror.join("a.txt").exists());

    fs::remove_file(fx.source.join("a.txt")).unwrap();
    let (events, summary) = run(job());

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(completed(&events, ActionKind::Purge), vec!["a.txt"]);
    assert!(!fx.mirror.join("a.txt").exists());
    assert!(fx.mirror.join("b.txt").exists());

    let catalog = Catalog::open(&fx.catalog).unwrap();
    assert!(records::get(&catalog, "a.txt").unwrap().is_none());
    assert_eq!(holdings::paths(&catalog).unwrap(), vec!["b.txt"]);
}

#[test]
fn test_empty_file_is_hashed_and_copied() {
    let fx = Fixture::new();
    fx.write("empty.txt", b"");

    let (events, summary) = fx.backup();
    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(completed(&events, ActionKind::Hash), vec!["empty.txt"]);
    assert_eq!(completed(&events, ActionKind::Copy), vec!["empty.txt"]);
    assert_eq!(fs::read(fx.mirror.join("empty.txt")).unwrap(), b"");
}

#[test]
fn test_touched_file_with_same_content_is_skipped() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    fx.backup();

    let touched = FileTime::from_unix_time(1_900_000_000, 0);
    filetime::set_file_mtime(fx.source.join("a.txt"), touched).unwrap();

    let (events, summary) = fx.backup();
    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(completed(&events, ActionKind::Hash), vec!["a.txt"]);
    assert_eq!(completed(&events, ActionKind::Skip), vec!["a.txt"]);
    assert!(completed(&events, ActionKind::Copy).is_empty());

    let catalog = Catalog::open(&fx.catalog).unwrap();
    let record = records::get(&catalog, "a.txt").unwrap().unwrap();
    assert_eq!(record.modified(), touched);
}

#[test]
fn test_run_outcome_and_snapshot_are_recorded() {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");

    let (_, summary) = fx.backup();
    assert_eq!(summary.state, RunState::Completed);
    assert!(fx.mirror.join(".backsweep/catalog.db").exists());

    let catalog = Catalog::open(&fx.catalog).unwrap();
    assert_eq!(
        settings::get(&catalog, settings::LAST_BACKUP_STATUS)
            .unwrap()
            .as_deref(),
        Some("Completed")
    );
    assert_eq!(
        settings::get(&catalog, settings::SOURCE_ROOT).unwrap(),
        Some(fx.source.display().to_string())
    );

    let history = runs::recent(&catalog, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, "backup");
    assert_eq!(history[0].status, "Completed");
    assert!(history[0].finished_at.is_some());
}
