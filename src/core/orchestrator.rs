//! Backup and restore runs.
//!
//! A run executes on its own worker thread and reports back only through
//! [`RunEvent`]s on a bounded channel. Cancellation is cooperative: the
//! worker polls the token between files, hash chunks and backend dispatches,
//! so a write that has started always finishes.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

use crate::core::backend::{Backend, BackendError, CATALOG_OBJECT_KEY};
use crate::core::entry::{ContentHash, DEFAULT_CHUNK_SIZE, EntryAttributes, FileEntry};
use crate::core::error::{EntryError, ErrorTier};
use crate::core::ignore::{self, IgnoreRules};
use crate::core::progress::{ActionKind, BackupActionItem, RunEvent, percent};
use crate::core::tree::TreeTraverser;
use crate::db::catalog::{Catalog, CatalogError};
use crate::db::records::{self, CatalogRecord};
use crate::db::{holdings, runs, settings};
use crate::logging::LogThrottle;

/// Events buffered between the worker and the consumer before the worker
/// blocks.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

const WORKER_THREAD_NAME: &str = "backsweep-worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Error,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
            Self::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Backup,
    Restore,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub files_scanned: u64,
    pub files_copied: u64,
    pub files_skipped: u64,
    pub files_purged: u64,
    pub folders_purged: u64,
    pub bytes_copied: u64,
    pub warnings: u64,
}

/// Why a run ended in [`RunState::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FatalFailure {
    #[error("catalog is in use by another process (lock file {})", .lock_path.display())]
    CatalogInUse { lock_path: PathBuf },

    #[error("{message}")]
    Catalog { message: String },

    #[error("backend '{backend}' setup failed: {message}")]
    BackendSetup { backend: String, message: String },

    #[error("{message}")]
    Other { message: String },
}

/// Final outcome of a run, also delivered as the last [`RunEvent`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub kind: RunKind,
    pub state: RunState,
    pub cancelled: bool,
    pub warning_occurred: bool,
    pub failure: Option<FatalFailure>,
    pub stats: RunStats,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("a run is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("backend '{backend}' setup failed: {source}")]
    BackendSetup {
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error("source root {} is not a readable folder", .0.display())]
    SourceUnavailable(PathBuf),

    #[error("cannot prepare restore destination {}: {source}", .path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to fetch catalog snapshot: {0}")]
    SnapshotFetch(#[source] BackendError),

    #[error("failed to start run worker: {0}")]
    Spawn(#[source] io::Error),
}

impl RunError {
    pub fn tier(&self) -> ErrorTier {
        ErrorTier::Fatal
    }

    pub fn to_failure(&self) -> FatalFailure {
        match self {
            Self::Catalog(CatalogError::InUse { lock_path }) => FatalFailure::CatalogInUse {
                lock_path: lock_path.clone(),
            },
            Self::Catalog(e) => FatalFailure::Catalog {
                message: e.to_string(),
            },
            Self::BackendSetup { backend, source } => FatalFailure::BackendSetup {
                backend: backend.clone(),
                message: source.to_string(),
            },
            other => FatalFailure::Other {
                message: other.to_string(),
            },
        }
    }
}

/// Everything a backup run needs.
pub struct BackupJob {
    pub source_root: PathBuf,
    pub catalog_path: PathBuf,
    pub rules: IgnoreRules,
    pub backends: Vec<Box<dyn Backend>>,
    pub max_depth: Option<usize>,
    pub hash_chunk_size: usize,
}

impl BackupJob {
    pub fn new(
        source_root: impl Into<PathBuf>,
        catalog_path: impl Into<PathBuf>,
        backends: Vec<Box<dyn Backend>>,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            catalog_path: catalog_path.into(),
            rules: IgnoreRules::none(),
            backends,
            max_depth: None,
            hash_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn rules(mut self, rules: IgnoreRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn hash_chunk_size(mut self, chunk_size: usize) -> Self {
        self.hash_chunk_size = chunk_size;
        self
    }
}

/// Everything a restore run needs.
pub struct RestoreJob {
    pub catalog_path: PathBuf,
    pub source: Box<dyn Backend>,
    pub destination: PathBuf,
    pub overwrite: bool,
    pub overwrite_only_if_older: bool,
    pub purge: bool,
    /// Replace the local catalog with the snapshot held by `source` first
    pub catalog_from_backend: bool,
}

impl RestoreJob {
    pub fn new(
        catalog_path: impl Into<PathBuf>,
        source: Box<dyn Backend>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog_path: catalog_path.into(),
            source,
            destination: destination.into(),
            overwrite: false,
            overwrite_only_if_older: false,
            purge: false,
            catalog_from_backend: false,
        }
    }

    pub fn overwrite(mut self, overwrite: bool, only_if_older: bool) -> Self {
        self.overwrite = overwrite;
        self.overwrite_only_if_older = only_if_older;
        self
    }

    pub fn purge(mut self, purge: bool) -> Self {
        self.purge = purge;
        self
    }

    pub fn catalog_from_backend(mut self, enabled: bool) -> Self {
        self.catalog_from_backend = enabled;
        self
    }
}

/// Launches runs, one at a time.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    state: Arc<Mutex<RunState>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RunState::Idle)),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start_backup(&self, job: BackupJob) -> Result<RunHandle, RunError> {
        self.launch(RunKind::Backup, move |ctx| run_backup(job, ctx))
    }

    pub fn start_restore(&self, job: RestoreJob) -> Result<RunHandle, RunError> {
        self.launch(RunKind::Restore, move |ctx| run_restore(job, ctx))
    }

    fn launch<F>(&self, kind: RunKind, body: F) -> Result<RunHandle, RunError>
    where
        F: FnOnce(&mut RunContext) -> Result<(), RunError> + Send + 'static,
    {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == RunState::Running {
                return Err(RunError::AlreadyRunning);
            }
            *state = RunState::Running;
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let state = Arc::clone(&self.state);
        let worker_cancel = cancel.clone();

        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let span = info_span!("run", kind = kind.as_str());
                let _guard = span.enter();

                let mut ctx = RunContext::new(tx, worker_cancel);
                ctx.emit(RunEvent::State(RunState::Running));

                let result = body(&mut ctx);
                let summary = ctx.summarize(kind, result);

                *state.lock().unwrap_or_else(PoisonError::into_inner) = summary.state;
                ctx.emit(RunEvent::State(summary.state));
                ctx.emit(RunEvent::Finished(summary.clone()));
                summary
            });

        match spawned {
            Ok(worker) => Ok(RunHandle {
                kind,
                events: rx,
                cancel,
                worker,
            }),
            Err(e) => {
                *self.state.lock().unwrap_or_else(PoisonError::into_inner) = RunState::Idle;
                Err(RunError::Spawn(e))
            }
        }
    }
}

/// The consumer's side of a running job.
pub struct RunHandle {
    kind: RunKind,
    events: mpsc::Receiver<RunEvent>,
    cancel: CancellationToken,
    worker: JoinHandle<RunSummary>,
}

impl RunHandle {
    /// Ask the worker to stop at its next unit-of-work boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    /// Next event, blocking the calling thread. Not for use inside an async
    /// runtime.
    pub fn next_event(&mut self) -> Option<RunEvent> {
        self.events.blocking_recv()
    }

    /// Drain all remaining events and wait for the worker to exit.
    pub fn wait(mut self) -> (Vec<RunEvent>, RunSummary) {
        let mut events = Vec::new();
        while let Some(event) = self.events.blocking_recv() {
            events.push(event);
        }

        let summary = match self.worker.join() {
            Ok(summary) => summary,
            Err(_) => {
                error!(kind = self.kind.as_str(), "Run worker panicked");
                RunSummary {
                    kind: self.kind,
                    state: RunState::Error,
                    cancelled: false,
                    warning_occurred: false,
                    failure: Some(FatalFailure::Other {
                        message: "run worker panicked".to_string(),
                    }),
                    stats: RunStats::default(),
                }
            }
        };
        (events, summary)
    }
}

/// Worker-side bookkeeping shared by both run kinds.
struct RunContext {
    events: mpsc::Sender<RunEvent>,
    cancel: CancellationToken,
    cancel_observed: bool,
    warning_occurred: bool,
    stats: RunStats,
}

impl RunContext {
    fn new(events: mpsc::Sender<RunEvent>, cancel: CancellationToken) -> Self {
        Self {
            events,
            cancel,
            cancel_observed: false,
            warning_occurred: false,
            stats: RunStats::default(),
        }
    }

    fn emit(&self, event: RunEvent) {
        // A consumer that hung up just stops listening; the run goes on
        if self.events.blocking_send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn action(&self, item: BackupActionItem) {
        match item.kind {
            ActionKind::Skip => debug!("{}", item),
            ActionKind::Hash if item.percentage < 100 => {}
            _ => info!("{}", item),
        }
        self.emit(RunEvent::Action(item));
    }

    fn warn(&mut self, path: &str, message: impl ToString) {
        let message = message.to_string();
        warn!(path = %path, error = %message, "Item skipped");
        self.warning_occurred = true;
        self.stats.warnings += 1;
        self.emit(RunEvent::Warning {
            path: path.to_string(),
            message,
        });
    }

    fn warn_entry(&mut self, error: &EntryError) {
        self.warn(error.path(), error);
    }

    /// Poll the token at a unit-of-work boundary.
    fn cancelled(&mut self) -> bool {
        if !self.cancel_observed && self.cancel.is_cancelled() {
            info!("Cancellation observed");
            self.cancel_observed = true;
        }
        self.cancel_observed
    }

    fn state_for(&self, result: &Result<(), RunError>) -> RunState {
        match result {
            Err(_) => RunState::Error,
            Ok(()) if self.cancel_observed => RunState::Cancelled,
            Ok(()) => RunState::Completed,
        }
    }

    fn summarize(&mut self, kind: RunKind, result: Result<(), RunError>) -> RunSummary {
        let state = self.state_for(&result);
        let failure = result.as_ref().err().map(RunError::to_failure);
        match &result {
            Err(e) => error!(kind = kind.as_str(), error = %e, "Run failed"),
            Ok(()) => info!(
                kind = kind.as_str(),
                state = state.as_str(),
                warnings = self.stats.warnings,
                copied = self.stats.files_copied,
                skipped = self.stats.files_skipped,
                purged = self.stats.files_purged,
                "Run finished"
            ),
        }

        RunSummary {
            kind,
            state,
            cancelled: self.cancel_observed,
            warning_occurred: self.warning_occurred,
            failure,
            stats: self.stats.clone(),
        }
    }
}

fn run_backup(job: BackupJob, ctx: &mut RunContext) -> Result<(), RunError> {
    let BackupJob {
        source_root,
        catalog_path,
        mut rules,
        backends,
        max_depth,
        hash_chunk_size,
    } = job;

    // An unreachable source would look like an empty tree and purge everything
    if !source_root.is_dir() {
        return Err(RunError::SourceUnavailable(source_root));
    }

    let mut catalog = open_catalog(&catalog_path)?;
    for path in catalog_exclusions(&source_root, &catalog) {
        debug!(path = %path, "Excluding catalog file from backup");
        rules.ignore_file(&path);
    }

    setup_backends(&backends)?;

    let run_id = runs::start(&mut catalog, RunKind::Backup.as_str())?;
    info!(
        run_id = %run_id,
        source = %source_root.display(),
        backends = backends.len(),
        "Backup started"
    );

    let mut pass = BackupPass {
        ctx: &mut *ctx,
        tree: TreeTraverser::new(&source_root, rules),
        catalog: &mut catalog,
        backends: &backends,
        hash_chunk_size,
    };
    let result = pass.run(max_depth);

    finish_run(
        catalog,
        ctx,
        Finish {
            kind: RunKind::Backup,
            run_id: &run_id,
            source_root: Some(&source_root),
            snapshot_to: &backends,
        },
        result,
    )
}

fn run_restore(job: RestoreJob, ctx: &mut RunContext) -> Result<(), RunError> {
    let RestoreJob {
        catalog_path,
        source,
        destination,
        overwrite,
        overwrite_only_if_older,
        purge,
        catalog_from_backend,
    } = job;

    let mut catalog = Catalog::open(&catalog_path)?;
    source
        .setup_initial()
        .map_err(|e| RunError::BackendSetup {
            backend: source.name().to_string(),
            source: e,
        })?;

    if catalog_from_backend {
        import_snapshot(&mut catalog, source.as_ref())?;
    }
    catalog.load_to_memory()?;
    catalog.set_auto_sync_to_disk(false);

    fs::create_dir_all(&destination).map_err(|e| RunError::Destination {
        path: destination.clone(),
        source: e,
    })?;

    let protected = catalog_exclusions(&destination, &catalog);
    let mut rules = IgnoreRules::none();
    for path in &protected {
        rules.ignore_file(path);
    }

    let run_id = runs::start(&mut catalog, RunKind::Restore.as_str())?;
    info!(
        run_id = %run_id,
        source = %source.destination(),
        destination = %destination.display(),
        "Restore started"
    );

    let mut pass = RestorePass {
        ctx: &mut *ctx,
        tree: TreeTraverser::new(&destination, rules),
        source: source.as_ref(),
        overwrite,
        overwrite_only_if_older,
        protected,
    };
    let result = pass.run(&catalog, purge);

    finish_run(
        catalog,
        ctx,
        Finish {
            kind: RunKind::Restore,
            run_id: &run_id,
            source_root: None,
            snapshot_to: &[],
        },
        result,
    )
}

/// Open the catalog and switch it to batched, in-memory mode.
fn open_catalog(path: &Path) -> Result<Catalog, CatalogError> {
    let mut catalog = Catalog::open(path)?;
    catalog.load_to_memory()?;
    catalog.set_auto_sync_to_disk(false);
    Ok(catalog)
}

fn setup_backends(backends: &[Box<dyn Backend>]) -> Result<(), RunError> {
    for backend in backends {
        backend
            .setup_initial()
            .map_err(|e| RunError::BackendSetup {
                backend: backend.name().to_string(),
                source: e,
            })?;
        if backend.is_test_only() {
            info!(backend = backend.name(), "Backend is test-only, nothing will be stored on it");
        }
        debug!(backend = backend.name(), destination = %backend.destination(), "Backend ready");
    }
    Ok(())
}

fn import_snapshot(catalog: &mut Catalog, source: &dyn Backend) -> Result<(), RunError> {
    let mut name = catalog.path().file_name().unwrap_or_default().to_os_string();
    name.push(".fetched");
    let staging = catalog.path().with_file_name(name);

    source
        .fetch_file(CATALOG_OBJECT_KEY, &staging)
        .map_err(RunError::SnapshotFetch)?;
    let imported = catalog.import_from(&staging);

    if let Err(e) = fs::remove_file(&staging) {
        debug!(path = %staging.display(), error = %e, "Failed to remove fetched snapshot");
    }
    imported?;

    info!(backend = source.name(), "Catalog replaced with backend snapshot");
    Ok(())
}

/// Root-relative paths of the catalog and its lock file, when they live
/// inside `root`.
fn catalog_exclusions(root: &Path, catalog: &Catalog) -> Vec<String> {
    let Ok(root) = fs::canonicalize(root) else {
        return Vec::new();
    };

    [catalog.path(), catalog.lock_path()]
        .into_iter()
        .filter_map(|path| {
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let absolute = fs::canonicalize(parent).ok()?.join(path.file_name()?);
            let relative = absolute.strip_prefix(&root).ok()?;
            relative
                .to_str()
                .map(|s| ignore::normalize(&s.replace(std::path::MAIN_SEPARATOR, "/")))
        })
        .collect()
}

/// True if `path` equals `prefix` or lies beneath it.
fn is_within(path: &str, prefix: &str) -> bool {
    path == prefix
        || (path.starts_with(prefix) && path[prefix.len()..].starts_with(ignore::SEPARATOR))
}

struct Finish<'a> {
    kind: RunKind,
    run_id: &'a str,
    source_root: Option<&'a Path>,
    snapshot_to: &'a [Box<dyn Backend>],
}

/// Record the outcome, upload the catalog snapshot after a clean backup,
/// and persist the catalog.
fn finish_run(
    mut catalog: Catalog,
    ctx: &mut RunContext,
    finish: Finish<'_>,
    result: Result<(), RunError>,
) -> Result<(), RunError> {
    let state = ctx.state_for(&result);
    let description = result.as_ref().err().map(ToString::to_string);

    let recorded = record_outcome(&mut catalog, &finish, state, ctx.warning_occurred, description.as_deref());

    if state == RunState::Completed && recorded.is_ok() && !finish.snapshot_to.is_empty() {
        let warned_before = ctx.warning_occurred;
        upload_snapshot(&mut catalog, finish.snapshot_to, ctx)?;
        if ctx.warning_occurred && !warned_before {
            record_outcome(&mut catalog, &finish, state, true, None)?;
        }
    }

    let closed = catalog.close();
    match result {
        Err(e) => {
            if let Err(record_error) = recorded.and(closed) {
                error!(error = %record_error, "Failed to persist catalog after fatal error");
            }
            Err(e)
        }
        Ok(()) => {
            recorded?;
            closed?;
            Ok(())
        }
    }
}

fn record_outcome(
    catalog: &mut Catalog,
    finish: &Finish<'_>,
    state: RunState,
    warning: bool,
    description: Option<&str>,
) -> Result<(), CatalogError> {
    let (at_key, status_key, warning_key) = match finish.kind {
        RunKind::Backup => (
            settings::LAST_BACKUP_AT,
            settings::LAST_BACKUP_STATUS,
            settings::LAST_BACKUP_WARNING,
        ),
        RunKind::Restore => (
            settings::LAST_RESTORE_AT,
            settings::LAST_RESTORE_STATUS,
            settings::LAST_RESTORE_WARNING,
        ),
    };

    settings::set(catalog, at_key, &Utc::now().to_rfc3339())?;
    settings::set(catalog, status_key, state.as_str())?;
    settings::set(catalog, warning_key, if warning { "true" } else { "false" })?;
    if let Some(root) = finish.source_root {
        settings::set(catalog, settings::SOURCE_ROOT, &root.display().to_string())?;
    }
    runs::finish(catalog, finish.run_id, state.as_str(), warning, description)
}

/// Flush the catalog and store a copy of it on every backend.
fn upload_snapshot(
    catalog: &mut Catalog,
    backends: &[Box<dyn Backend>],
    ctx: &mut RunContext,
) -> Result<(), RunError> {
    catalog.sync_to_disk()?;

    let attributes = match fs::metadata(catalog.path()) {
        Ok(metadata) => EntryAttributes::from_metadata(&metadata),
        Err(e) => {
            ctx.warn(CATALOG_OBJECT_KEY, format!("cannot read catalog: {}", e));
            return Ok(());
        }
    };

    for backend in backends {
        match backend.write_file(CATALOG_OBJECT_KEY, catalog.path(), &attributes) {
            Ok(bytes) => info!(backend = backend.name(), bytes, "Catalog snapshot stored"),
            Err(e) => ctx.warn(CATALOG_OBJECT_KEY, e),
        }
    }
    Ok(())
}

struct BackupPass<'a> {
    ctx: &'a mut RunContext,
    tree: TreeTraverser,
    catalog: &'a mut Catalog,
    backends: &'a [Box<dyn Backend>],
    hash_chunk_size: usize,
}

impl BackupPass<'_> {
    fn run(&mut self, max_depth: Option<usize>) -> Result<(), RunError> {
        for folder in self.tree.list_folders(max_depth) {
            if self.ctx.cancelled() {
                return Ok(());
            }
            if !folder.is_root() {
                records::upsert_folder(self.catalog, folder.relative_path())?;
            }

            for file in self.tree.get_files(&folder) {
                if self.ctx.cancelled() {
                    return Ok(());
                }
                self.backup_file(&file)?;
            }
        }

        if self.ctx.cancelled() {
            return Ok(());
        }
        self.purge()
    }

    /// Only catalog failures propagate; everything else is a warning.
    fn backup_file(&mut self, file: &FileEntry) -> Result<(), RunError> {
        let path = file.relative_path();
        self.ctx.stats.files_scanned += 1;

        let attributes = match file.attributes() {
            Ok(attributes) => attributes,
            Err(e) => {
                self.ctx.warn_entry(&e);
                return Ok(());
            }
        };

        let record = records::get(self.catalog, path)?;
        let hash = match &record {
            Some(record)
                if record.size == attributes.size
                    && record.mtime_ns == attributes.modified_ns() =>
            {
                record.hash
            }
            _ => {
                let hash = match self.hash(file) {
                    Ok(Some(hash)) => hash,
                    Ok(None) => {
                        // Abandoned mid-hash, nothing was dispatched
                        self.ctx.cancelled();
                        return Ok(());
                    }
                    Err(e) => {
                        self.ctx.warn_entry(&e);
                        return Ok(());
                    }
                };
                if record.as_ref().is_some_and(|r| r.hash == hash) {
                    debug!(path = %path, "Content unchanged despite new timestamp");
                }
                records::upsert(
                    self.catalog,
                    &CatalogRecord {
                        path: path.to_string(),
                        hash,
                        size: attributes.size,
                        mtime_ns: attributes.modified_ns(),
                    },
                )?;
                hash
            }
        };

        // Backends missing this version, including ones that failed last run
        let held = holdings::for_path(self.catalog, path)?;
        let pending: Vec<&dyn Backend> = self
            .backends
            .iter()
            .map(|b| b.as_ref())
            .filter(|b| !b.is_test_only() && held.get(b.name()) != Some(&hash))
            .collect();
        if pending.is_empty() {
            self.skip(path);
            return Ok(());
        }

        let mut stored_any = false;
        for backend in pending {
            if self.ctx.cancelled() {
                return Ok(());
            }

            let item = BackupActionItem::new(ActionKind::Copy, path).on_backend(backend.name());
            self.ctx.action(item.clone().at(0));
            match backend.write_file(path, &file.absolute_path(), &attributes) {
                Ok(bytes) => {
                    holdings::record(self.catalog, path, backend.name(), &hash)?;
                    self.ctx.stats.bytes_copied += bytes;
                    stored_any = true;
                    self.ctx.action(item);
                }
                Err(e) => self.ctx.warn(path, e),
            }
        }

        if stored_any {
            self.ctx.stats.files_copied += 1;
        }
        Ok(())
    }

    fn skip(&mut self, path: &str) {
        self.ctx.stats.files_skipped += 1;
        self.ctx.action(BackupActionItem::new(ActionKind::Skip, path));
    }

    /// Hash with progress events, polling for cancellation between chunks.
    fn hash(&self, file: &FileEntry) -> Result<Option<ContentHash>, EntryError> {
        let ctx = &*self.ctx;
        let path = file.relative_path();
        let mut throttle = LogThrottle::new(Duration::from_secs(2));
        let mut reported: Option<u8> = None;

        file.content_hash(self.hash_chunk_size, |done, total| {
            if ctx.cancel.is_cancelled() {
                return ControlFlow::Break(());
            }

            let pct = percent(done, total);
            if reported != Some(pct) {
                reported = Some(pct);
                ctx.action(BackupActionItem::new(ActionKind::Hash, path).at(pct));
            }
            if pct < 100 && throttle.should_log() {
                debug!(path = %path, done, total, "Hashing");
            }
            ControlFlow::Continue(())
        })
    }

    /// Remove every cataloged or backend-held file and every cataloged
    /// folder that no longer exists in the source from the backends and the
    /// catalog.
    fn purge(&mut self) -> Result<(), RunError> {
        let mut paths: BTreeSet<String> = records::list(self.catalog)?
            .into_iter()
            .map(|record| record.path)
            .collect();
        paths.extend(holdings::paths(self.catalog)?);

        for path in paths {
            if self.ctx.cancelled() {
                return Ok(());
            }
            if self.tree.file_exists(&path) {
                continue;
            }
            self.purge_file(&path)?;
        }

        let mut purged: Vec<String> = Vec::new();
        for folder in records::list_folders(self.catalog)? {
            if self.ctx.cancelled() {
                return Ok(());
            }
            if purged.iter().any(|prefix| is_within(&folder, prefix)) {
                continue;
            }
            if self.tree.folder_exists(&folder) {
                continue;
            }

            if self.delete_everywhere(&folder, |backend, path| backend.delete_purge(path)) {
                records::delete_folder(self.catalog, &folder)?;
                self.ctx.stats.folders_purged += 1;
                self.ctx
                    .action(BackupActionItem::new(ActionKind::Purge, folder.as_str()));
            }
            purged.push(folder);
        }
        Ok(())
    }

    /// Delete one vanished file everywhere. The source record goes at once;
    /// a holding survives only on a backend whose delete failed or that is
    /// not part of this run, so the path comes back next run.
    fn purge_file(&mut self, path: &str) -> Result<(), RunError> {
        records::delete(self.catalog, path)?;
        let mut remaining = holdings::for_path(self.catalog, path)?;

        let mut all_deleted = true;
        for backend in self.backends.iter().filter(|b| !b.is_test_only()) {
            match backend.delete_file(path) {
                Ok(()) => {
                    if remaining.remove(backend.name()).is_some() {
                        holdings::remove(self.catalog, path, backend.name())?;
                    }
                }
                Err(e) => {
                    all_deleted = false;
                    self.ctx.warn(path, e);
                }
            }
        }

        if !remaining.is_empty() {
            let names: Vec<&str> = remaining.keys().map(String::as_str).collect();
            debug!(path = %path, backends = ?names, "Copies left for a later purge");
        }
        if all_deleted {
            self.ctx.stats.files_purged += 1;
            self.ctx.action(BackupActionItem::new(ActionKind::Purge, path));
        }
        Ok(())
    }

    /// Apply `delete` on every backend that holds content. False if any of
    /// them failed.
    fn delete_everywhere<F>(&mut self, path: &str, delete: F) -> bool
    where
        F: Fn(&dyn Backend, &str) -> Result<(), BackendError>,
    {
        let mut all_deleted = true;
        for backend in self.backends.iter().filter(|b| !b.is_test_only()) {
            if let Err(e) = delete(backend.as_ref(), path) {
                all_deleted = false;
                self.ctx.warn(path, e);
            }
        }
        all_deleted
    }
}

struct RestorePass<'a> {
    ctx: &'a mut RunContext,
    tree: TreeTraverser,
    source: &'a dyn Backend,
    overwrite: bool,
    overwrite_only_if_older: bool,
    /// Destination-relative catalog and lock paths
    protected: Vec<String>,
}

impl RestorePass<'_> {
    fn run(&mut self, catalog: &Catalog, purge: bool) -> Result<(), RunError> {
        let folders = records::list_folders(catalog)?;
        for folder in &folders {
            if self.ctx.cancelled() {
                return Ok(());
            }
            self.restore_folder(folder);
        }

        let records = records::list(catalog)?;
        let held = holdings::for_backend(catalog, self.source.name())?;
        for record in &records {
            if self.ctx.cancelled() {
                return Ok(());
            }
            self.restore_file(record, held.get(&record.path));
        }

        if purge && !self.ctx.cancelled() {
            self.purge(&records, folders);
        }
        Ok(())
    }

    /// Recreate a cataloged folder, which may be empty.
    fn restore_folder(&mut self, folder: &str) {
        let target = self.tree.root_path().join(folder);
        if let Err(e) = fs::create_dir_all(&target) {
            self.ctx.warn(folder, format!("cannot create folder: {}", e));
        }
    }

    /// `held` is the version the source backend stores for this path, if any.
    fn restore_file(&mut self, record: &CatalogRecord, held: Option<&ContentHash>) {
        let path = record.path.as_str();
        self.ctx.stats.files_scanned += 1;

        let wanted = match self.tree.file(path).attributes() {
            Ok(existing) => {
                self.overwrite
                    && (!self.overwrite_only_if_older
                        || existing.modified_ns() < record.mtime_ns)
            }
            Err(EntryError::Metadata { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                true
            }
            Err(e) => {
                self.ctx.warn_entry(&e);
                return;
            }
        };

        if !wanted {
            self.ctx.stats.files_skipped += 1;
            self.ctx.action(BackupActionItem::new(ActionKind::Skip, path));
            return;
        }

        if held != Some(&record.hash) {
            let message = format!("{} holds no copy of the cataloged version", self.source.name());
            self.ctx.warn(path, message);
            return;
        }

        let target = self.tree.root_path().join(path);
        let item = BackupActionItem::new(ActionKind::Copy, path).on_backend(self.source.name());
        self.ctx.action(item.clone().at(0));

        match self.source.fetch_file(path, &target) {
            Ok(bytes) => {
                if let Err(e) = filetime::set_file_mtime(&target, record.modified()) {
                    self.ctx
                        .warn(path, format!("restored but cannot set modification time: {}", e));
                }
                self.ctx.stats.bytes_copied += bytes;
                self.ctx.stats.files_copied += 1;
                self.ctx.action(item);
            }
            Err(e) => self.ctx.warn(path, e),
        }
    }

    /// Delete destination files and folders the catalog does not know.
    fn purge(&mut self, records: &[CatalogRecord], folders: Vec<String>) {
        let cataloged: HashSet<&str> = records.iter().map(|r| r.path.as_str()).collect();

        let mut keep: HashSet<String> = folders.into_iter().collect();
        let kept_files = records.iter().map(|r| r.path.as_str());
        for path in kept_files.chain(self.protected.iter().map(String::as_str)) {
            if let Some((parent, _)) = path.rsplit_once(ignore::SEPARATOR) {
                keep.extend(ignore::ancestors(parent).map(str::to_string));
            }
        }

        let mut purged: Vec<String> = Vec::new();
        for folder in self.tree.list_folders(None) {
            if self.ctx.cancelled() {
                return;
            }
            let relative = folder.relative_path();
            if purged.iter().any(|prefix| is_within(relative, prefix)) {
                continue;
            }

            if !folder.is_root() && !keep.contains(relative) {
                match self.tree.delete_folder(relative) {
                    Ok(()) => {
                        self.ctx.stats.folders_purged += 1;
                        self.ctx.action(BackupActionItem::new(ActionKind::Purge, relative));
                    }
                    Err(e) => self.ctx.warn_entry(&e),
                }
                purged.push(relative.to_string());
                continue;
            }

            for file in self.tree.get_files(&folder) {
                if cataloged.contains(file.relative_path()) {
                    continue;
                }
                if self.ctx.cancelled() {
                    return;
                }
                match self.tree.delete_file(file.relative_path()) {
                    Ok(()) => {
                        self.ctx.stats.files_purged += 1;
                        self.ctx
                            .action(BackupActionItem::new(ActionKind::Purge, file.relative_path()));
                    }
                    Err(e) => self.ctx.warn_entry(&e),
                }
            }
        }
    }
}
