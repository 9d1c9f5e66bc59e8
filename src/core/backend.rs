pub mod mirror;
pub mod object_store;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::config::AppConfig;
use crate::core::entry::EntryAttributes;
use crate::core::error::ErrorTier;

pub use mirror::MirrorBackend;
pub use object_store::ObjectStoreBackend;

/// Reserved key under which each backend receives a snapshot of the catalog.
pub const CATALOG_OBJECT_KEY: &str = ".backsweep/catalog.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Mirror,
    ObjectStore,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mirror => "mirror",
            Self::ObjectStore => "object-store",
        }
    }
}

/// Where in a run a backend call happened. Setup failures abort the run,
/// everything else is a per-item warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPhase {
    Setup,
    Transfer,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{backend}: I/O error on '{path}': {source}")]
    Io {
        backend: String,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{backend}: request for '{key}' failed: {source}")]
    Request {
        backend: String,
        key: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{backend}: server returned HTTP {status} for '{key}'")]
    Status {
        backend: String,
        key: String,
        status: u16,
    },

    #[error("{backend}: credentials rejected (HTTP {status})")]
    Auth { backend: String, status: u16 },

    #[error("{backend}: {message}")]
    Config { backend: String, message: String },
}

impl BackendError {
    pub fn tier(&self, phase: BackendPhase) -> ErrorTier {
        match phase {
            BackendPhase::Setup => ErrorTier::Fatal,
            BackendPhase::Transfer => ErrorTier::Warning,
        }
    }
}

/// A replication target.
///
/// Implementations report every failure as a [`BackendError`]; none of them
/// may panic on I/O, network or auth problems. Writes must be all-or-nothing
/// as seen from the destination.
pub trait Backend: Send {
    fn name(&self) -> &str;

    /// Human-readable destination (folder path, bucket URL).
    fn destination(&self) -> String;

    /// A test-only backend accepts writes and deletes without performing
    /// them, so it never holds content.
    fn is_test_only(&self) -> bool {
        false
    }

    /// Prepare the destination. Idempotent; run once before any transfer.
    fn setup_initial(&self) -> Result<(), BackendError>;

    /// Store `source` under `relative_path`, returning the bytes written.
    fn write_file(
        &self,
        relative_path: &str,
        source: &Path,
        attributes: &EntryAttributes,
    ) -> Result<u64, BackendError>;

    /// Remove one stored file. Removing a missing file succeeds.
    fn delete_file(&self, relative_path: &str) -> Result<(), BackendError>;

    /// Remove a stored folder and everything under it.
    fn delete_purge(&self, prefix: &str) -> Result<(), BackendError>;

    /// Copy a stored file back out to `target`, returning the bytes written.
    fn fetch_file(&self, relative_path: &str, target: &Path) -> Result<u64, BackendError>;
}

/// Build one backend of the given kind from configuration.
pub fn create_backend(kind: BackendKind, config: &AppConfig) -> Result<Box<dyn Backend>, BackendError> {
    match kind {
        BackendKind::Mirror => Ok(Box::new(
            MirrorBackend::new(&config.mirror.destination).sync_files(config.mirror.sync_files),
        )),
        BackendKind::ObjectStore => Ok(Box::new(ObjectStoreBackend::new(&config.object_store)?)),
    }
}

/// Build every backend enabled in configuration, in a stable order.
pub fn create_backends(config: &AppConfig) -> Result<Vec<Box<dyn Backend>>, BackendError> {
    let mut backends = Vec::new();
    if config.mirror.enabled {
        backends.push(create_backend(BackendKind::Mirror, config)?);
    }
    if config.object_store.enabled {
        backends.push(create_backend(BackendKind::ObjectStore, config)?);
    }
    Ok(backends)
}
