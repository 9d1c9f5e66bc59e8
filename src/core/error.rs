use std::io::{self, ErrorKind};
use thiserror::Error;

/// How the orchestrator reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTier {
    /// Swallowed during traversal; the affected subtree is treated as empty.
    Tolerated,
    /// Recorded as a warning; the item is skipped and the run continues.
    Warning,
    /// Aborts the whole run with status `Error`.
    Fatal,
}

/// Failure reading, hashing or deleting a single tree entry.
#[derive(Debug, Error)]
pub enum EntryError {
    #[error("cannot read metadata of '{path}': {source}")]
    Metadata {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot hash '{path}': {source}")]
    Hash {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot delete '{path}': {message}")]
    Delete { path: String, message: String },
}

impl EntryError {
    pub fn path(&self) -> &str {
        match self {
            Self::Metadata { path, .. } | Self::Hash { path, .. } | Self::Delete { path, .. } => {
                path
            }
        }
    }

    pub fn tier(&self) -> ErrorTier {
        ErrorTier::Warning
    }
}

/// Enumeration failures the traversal swallows: the entry vanished, is
/// unreadable, or sits on a device that returned an I/O error.
pub fn is_transient_io_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => true,
        _ => matches!(
            error.raw_os_error(),
            Some(libc::EIO | libc::ENODEV | libc::ENXIO | libc::ENOTDIR | libc::ESTALE)
        ),
    }
}
