pub mod backend;
pub mod entry;
pub mod error;
pub mod ignore;
pub mod orchestrator;
pub mod progress;
pub mod tree;
pub mod verifier;

pub use backend::{Backend, BackendError, BackendKind, create_backends};
pub use entry::{ContentHash, EntryAttributes, FileEntry, FolderEntry};
pub use error::{EntryError, ErrorTier};
pub use ignore::IgnoreRules;
pub use orchestrator::{
    BackupJob, Orchestrator, RestoreJob, RunError, RunHandle, RunState, RunSummary,
};
pub use progress::{ActionKind, BackupActionItem, RunEvent};
pub use tree::TreeTraverser;
pub use verifier::{VerifyResult, verify_mirror};
