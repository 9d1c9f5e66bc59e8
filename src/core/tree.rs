//! Ignore-aware, iterative traversal of a directory tree.
//!
//! Folders are produced in pre-order, children in the order the filesystem
//! reports them. The walk uses an explicit stack so depth is bounded only by
//! memory. Failures while listing a folder (vanished, unreadable, I/O error)
//! are swallowed and the folder is treated as empty; deletions are not, and
//! report an [`EntryError`] carrying the offending path.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::entry::{FileEntry, FolderEntry};
use crate::core::error::{EntryError, is_transient_io_error};
use crate::core::ignore::{self, IgnoreRules};

/// Shared state every entry points back to.
#[derive(Debug)]
pub struct TreeRoot {
    path: PathBuf,
    rules: IgnoreRules,
}

impl TreeRoot {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rules(&self) -> &IgnoreRules {
        &self.rules
    }

    pub fn resolve(&self, relative_path: &str) -> PathBuf {
        if relative_path.is_empty() {
            self.path.clone()
        } else {
            self.path.join(relative_path)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildKind {
    File,
    Folder,
}

#[derive(Debug, Clone)]
pub struct TreeTraverser {
    root: Arc<TreeRoot>,
}

impl TreeTraverser {
    pub fn new(root: impl Into<PathBuf>, rules: IgnoreRules) -> Self {
        Self {
            root: Arc::new(TreeRoot {
                path: root.into(),
                rules,
            }),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root.path
    }

    pub fn rules(&self) -> &IgnoreRules {
        &self.root.rules
    }

    /// The root folder entry (level 0, empty relative path).
    pub fn root(&self) -> FolderEntry {
        FolderEntry::new(Arc::clone(&self.root), String::new(), 0)
    }

    /// A fresh, uncached entry for a file path. Does not check existence.
    pub fn file(&self, relative_path: &str) -> FileEntry {
        FileEntry::new(Arc::clone(&self.root), ignore::normalize(relative_path))
    }

    /// Walk all non-ignored folders in pre-order, root first.
    ///
    /// With `max_depth = Some(n)`, folders at level `n` are yielded but not
    /// descended into. Each call starts a new walk.
    pub fn list_folders(&self, max_depth: Option<usize>) -> FolderWalk {
        FolderWalk {
            root: Arc::clone(&self.root),
            stack: vec![self.root()],
            max_depth,
        }
    }

    /// Immediate, non-ignored files of `folder`.
    pub fn get_files(&self, folder: &FolderEntry) -> Vec<FileEntry> {
        list_children(&self.root, folder, ChildKind::File)
            .into_iter()
            .map(|relative| FileEntry::new(Arc::clone(&self.root), relative))
            .collect()
    }

    /// Immediate, non-ignored child folders of `folder`. Callers recurse.
    pub fn get_folders(&self, folder: &FolderEntry) -> Vec<FolderEntry> {
        child_folders(&self.root, folder)
    }

    /// True if the file exists and is not excluded by the ignore rules.
    pub fn file_exists(&self, relative_path: &str) -> bool {
        let relative_path = ignore::normalize(relative_path);
        if self.is_excluded(&relative_path) || self.rules().is_file_ignored(&relative_path) {
            return false;
        }
        fs::symlink_metadata(self.root.resolve(&relative_path)).is_ok_and(|m| m.is_file())
    }

    /// True if the folder exists and is not excluded by the ignore rules.
    pub fn folder_exists(&self, relative_path: &str) -> bool {
        let relative_path = ignore::normalize(relative_path);
        if self.is_excluded(&relative_path) {
            return false;
        }
        fs::symlink_metadata(self.root.resolve(&relative_path)).is_ok_and(|m| m.is_dir())
    }

    pub fn delete_file(&self, relative_path: &str) -> Result<(), EntryError> {
        let relative_path = ignore::normalize(relative_path);
        fs::remove_file(self.root.resolve(&relative_path)).map_err(|e| delete_error(relative_path, e))
    }

    /// Remove a folder and everything beneath it.
    pub fn delete_folder(&self, relative_path: &str) -> Result<(), EntryError> {
        let relative_path = ignore::normalize(relative_path);
        if relative_path.is_empty() {
            return Err(EntryError::Delete {
                path: relative_path,
                message: "refusing to delete the traversal root".to_string(),
            });
        }
        fs::remove_dir_all(self.root.resolve(&relative_path))
            .map_err(|e| delete_error(relative_path, e))
    }

    fn is_excluded(&self, relative_path: &str) -> bool {
        !relative_path.is_empty() && self.rules().is_under_ignored_folder(relative_path)
    }
}

fn delete_error(path: String, error: io::Error) -> EntryError {
    let message = match error.kind() {
        io::ErrorKind::NotFound => format!("not found: {}", error),
        io::ErrorKind::PermissionDenied => format!("access denied: {}", error),
        _ => error.to_string(),
    };
    EntryError::Delete { path, message }
}

/// Lazy pre-order folder sequence returned by [`TreeTraverser::list_folders`].
pub struct FolderWalk {
    root: Arc<TreeRoot>,
    stack: Vec<FolderEntry>,
    max_depth: Option<usize>,
}

impl Iterator for FolderWalk {
    type Item = FolderEntry;

    fn next(&mut self) -> Option<FolderEntry> {
        let folder = self.stack.pop()?;

        let descend = self.max_depth.is_none_or(|max| folder.level() < max);
        if descend {
            // Reversed so popping returns children in enumeration order
            let children = child_folders(&self.root, &folder);
            self.stack.extend(children.into_iter().rev());
        }

        Some(folder)
    }
}

fn child_folders(root: &Arc<TreeRoot>, folder: &FolderEntry) -> Vec<FolderEntry> {
    let level = folder.level() + 1;
    list_children(root, folder, ChildKind::Folder)
        .into_iter()
        .map(|relative| FolderEntry::new(Arc::clone(root), relative, level))
        .collect()
}

/// Relative paths of the immediate children of one kind, filtered by the
/// ignore rules. Listing failures yield an empty list.
fn list_children(root: &TreeRoot, folder: &FolderEntry, kind: ChildKind) -> Vec<String> {
    let absolute = root.resolve(folder.relative_path());

    let entries = match fs::read_dir(&absolute) {
        Ok(entries) => entries,
        Err(e) => {
            log_enumeration_failure(folder.relative_path(), &e);
            return Vec::new();
        }
    };

    let mut children = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log_enumeration_failure(folder.relative_path(), &e);
                continue;
            }
        };

        // Symlinks are neither followed nor yielded
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                log_enumeration_failure(folder.relative_path(), &e);
                continue;
            }
        };
        let wanted = match kind {
            ChildKind::File => file_type.is_file(),
            ChildKind::Folder => file_type.is_dir(),
        };
        if !wanted {
            continue;
        }

        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            warn!(
                folder = %folder.relative_path(),
                name = ?file_name,
                "Skipping entry with non UTF-8 name"
            );
            continue;
        };

        let relative = ignore::join(folder.relative_path(), name);
        let ignored = match kind {
            ChildKind::File => root.rules.is_file_ignored(&relative),
            ChildKind::Folder => root.rules.is_folder_ignored(&relative),
        };
        if ignored {
            debug!(path = %relative, "Ignored");
            continue;
        }

        children.push(relative);
    }

    children
}

fn log_enumeration_failure(folder: &str, error: &io::Error) {
    if is_transient_io_error(error) {
        debug!(folder = %folder, error = %error, "Treating unreadable folder as empty");
    } else {
        warn!(folder = %folder, error = %error, "Unexpected error listing folder, treating as empty");
    }
}
