use filetime::FileTime;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::backend::{Backend, BackendError};
use crate::core::entry::EntryAttributes;

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

const PROBE_FILE: &str = ".backsweep-probe";

/// Local or network folder holding a plain copy of the source tree.
///
/// Files are written to a hidden sibling first and renamed into place, so a
/// reader of the mirror never sees a partially written file. Modification
/// times and permissions are carried over from the source.
pub struct MirrorBackend {
    name: String,
    root: PathBuf,
    /// Whether to fsync each file before it is renamed into place
    sync_files: bool,
}

impl MirrorBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            name: "mirror".to_string(),
            root: root.into(),
            sync_files: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn sync_files(mut self, sync_files: bool) -> Self {
        self.sync_files = sync_files;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn io_error(&self, path: &str, source: io::Error) -> BackendError {
        BackendError::Io {
            backend: self.name.clone(),
            path: path.to_string(),
            source,
        }
    }
}

impl Backend for MirrorBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn destination(&self) -> String {
        self.root.display().to_string()
    }

    fn setup_initial(&self) -> Result<(), BackendError> {
        fs::create_dir_all(&self.root).map_err(|e| self.io_error("", e))?;

        let probe = self.root.join(PROBE_FILE);
        fs::write(&probe, b"probe").map_err(|e| self.io_error(PROBE_FILE, e))?;
        fs::remove_file(&probe).map_err(|e| self.io_error(PROBE_FILE, e))?;

        debug!(destination = %self.root.display(), "Mirror destination ready");
        Ok(())
    }

    fn write_file(
        &self,
        relative_path: &str,
        source: &Path,
        attributes: &EntryAttributes,
    ) -> Result<u64, BackendError> {
        let dest = self.root.join(relative_path);

        // The timestamp is part of the copy: a failure to set it is a failed write
        let bytes = copy_atomically(source, &dest, self.sync_files, Some(attributes.modified))
            .map_err(|e| self.io_error(relative_path, e))?;

        match fs::metadata(source) {
            Ok(metadata) => {
                if let Err(e) = fs::set_permissions(&dest, metadata.permissions()) {
                    debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
                }
            }
            Err(e) => debug!(source = %source.display(), error = %e, "Failed to read source permissions"),
        }

        Ok(bytes)
    }

    fn delete_file(&self, relative_path: &str) -> Result<(), BackendError> {
        match fs::remove_file(self.root.join(relative_path)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(self.io_error(relative_path, e)),
            _ => Ok(()),
        }
    }

    fn delete_purge(&self, prefix: &str) -> Result<(), BackendError> {
        if prefix.is_empty() {
            return Err(BackendError::Config {
                backend: self.name.clone(),
                message: "refusing to purge the mirror root".to_string(),
            });
        }

        let path = self.root.join(prefix);
        let result = match fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) => Err(e),
        };

        match result {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(self.io_error(prefix, e)),
            _ => Ok(()),
        }
    }

    fn fetch_file(&self, relative_path: &str, target: &Path) -> Result<u64, BackendError> {
        copy_atomically(&self.root.join(relative_path), target, self.sync_files, None)
            .map_err(|e| self.io_error(relative_path, e))
    }
}

/// Copy `source` to `dest` via a temporary sibling that is renamed into place.
pub(crate) fn copy_atomically(
    source: &Path,
    dest: &Path,
    sync_file: bool,
    modified: Option<FileTime>,
) -> io::Result<u64> {
    let source_file = File::open(source)?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);
    write_atomically(dest, sync_file, modified, |writer| io::copy(&mut reader, writer))
}

/// Create `dest` with content produced by `fill`, all-or-nothing.
///
/// Parent folders are created as needed. `modified` is applied to the
/// temporary file before it is renamed. On any failure the temporary file
/// is removed and `dest` is left as it was.
pub(crate) fn write_atomically<F>(
    dest: &Path,
    sync_file: bool,
    modified: Option<FileTime>,
    fill: F,
) -> io::Result<u64>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<u64>,
{
    let parent = dest
        .parent()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "destination has no parent"))?;
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "destination has no file name"))?;
    fs::create_dir_all(parent)?;

    let partial = parent.join(format!(".{}.partial", file_name.to_string_lossy()));

    let result = (|| -> io::Result<u64> {
        let file = File::create(&partial)?;
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
        let bytes = fill(&mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;

        if let Some(modified) = modified {
            filetime::set_file_handle_times(&file, None, Some(modified))?;
        }
        if sync_file {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&partial, dest)?;
        Ok(bytes)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}
