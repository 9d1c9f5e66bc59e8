//! Lazy, memoized metadata for tree entries.
//!
//! Attributes and content hashes are fetched from the filesystem on first
//! access and cached for the lifetime of the entry. They are never refreshed:
//! obtain a fresh entry from the traverser to observe later changes.
//! Failed fetches are not cached and surface as [`EntryError`].

use filetime::FileTime;
use std::fmt;
use std::fs::{self, File, Metadata};
use std::io::{self, BufReader, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use crate::core::error::EntryError;
use crate::core::tree::TreeRoot;

/// Default read size for streaming hashes (128KB)
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Snapshot of the filesystem attributes of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryAttributes {
    pub size: u64,
    pub modified: FileTime,
    pub readonly: bool,
}

impl EntryAttributes {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            size: metadata.len(),
            modified: FileTime::from_last_modification_time(metadata),
            readonly: metadata.permissions().readonly(),
        }
    }

    pub fn modified_ns(&self) -> i64 {
        to_unix_nanos(self.modified)
    }
}

pub fn to_unix_nanos(time: FileTime) -> i64 {
    time.unix_seconds()
        .saturating_mul(1_000_000_000)
        .saturating_add(i64::from(time.nanoseconds()))
}

pub fn from_unix_nanos(nanos: i64) -> FileTime {
    FileTime::from_unix_time(
        nanos.div_euclid(1_000_000_000),
        nanos.rem_euclid(1_000_000_000) as u32,
    )
}

/// BLAKE3 digest of a file's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; blake3::OUT_LEN]);

impl ContentHash {
    pub fn as_bytes(&self) -> &[u8; blake3::OUT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = blake3::HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        blake3::Hash::from_hex(s).map(Self::from)
    }
}

/// Stream `reader` through BLAKE3 in `chunk_size` reads.
///
/// `on_chunk(processed, total)` runs after every chunk; returning
/// `ControlFlow::Break` stops hashing and yields `Ok(None)`.
pub fn hash_reader<R, F>(
    reader: R,
    total: u64,
    chunk_size: usize,
    mut on_chunk: F,
) -> io::Result<Option<ContentHash>>
where
    R: Read,
    F: FnMut(u64, u64) -> ControlFlow<()>,
{
    let chunk_size = chunk_size.max(1);
    let mut reader = BufReader::with_capacity(chunk_size, reader);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; chunk_size];
    let mut processed: u64 = 0;

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            // Empty input still reports progress once
            Ok(0) if processed == 0 => {
                if on_chunk(0, 0).is_break() {
                    return Ok(None);
                }
                break;
            }
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
        processed += bytes_read as u64;

        if on_chunk(processed, total.max(processed)).is_break() {
            return Ok(None);
        }
    }

    Ok(Some(hasher.finalize().into()))
}

/// Hash a file in one go, without progress reporting.
pub fn hash_file(path: &Path) -> io::Result<ContentHash> {
    let file = File::open(path)?;
    let total = file.metadata()?.len();
    let hash = hash_reader(file, total, DEFAULT_CHUNK_SIZE, |_, _| ControlFlow::Continue(()))?;
    // Continue never breaks, so a digest is always produced
    hash.ok_or_else(|| io::Error::other("hashing interrupted"))
}

/// A folder yielded by the traversal.
#[derive(Debug, Clone)]
pub struct FolderEntry {
    root: Arc<TreeRoot>,
    relative_path: String,
    level: usize,
    attributes: OnceLock<EntryAttributes>,
}

impl FolderEntry {
    pub(crate) fn new(root: Arc<TreeRoot>, relative_path: String, level: usize) -> Self {
        Self {
            root,
            relative_path,
            level,
            attributes: OnceLock::new(),
        }
    }

    /// Root-relative path; empty for the root folder itself.
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Depth below the root (root is level 0).
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn is_root(&self) -> bool {
        self.relative_path.is_empty()
    }

    pub fn absolute_path(&self) -> PathBuf {
        self.root.resolve(&self.relative_path)
    }

    pub fn attributes(&self) -> Result<EntryAttributes, EntryError> {
        fetch_attributes(&self.attributes, &self.absolute_path(), &self.relative_path)
    }
}

/// A file yielded by the traversal.
#[derive(Debug, Clone)]
pub struct FileEntry {
    root: Arc<TreeRoot>,
    relative_path: String,
    attributes: OnceLock<EntryAttributes>,
    hash: OnceLock<ContentHash>,
}

impl FileEntry {
    pub(crate) fn new(root: Arc<TreeRoot>, relative_path: String) -> Self {
        Self {
            root,
            relative_path,
            attributes: OnceLock::new(),
            hash: OnceLock::new(),
        }
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn absolute_path(&self) -> PathBuf {
        self.root.resolve(&self.relative_path)
    }

    pub fn attributes(&self) -> Result<EntryAttributes, EntryError> {
        fetch_attributes(&self.attributes, &self.absolute_path(), &self.relative_path)
    }

    pub fn modified(&self) -> Result<FileTime, EntryError> {
        self.attributes().map(|a| a.modified)
    }

    pub fn size(&self) -> Result<u64, EntryError> {
        self.attributes().map(|a| a.size)
    }

    /// The memoized hash, if one has already been computed.
    pub fn cached_hash(&self) -> Option<ContentHash> {
        self.hash.get().copied()
    }

    /// Compute (or return the memoized) content hash.
    ///
    /// `on_chunk(processed, total)` runs after every chunk read; breaking
    /// out of it abandons the hash and returns `Ok(None)` without caching.
    pub fn content_hash<F>(
        &self,
        chunk_size: usize,
        on_chunk: F,
    ) -> Result<Option<ContentHash>, EntryError>
    where
        F: FnMut(u64, u64) -> ControlFlow<()>,
    {
        if let Some(hash) = self.hash.get() {
            return Ok(Some(*hash));
        }

        let total = self.attributes()?.size;
        let hash_error = |source: io::Error| EntryError::Hash {
            path: self.relative_path.clone(),
            source,
        };

        let file = File::open(self.absolute_path()).map_err(hash_error)?;
        let hash = hash_reader(file, total, chunk_size, on_chunk).map_err(hash_error)?;

        Ok(hash.map(|h| *self.hash.get_or_init(|| h)))
    }
}

fn fetch_attributes(
    cell: &OnceLock<EntryAttributes>,
    absolute: &Path,
    relative: &str,
) -> Result<EntryAttributes, EntryError> {
    if let Some(attributes) = cell.get() {
        return Ok(*attributes);
    }

    let metadata = fs::metadata(absolute).map_err(|source| EntryError::Metadata {
        path: relative.to_string(),
        source,
    })?;

    Ok(*cell.get_or_init(|| EntryAttributes::from_metadata(&metadata)))
}
