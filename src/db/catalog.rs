//! The catalog: what was last backed up, plus run settings.
//!
//! A catalog is a SQLite database guarded by an advisory lock file next to
//! it. Only one process may hold a catalog open at a time; a second opener
//! gets [`CatalogError::InUse`] carrying the lock location.
//!
//! After [`Catalog::load_to_memory`], queries run against an in-memory copy.
//! With auto-sync off, changes reach disk only on [`Catalog::sync_to_disk`]
//! or [`Catalog::close`]; dropping an unclosed catalog discards them.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_rusqlite::rusqlite::{self, Connection, OptionalExtension, Params, types::Value};
use tracing::{debug, warn};

use crate::core::error::ErrorTier;

const SCHEMA: &str = include_str!("schema.sql");
const TABLES: [&str; 5] = ["files", "folders", "holdings", "settings", "runs"];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog is in use by another process (lock file {})", .lock_path.display())]
    InUse { lock_path: PathBuf },

    #[error("catalog I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("catalog query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("catalog record for '{path}' is corrupt: {message}")]
    Corrupt { path: String, message: String },
}

impl CatalogError {
    pub fn tier(&self) -> ErrorTier {
        ErrorTier::Fatal
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Exclusive lock file, removed on drop.
#[derive(Debug)]
struct CatalogLock {
    path: PathBuf,
}

impl CatalogLock {
    fn acquire(path: PathBuf) -> Result<Self, CatalogError> {
        let mut file: File = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(CatalogError::InUse { lock_path: path });
            }
            Err(e) => return Err(CatalogError::io(&path, e)),
        };

        if let Err(e) = writeln!(file, "{}", std::process::id()) {
            debug!(lock = %path.display(), error = %e, "Failed to record pid in lock file");
        }
        Ok(Self { path })
    }
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release catalog lock");
        }
    }
}

/// Lock file location for a catalog at `path`.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

pub struct Catalog {
    path: PathBuf,
    conn: Connection,
    in_memory: bool,
    auto_sync_to_disk: bool,
    dirty: bool,
    // Declared last so the connection closes before the lock is released
    lock: CatalogLock,
}

impl Catalog {
    /// Take the lock and open (creating if needed) the catalog at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| CatalogError::io(parent, e))?;
        }

        let lock = CatalogLock::acquire(lock_path_for(&path))?;
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;

        debug!(catalog = %path.display(), "Catalog opened");
        Ok(Self {
            path,
            conn,
            in_memory: false,
            auto_sync_to_disk: true,
            dirty: false,
            lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock.path
    }

    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// Whether each mutation of an in-memory catalog is flushed immediately.
    pub fn set_auto_sync_to_disk(&mut self, enabled: bool) {
        self.auto_sync_to_disk = enabled;
    }

    /// Switch to an in-memory copy of the on-disk catalog.
    pub fn load_to_memory(&mut self) -> Result<(), CatalogError> {
        if self.in_memory {
            return Ok(());
        }

        let mut memory = Connection::open_in_memory()?;
        memory.execute_batch(SCHEMA)?;

        copy_tables(&mut memory, &self.path)?;

        self.conn = memory;
        self.in_memory = true;
        self.dirty = false;
        debug!(catalog = %self.path.display(), "Catalog loaded into memory");
        Ok(())
    }

    /// Replace the contents of every table with those of another catalog
    /// file, such as a snapshot fetched from a backend.
    pub fn import_from(&mut self, snapshot: &Path) -> Result<(), CatalogError> {
        copy_tables(&mut self.conn, snapshot)?;
        self.dirty = true;
        if self.in_memory && self.auto_sync_to_disk {
            self.sync_to_disk()?;
        }
        debug!(catalog = %self.path.display(), snapshot = %snapshot.display(), "Catalog imported");
        Ok(())
    }

    /// Run a mutating statement, returning the number of changed rows.
    pub fn execute<P: Params>(&mut self, sql: &str, params: P) -> Result<usize, CatalogError> {
        let changed = self.conn.execute(sql, params)?;
        self.dirty = true;
        if self.in_memory && self.auto_sync_to_disk {
            self.sync_to_disk()?;
        }
        Ok(changed)
    }

    /// First column of the first row, or `Value::Null` when there is none.
    pub fn execute_scalar<P: Params>(&self, sql: &str, params: P) -> Result<Value, CatalogError> {
        let value = self
            .conn
            .query_row(sql, params, |row| row.get::<_, Value>(0))
            .optional()?;
        Ok(value.unwrap_or(Value::Null))
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Write an in-memory catalog back to its file, atomically.
    /// A catalog opened directly on disk is always current.
    pub fn sync_to_disk(&mut self) -> Result<(), CatalogError> {
        if !self.in_memory {
            return Ok(());
        }

        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".sync");
        let staging = self.path.with_file_name(name);

        match fs::remove_file(&staging) {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                return Err(CatalogError::io(&staging, e));
            }
            _ => {}
        }

        self.conn
            .execute("VACUUM INTO ?1", [staging.to_string_lossy().into_owned()])?;
        fs::rename(&staging, &self.path).map_err(|e| CatalogError::io(&self.path, e))?;

        self.dirty = false;
        debug!(catalog = %self.path.display(), "Catalog synced to disk");
        Ok(())
    }

    /// Flush pending changes and release the lock.
    pub fn close(mut self) -> Result<(), CatalogError> {
        if self.dirty {
            self.sync_to_disk()?;
        }
        debug!(catalog = %self.path.display(), "Catalog closed");
        Ok(())
    }
}

/// Overwrite the tables of `conn` with those of the database at `source`.
fn copy_tables(conn: &mut Connection, source: &Path) -> Result<(), CatalogError> {
    conn.execute(
        "ATTACH DATABASE ?1 AS source",
        [source.to_string_lossy().into_owned()],
    )?;

    let copied = (|| -> rusqlite::Result<()> {
        let tx = conn.transaction()?;
        for table in TABLES {
            tx.execute_batch(&format!(
                "DELETE FROM main.{table};
                 INSERT INTO main.{table} SELECT * FROM source.{table};"
            ))?;
        }
        tx.commit()
    })();

    let detached = conn.execute_batch("DETACH DATABASE source;");
    copied?;
    detached?;
    Ok(())
}
