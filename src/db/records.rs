use chrono::Utc;
use filetime::FileTime;
use tokio_rusqlite::{
    params,
    rusqlite::{OptionalExtension, Row},
};

use crate::core::entry::{ContentHash, from_unix_nanos};
use crate::db::catalog::{Catalog, CatalogError};

/// Last known state of one backed-up file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRecord {
    pub path: String,
    pub hash: ContentHash,
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch
    pub mtime_ns: i64,
}

impl CatalogRecord {
    pub fn modified(&self) -> FileTime {
        from_unix_nanos(self.mtime_ns)
    }
}

fn from_row(row: &Row<'_>) -> tokio_rusqlite::rusqlite::Result<(String, String, i64, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_record(
    (path, hash, size, mtime_ns): (String, String, i64, i64),
) -> Result<CatalogRecord, CatalogError> {
    let hash = hash.parse::<ContentHash>().map_err(|e| CatalogError::Corrupt {
        path: path.clone(),
        message: format!("invalid hash: {}", e),
    })?;
    Ok(CatalogRecord {
        path,
        hash,
        size: size.max(0) as u64,
        mtime_ns,
    })
}

pub fn get(catalog: &Catalog, path: &str) -> Result<Option<CatalogRecord>, CatalogError> {
    let row = catalog
        .connection()
        .prepare_cached("SELECT path, hash, size, mtime_ns FROM files WHERE path = ?1")?
        .query_row(params![path], from_row)
        .optional()?;

    row.map(into_record).transpose()
}

pub fn upsert(catalog: &mut Catalog, record: &CatalogRecord) -> Result<(), CatalogError> {
    catalog.execute(
        "INSERT INTO files (path, hash, size, mtime_ns, backed_up_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(path) DO UPDATE SET
            hash = excluded.hash,
            size = excluded.size,
            mtime_ns = excluded.mtime_ns,
            backed_up_at = excluded.backed_up_at",
        params![
            &record.path,
            record.hash.to_hex(),
            record.size as i64,
            record.mtime_ns,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

pub fn delete(catalog: &mut Catalog, path: &str) -> Result<(), CatalogError> {
    catalog.execute("DELETE FROM files WHERE path = ?1", params![path])?;
    Ok(())
}

/// Every file record, ordered by path.
pub fn list(catalog: &Catalog) -> Result<Vec<CatalogRecord>, CatalogError> {
    let mut stmt = catalog
        .connection()
        .prepare("SELECT path, hash, size, mtime_ns FROM files ORDER BY path")?;
    let rows = stmt
        .query_map([], from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(into_record).collect()
}

pub fn count(catalog: &Catalog) -> Result<u64, CatalogError> {
    let count: i64 = catalog
        .connection()
        .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

pub fn upsert_folder(catalog: &mut Catalog, path: &str) -> Result<(), CatalogError> {
    catalog.execute(
        "INSERT INTO folders (path) VALUES (?1) ON CONFLICT(path) DO NOTHING",
        params![path],
    )?;
    Ok(())
}

/// Remove a folder record and every folder record nested under it.
pub fn delete_folder(catalog: &mut Catalog, path: &str) -> Result<(), CatalogError> {
    catalog.execute(
        "DELETE FROM folders WHERE path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/'",
        params![path],
    )?;
    Ok(())
}

/// Every folder record, ordered so parents precede their children.
pub fn list_folders(catalog: &Catalog) -> Result<Vec<String>, CatalogError> {
    let mut stmt = catalog
        .connection()
        .prepare("SELECT path FROM folders ORDER BY path")?;
    let folders = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(folders)
}
