//! Per-backend record of stored content.
//!
//! A file record describes the source; a holding says which version of it a
//! given backend physically has. A backend is up to date for a path only
//! when its holding hash equals the file record hash.

use chrono::Utc;
use std::collections::HashMap;
use tokio_rusqlite::params;

use crate::core::entry::ContentHash;
use crate::db::catalog::{Catalog, CatalogError};

fn parse_hash(path: &str, hash: &str) -> Result<ContentHash, CatalogError> {
    hash.parse::<ContentHash>().map_err(|e| CatalogError::Corrupt {
        path: path.to_string(),
        message: format!("invalid holding hash: {}", e),
    })
}

/// Note that `backend` now stores `hash` for `path`.
pub fn record(
    catalog: &mut Catalog,
    path: &str,
    backend: &str,
    hash: &ContentHash,
) -> Result<(), CatalogError> {
    catalog.execute(
        "INSERT INTO holdings (path, backend, hash, stored_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(path, backend) DO UPDATE SET
            hash = excluded.hash,
            stored_at = excluded.stored_at",
        params![path, backend, hash.to_hex(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn remove(catalog: &mut Catalog, path: &str, backend: &str) -> Result<(), CatalogError> {
    catalog.execute(
        "DELETE FROM holdings WHERE path = ?1 AND backend = ?2",
        params![path, backend],
    )?;
    Ok(())
}

/// Backend name to stored hash, for one path.
pub fn for_path(
    catalog: &Catalog,
    path: &str,
) -> Result<HashMap<String, ContentHash>, CatalogError> {
    let mut stmt = catalog
        .connection()
        .prepare_cached("SELECT backend, hash FROM holdings WHERE path = ?1")?;
    let rows = stmt
        .query_map(params![path], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<(String, String)>, _>>()?;

    rows.into_iter()
        .map(|(backend, hash)| Ok((backend, parse_hash(path, &hash)?)))
        .collect()
}

/// Path to stored hash, for one backend.
pub fn for_backend(
    catalog: &Catalog,
    backend: &str,
) -> Result<HashMap<String, ContentHash>, CatalogError> {
    let mut stmt = catalog
        .connection()
        .prepare("SELECT path, hash FROM holdings WHERE backend = ?1")?;
    let rows = stmt
        .query_map(params![backend], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<(String, String)>, _>>()?;

    rows.into_iter()
        .map(|(path, hash)| {
            let hash = parse_hash(&path, &hash)?;
            Ok((path, hash))
        })
        .collect()
}

/// Every path held by at least one backend, ordered.
pub fn paths(catalog: &Catalog) -> Result<Vec<String>, CatalogError> {
    let mut stmt = catalog
        .connection()
        .prepare("SELECT DISTINCT path FROM holdings ORDER BY path")?;
    let paths = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(paths)
}
