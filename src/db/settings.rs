use std::collections::BTreeMap;
use tokio_rusqlite::{params, rusqlite::types::Value};

use crate::db::catalog::{Catalog, CatalogError};

pub const LAST_BACKUP_AT: &str = "last_backup_at";
pub const LAST_BACKUP_STATUS: &str = "last_backup_status";
pub const LAST_BACKUP_WARNING: &str = "last_backup_warning";
pub const LAST_RESTORE_AT: &str = "last_restore_at";
pub const LAST_RESTORE_STATUS: &str = "last_restore_status";
pub const LAST_RESTORE_WARNING: &str = "last_restore_warning";
pub const SOURCE_ROOT: &str = "source_root";

pub fn get(catalog: &Catalog, key: &str) -> Result<Option<String>, CatalogError> {
    match catalog.execute_scalar("SELECT value FROM settings WHERE key = ?1", params![key])? {
        Value::Text(value) => Ok(Some(value)),
        Value::Null => Ok(None),
        Value::Integer(n) => Ok(Some(n.to_string())),
        Value::Real(n) => Ok(Some(n.to_string())),
        Value::Blob(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
    }
}

pub fn set(catalog: &mut Catalog, key: &str, value: &str) -> Result<(), CatalogError> {
    catalog.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn all(catalog: &Catalog) -> Result<BTreeMap<String, String>, CatalogError> {
    let mut stmt = catalog
        .connection()
        .prepare("SELECT key, value FROM settings")?;
    let settings = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<BTreeMap<String, String>, _>>()?;
    Ok(settings)
}
