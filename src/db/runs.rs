use chrono::Utc;
use tokio_rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use crate::db::catalog::{Catalog, CatalogError};

/// One row of run history.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub warning: bool,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub description: Option<String>,
}

/// Record the start of a run and return its id.
pub fn start(catalog: &mut Catalog, kind: &str) -> Result<String, CatalogError> {
    let id = Uuid::now_v7().to_string();
    catalog.execute(
        "INSERT INTO runs (id, kind, status, started_at)
         VALUES (?1, ?2, 'Running', ?3)",
        params![&id, kind, Utc::now().to_rfc3339()],
    )?;
    Ok(id)
}

pub fn finish(
    catalog: &mut Catalog,
    id: &str,
    status: &str,
    warning: bool,
    description: Option<&str>,
) -> Result<(), CatalogError> {
    catalog.execute(
        "UPDATE runs SET status = ?2, warning = ?3, finished_at = ?4, description = ?5
         WHERE id = ?1",
        params![id, status, warning, Utc::now().to_rfc3339(), description],
    )?;
    Ok(())
}

/// Most recent runs first.
pub fn recent(catalog: &Catalog, limit: usize) -> Result<Vec<RunRecord>, CatalogError> {
    let mut stmt = catalog.connection().prepare(
        "SELECT id, kind, status, warning, started_at, finished_at, description
         FROM runs ORDER BY id DESC LIMIT ?1",
    )?;
    let runs = stmt
        .query_map(params![limit as i64], |row| {
            Ok(RunRecord {
                id: row.get(0)?,
                kind: row.get(1)?,
                status: row.get(2)?,
                warning: row.get(3)?,
                started_at: row.get(4)?,
                finished_at: row.get(5)?,
                description: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(runs)
}
