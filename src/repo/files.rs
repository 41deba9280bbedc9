//! File record CRUD.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::store::{unix_millis, Store};

/// One row of the `files` table. `path` is workspace-relative with forward
/// slashes and never escapes the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub project: String,
    pub path: String,
    pub mtime_ms: i64,
    pub size: i64,
    pub content_hash: String,
    pub updated_at: i64,
}

const COLUMNS: &str = "project, path, mtime_ms, size, content_hash, updated_at";

#[derive(Clone)]
pub struct FileRepository {
    store: Arc<Store>,
}

impl FileRepository {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn get_file(&self, project: &str, path: &str) -> Result<Option<FileRecord>> {
        self.store.with_conn(|conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM files WHERE project = ?1 AND path = ?2"),
                    params![project, path],
                    row_to_file,
                )
                .optional()?;
            Ok(record)
        })
    }

    /// Insert, or on `(project, path)` conflict refresh the change-tracking
    /// columns.
    pub fn upsert_file(&self, record: &FileRecord) -> Result<()> {
        self.store.with_conn(|conn| upsert_file_in(conn, record))
    }

    pub fn get_all(&self, project: &str) -> Result<Vec<FileRecord>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM files WHERE project = ?1 ORDER BY path"
            ))?;
            let records = stmt
                .query_map(params![project], row_to_file)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    /// All file records of a project keyed by path.
    pub fn get_files_map(&self, project: &str) -> Result<HashMap<String, FileRecord>> {
        let records = self.get_all(project)?;
        Ok(records.into_iter().map(|r| (r.path.clone(), r)).collect())
    }

    /// Distinct project names present in the index.
    pub fn list_projects(&self) -> Result<Vec<String>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT project FROM files ORDER BY project")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
    }

    /// Projects that contain the given path (normally zero or one).
    pub fn projects_of_path(&self, path: &str) -> Result<Vec<String>> {
        self.store.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT project FROM files WHERE path = ?1 ORDER BY project")?;
            let names = stmt
                .query_map(params![path], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
    }

    /// Deletes the file row; symbols and outgoing relations go with it via
    /// foreign-key cascade.
    pub fn delete_file(&self, project: &str, path: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM files WHERE project = ?1 AND path = ?2",
                params![project, path],
            )?;
            Ok(())
        })
    }
}

pub(crate) fn upsert_file_in(conn: &Connection, record: &FileRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO files (project, path, mtime_ms, size, content_hash, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(project, path) DO UPDATE SET
             mtime_ms = excluded.mtime_ms,
             size = excluded.size,
             content_hash = excluded.content_hash,
             updated_at = excluded.updated_at",
        params![
            record.project,
            record.path,
            record.mtime_ms,
            record.size,
            record.content_hash,
            record.updated_at,
        ],
    )?;
    Ok(())
}

/// Clears every file row of a project; used by the full rebuild.
pub(crate) fn delete_project_files_in(conn: &Connection, project: &str) -> Result<()> {
    conn.execute("DELETE FROM files WHERE project = ?1", params![project])?;
    Ok(())
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        project: row.get(0)?,
        path: row.get(1)?,
        mtime_ms: row.get(2)?,
        size: row.get(3)?,
        content_hash: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

impl FileRecord {
    /// Convenience constructor stamping `updated_at` with the current time.
    pub fn new(
        project: impl Into<String>,
        path: impl Into<String>,
        mtime_ms: i64,
        size: i64,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            path: path.into(),
            mtime_ms,
            size,
            content_hash: content_hash.into(),
            updated_at: unix_millis(),
        }
    }
}
