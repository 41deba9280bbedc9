//! Relation persistence: typed edges between file-or-symbol endpoints.

use std::sync::Arc;

use rusqlite::{params, Connection, ToSql};

use crate::analysis::{CodeRelation, RelationKind};
use crate::error::{LedgerError, Result};
use crate::store::Store;

/// A persisted relation row. Null symbol names mean file-level endpoints.
#[derive(Debug, Clone)]
pub struct RelationRow {
    pub id: i64,
    pub project: String,
    pub kind: RelationKind,
    pub src_file_path: String,
    pub src_symbol_name: Option<String>,
    pub dst_file_path: String,
    pub dst_symbol_name: Option<String>,
    pub meta: serde_json::Value,
}

/// Filters for [`RelationRepository::search_relations`]; any subset may be
/// set.
#[derive(Debug, Clone, Default)]
pub struct RelationFilter {
    pub src_file_path: Option<String>,
    pub src_symbol_name: Option<String>,
    pub dst_file_path: Option<String>,
    pub dst_symbol_name: Option<String>,
    pub kind: Option<RelationKind>,
    pub project: Option<String>,
}

const COLUMNS: &str =
    "id, project, type, src_file_path, src_symbol_name, dst_file_path, dst_symbol_name, meta_json";

#[derive(Clone)]
pub struct RelationRepository {
    store: Arc<Store>,
}

impl RelationRepository {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Atomically replaces the outgoing relations of one source file.
    pub fn replace_file_relations(
        &self,
        project: &str,
        src_path: &str,
        rows: &[CodeRelation],
    ) -> Result<()> {
        self.store
            .transaction(|tx| replace_file_relations_in(tx.conn(), project, src_path, rows))
    }

    pub fn get_outgoing(
        &self,
        project: &str,
        src_path: &str,
        src_symbol: Option<&str>,
    ) -> Result<Vec<RelationRow>> {
        self.store.with_conn(|conn| {
            let rows = match src_symbol {
                Some(symbol) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM relations
                         WHERE project = ?1 AND src_file_path = ?2 AND src_symbol_name = ?3
                         ORDER BY id"
                    ))?;
                    let result = stmt
                        .query_map(params![project, src_path, symbol], row_to_relation)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    result
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM relations
                         WHERE project = ?1 AND src_file_path = ?2
                         ORDER BY id"
                    ))?;
                    let result = stmt
                        .query_map(params![project, src_path], row_to_relation)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    result
                }
            };
            Ok(rows)
        })
    }

    pub fn get_incoming(&self, project: &str, dst_path: &str) -> Result<Vec<RelationRow>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM relations
                 WHERE project = ?1 AND dst_file_path = ?2
                 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![project, dst_path], row_to_relation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn get_by_type(&self, project: &str, kind: RelationKind) -> Result<Vec<RelationRow>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM relations
                 WHERE project = ?1 AND type = ?2
                 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![project, kind.as_str()], row_to_relation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn delete_file_relations(&self, project: &str, src_path: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM relations WHERE project = ?1 AND src_file_path = ?2",
                params![project, src_path],
            )?;
            Ok(())
        })
    }

    /// Repoints every relation whose destination matches `(old_file,
    /// old_symbol)` at `(new_file, new_symbol)`. `old_symbol = None` matches
    /// file-level edges. Returns the number of rewritten rows.
    pub fn retarget_relations(
        &self,
        project: &str,
        old_file: &str,
        old_symbol: Option<&str>,
        new_file: &str,
        new_symbol: Option<&str>,
    ) -> Result<usize> {
        self.store.with_conn(|conn| {
            let rewritten = match old_symbol {
                Some(symbol) => conn.execute(
                    "UPDATE relations SET dst_file_path = ?1, dst_symbol_name = ?2
                     WHERE project = ?3 AND dst_file_path = ?4 AND dst_symbol_name = ?5",
                    params![new_file, new_symbol, project, old_file, symbol],
                )?,
                None => conn.execute(
                    "UPDATE relations SET dst_file_path = ?1, dst_symbol_name = ?2
                     WHERE project = ?3 AND dst_file_path = ?4 AND dst_symbol_name IS NULL",
                    params![new_file, new_symbol, project, old_file],
                )?,
            };
            Ok(rewritten)
        })
    }

    /// Matches any subset of endpoint/type/project filters.
    pub fn search_relations(&self, filter: &RelationFilter, limit: usize) -> Result<Vec<RelationRow>> {
        if limit == 0 {
            return Err(LedgerError::Usage("relation query limit must be positive".into()));
        }

        self.store.with_conn(|conn| {
            let mut sql = format!("SELECT {COLUMNS} FROM relations WHERE 1 = 1");
            let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

            let mut push = |sql: &mut String, clause: &str, value: Box<dyn ToSql>| {
                params_vec.push(value);
                sql.push_str(&format!(" AND {} = ?{}", clause, params_vec.len()));
            };

            if let Some(v) = &filter.src_file_path {
                push(&mut sql, "src_file_path", Box::new(v.clone()));
            }
            if let Some(v) = &filter.src_symbol_name {
                push(&mut sql, "src_symbol_name", Box::new(v.clone()));
            }
            if let Some(v) = &filter.dst_file_path {
                push(&mut sql, "dst_file_path", Box::new(v.clone()));
            }
            if let Some(v) = &filter.dst_symbol_name {
                push(&mut sql, "dst_symbol_name", Box::new(v.clone()));
            }
            if let Some(kind) = filter.kind {
                push(&mut sql, "type", Box::new(kind.as_str().to_string()));
            }
            if let Some(v) = &filter.project {
                push(&mut sql, "project", Box::new(v.clone()));
            }

            params_vec.push(Box::new(limit as i64));
            sql.push_str(&format!(" ORDER BY id LIMIT ?{}", params_vec.len()));

            let param_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(param_refs.as_slice(), row_to_relation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

pub(crate) fn replace_file_relations_in(
    conn: &Connection,
    project: &str,
    src_path: &str,
    rows: &[CodeRelation],
) -> Result<()> {
    conn.execute(
        "DELETE FROM relations WHERE project = ?1 AND src_file_path = ?2",
        params![project, src_path],
    )?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO relations (project, type, src_file_path, src_symbol_name,
                                dst_file_path, dst_symbol_name, meta_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for row in rows {
        let meta = if row.meta.is_null() {
            None
        } else {
            Some(row.meta.to_string())
        };
        stmt.execute(params![
            project,
            row.kind.as_str(),
            src_path,
            row.src_symbol,
            row.dst_file_path,
            row.dst_symbol,
            meta,
        ])?;
    }
    Ok(())
}

fn row_to_relation(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelationRow> {
    let kind_str: String = row.get(2)?;
    let meta_str: Option<String> = row.get(7)?;
    Ok(RelationRow {
        id: row.get(0)?,
        project: row.get(1)?,
        kind: RelationKind::parse(&kind_str).unwrap_or(RelationKind::Imports),
        src_file_path: row.get(3)?,
        src_symbol_name: row.get(4)?,
        dst_file_path: row.get(5)?,
        dst_symbol_name: row.get(6)?,
        meta: meta_str
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
    })
}
