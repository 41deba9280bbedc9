//! Symbol persistence and search.

use std::sync::Arc;

use rusqlite::{params, Connection, ToSql};

use crate::analysis::{Span, SymbolKind};
use crate::error::{LedgerError, Result};
use crate::repo::IndexStats;
use crate::store::{unix_millis, Store};

/// A persisted symbol row.
#[derive(Debug, Clone)]
pub struct SymbolRow {
    pub id: i64,
    pub project: String,
    pub file_path: String,
    pub kind: SymbolKind,
    pub name: String,
    pub span: Span,
    pub is_exported: bool,
    pub signature: Option<String>,
    pub fingerprint: Option<String>,
    pub detail: serde_json::Value,
    pub content_hash: String,
    pub indexed_at: i64,
}

/// Insert shape for [`SymbolRepository::replace_file_symbols`]; the file path,
/// project, owning-file hash, and timestamp come from the call site.
#[derive(Debug, Clone)]
pub struct NewSymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub span: Span,
    pub is_exported: bool,
    pub signature: Option<String>,
    pub fingerprint: Option<String>,
    pub detail: serde_json::Value,
}

/// Filters accepted by [`SymbolRepository::search_by_query`]. `fts` is an
/// already-composed FTS5 match expression.
#[derive(Debug, Clone, Default)]
pub struct SymbolFilter {
    pub fts: Option<String>,
    /// Raw query text; exact-name matches sort first.
    pub exact_name: Option<String>,
    pub kind: Option<SymbolKind>,
    pub file_path: Option<String>,
    pub is_exported: Option<bool>,
    pub project: Option<String>,
    pub limit: usize,
}

const COLUMNS: &str = "id, project, file_path, kind, name, start_line, start_column, \
                       end_line, end_column, is_exported, signature, fingerprint, \
                       detail_json, content_hash, indexed_at";

#[derive(Clone)]
pub struct SymbolRepository {
    store: Arc<Store>,
}

impl SymbolRepository {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Atomically replaces the symbol set of one file: delete everything
    /// under `(project, path)`, insert the new rows. FTS rows follow through
    /// the triggers.
    pub fn replace_file_symbols(
        &self,
        project: &str,
        path: &str,
        content_hash: &str,
        rows: &[NewSymbol],
    ) -> Result<()> {
        self.store
            .transaction(|tx| replace_file_symbols_in(tx.conn(), project, path, content_hash, rows))
    }

    pub fn get_file_symbols(&self, project: &str, path: &str) -> Result<Vec<SymbolRow>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM symbols WHERE project = ?1 AND file_path = ?2 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![project, path], row_to_symbol)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// FTS-backed name lookup with an optional kind filter.
    pub fn search_by_name(
        &self,
        project: &str,
        fts_expr: &str,
        kind: Option<SymbolKind>,
        limit: Option<usize>,
    ) -> Result<Vec<SymbolRow>> {
        self.search_by_query(&SymbolFilter {
            fts: Some(fts_expr.to_string()),
            kind,
            project: Some(project.to_string()),
            limit: limit.unwrap_or(100),
            ..SymbolFilter::default()
        })
    }

    pub fn search_by_kind(
        &self,
        project: &str,
        kind: SymbolKind,
        limit: Option<usize>,
    ) -> Result<Vec<SymbolRow>> {
        self.search_by_query(&SymbolFilter {
            kind: Some(kind),
            project: Some(project.to_string()),
            limit: limit.unwrap_or(100),
            ..SymbolFilter::default()
        })
    }

    /// All live symbols carrying a fingerprint, used for move correlation.
    pub fn get_by_fingerprint(&self, project: &str, fingerprint: &str) -> Result<Vec<SymbolRow>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM symbols WHERE project = ?1 AND fingerprint = ?2 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![project, fingerprint], row_to_symbol)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Combined filter query. With an FTS expression the match runs against
    /// the full-text table and joins back to `symbols`; otherwise the base
    /// table is filtered directly. Ordering: exact-name matches first, then
    /// FTS rank where applicable, then row id.
    pub fn search_by_query(&self, filter: &SymbolFilter) -> Result<Vec<SymbolRow>> {
        if filter.limit == 0 {
            return Err(LedgerError::Usage("symbol query limit must be positive".into()));
        }

        self.store.with_conn(|conn| {
            let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();
            let mut sql = if let Some(fts) = &filter.fts {
                params_vec.push(Box::new(fts.clone()));
                format!(
                    "SELECT {cols}, bm25(symbols_fts) AS rank
                     FROM symbols s JOIN symbols_fts ON s.id = symbols_fts.rowid
                     WHERE symbols_fts MATCH ?1",
                    cols = qualified_columns("s")
                )
            } else {
                format!(
                    "SELECT {cols} FROM symbols s WHERE 1 = 1",
                    cols = qualified_columns("s")
                )
            };

            if let Some(kind) = filter.kind {
                sql.push_str(&format!(" AND s.kind = ?{}", params_vec.len() + 1));
                params_vec.push(Box::new(kind.as_str().to_string()));
            }
            if let Some(path) = &filter.file_path {
                sql.push_str(&format!(" AND s.file_path = ?{}", params_vec.len() + 1));
                params_vec.push(Box::new(path.clone()));
            }
            if let Some(exported) = filter.is_exported {
                sql.push_str(&format!(" AND s.is_exported = ?{}", params_vec.len() + 1));
                params_vec.push(Box::new(i64::from(exported)));
            }
            if let Some(project) = &filter.project {
                sql.push_str(&format!(" AND s.project = ?{}", params_vec.len() + 1));
                params_vec.push(Box::new(project.clone()));
            }

            let mut order = String::from(" ORDER BY ");
            if let Some(exact) = &filter.exact_name {
                order.push_str(&format!(
                    "CASE WHEN s.name = ?{} THEN 0 ELSE 1 END, ",
                    params_vec.len() + 1
                ));
                params_vec.push(Box::new(exact.clone()));
            }
            if filter.fts.is_some() {
                order.push_str("rank, ");
            }
            order.push_str("s.id");
            sql.push_str(&order);
            sql.push_str(&format!(" LIMIT ?{}", params_vec.len() + 1));
            params_vec.push(Box::new(filter.limit as i64));

            let param_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(param_refs.as_slice(), row_to_symbol)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// File and symbol counts, workspace-wide or per project.
    pub fn get_stats(&self, project: Option<&str>) -> Result<IndexStats> {
        self.store.with_conn(|conn| {
            let (file_count, symbol_count) = match project {
                Some(p) => {
                    let files: u64 = conn.query_row(
                        "SELECT COUNT(*) FROM files WHERE project = ?1",
                        params![p],
                        |row| row.get(0),
                    )?;
                    let symbols: u64 = conn.query_row(
                        "SELECT COUNT(*) FROM symbols WHERE project = ?1",
                        params![p],
                        |row| row.get(0),
                    )?;
                    (files, symbols)
                }
                None => {
                    let files: u64 =
                        conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
                    let symbols: u64 =
                        conn.query_row("SELECT COUNT(*) FROM symbols", [], |row| row.get(0))?;
                    (files, symbols)
                }
            };
            Ok(IndexStats {
                file_count,
                symbol_count,
            })
        })
    }

    pub fn delete_file_symbols(&self, project: &str, path: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM symbols WHERE project = ?1 AND file_path = ?2",
                params![project, path],
            )?;
            Ok(())
        })
    }
}

pub(crate) fn replace_file_symbols_in(
    conn: &Connection,
    project: &str,
    path: &str,
    content_hash: &str,
    rows: &[NewSymbol],
) -> Result<()> {
    conn.execute(
        "DELETE FROM symbols WHERE project = ?1 AND file_path = ?2",
        params![project, path],
    )?;

    let indexed_at = unix_millis();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO symbols (project, file_path, kind, name, start_line, start_column,
                              end_line, end_column, is_exported, signature, fingerprint,
                              detail_json, content_hash, indexed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )?;
    for row in rows {
        stmt.execute(params![
            project,
            path,
            row.kind.as_str(),
            row.name,
            row.span.start.line,
            row.span.start.column,
            row.span.end.line,
            row.span.end.column,
            i64::from(row.is_exported),
            row.signature,
            row.fingerprint,
            detail_to_column(&row.detail),
            content_hash,
            indexed_at,
        ])?;
    }
    Ok(())
}

fn qualified_columns(alias: &str) -> String {
    COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn detail_to_column(detail: &serde_json::Value) -> Option<String> {
    if detail.is_null() {
        None
    } else {
        Some(detail.to_string())
    }
}

fn row_to_symbol(row: &rusqlite::Row<'_>) -> rusqlite::Result<SymbolRow> {
    let kind_str: String = row.get(3)?;
    let detail_str: Option<String> = row.get(12)?;
    Ok(SymbolRow {
        id: row.get(0)?,
        project: row.get(1)?,
        file_path: row.get(2)?,
        kind: SymbolKind::parse(&kind_str).unwrap_or(SymbolKind::Variable),
        name: row.get(4)?,
        span: Span::new(row.get(5)?, row.get(6)?, row.get(7)?, row.get(8)?),
        is_exported: row.get::<_, i64>(9)? != 0,
        signature: row.get(10)?,
        fingerprint: row.get(11)?,
        // A detail blob that fails to parse degrades to an empty object.
        detail: detail_str
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
        content_hash: row.get(13)?,
        indexed_at: row.get(14)?,
    })
}
