//! Query composition and result shaping for symbol and relation search.

use crate::analysis::{RelationKind, Span, SymbolKind};
use crate::error::Result;
use crate::repo::{
    RelationFilter, RelationRepository, RelationRow, SymbolFilter, SymbolRepository, SymbolRow,
};

pub const DEFAULT_SYMBOL_LIMIT: usize = 100;
pub const DEFAULT_RELATION_LIMIT: usize = 500;

/// Free-text symbol search request.
#[derive(Debug, Clone, Default)]
pub struct SymbolQuery {
    pub text: Option<String>,
    pub kind: Option<SymbolKind>,
    pub file_path: Option<String>,
    pub is_exported: Option<bool>,
    pub project: Option<String>,
    pub limit: Option<usize>,
}

/// Relation search request; any subset of fields narrows the match.
#[derive(Debug, Clone, Default)]
pub struct RelationQuery {
    pub src_file_path: Option<String>,
    pub src_symbol_name: Option<String>,
    pub dst_file_path: Option<String>,
    pub dst_symbol_name: Option<String>,
    pub kind: Option<RelationKind>,
    pub project: Option<String>,
    pub limit: Option<usize>,
}

/// A reshaped symbol search hit.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SymbolHit {
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
}

/// A reshaped relation search hit.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RelationHit {
    pub id: i64,
    pub project: String,
    pub kind: RelationKind,
    pub src_file_path: String,
    pub src_symbol_name: Option<String>,
    pub dst_file_path: String,
    pub dst_symbol_name: Option<String>,
    pub meta: serde_json::Value,
}

/// Builds an FTS5 match expression out of free text: trim, split on
/// whitespace, quote each token (escaping embedded quotes), append `*` for
/// prefix matching. `User Svc` becomes `"User"* "Svc"*`. Returns `None` for
/// blank input.
pub fn build_fts_expression(raw: &str) -> Option<String> {
    let tokens: Vec<String> = raw
        .split_whitespace()
        .map(|token| format!("\"{}\"*", token.replace('"', "\"\"")))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

pub fn search_symbols(repo: &SymbolRepository, query: &SymbolQuery) -> Result<Vec<SymbolHit>> {
    let trimmed = query.text.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let filter = SymbolFilter {
        fts: trimmed.and_then(build_fts_expression),
        exact_name: trimmed.map(String::from),
        kind: query.kind,
        file_path: query.file_path.clone(),
        is_exported: query.is_exported,
        project: query.project.clone(),
        limit: query.limit.unwrap_or(DEFAULT_SYMBOL_LIMIT),
    };
    let rows = repo.search_by_query(&filter)?;
    Ok(rows.into_iter().map(reshape_symbol).collect())
}

pub fn search_relations(
    repo: &RelationRepository,
    query: &RelationQuery,
) -> Result<Vec<RelationHit>> {
    let filter = RelationFilter {
        src_file_path: query.src_file_path.clone(),
        src_symbol_name: query.src_symbol_name.clone(),
        dst_file_path: query.dst_file_path.clone(),
        dst_symbol_name: query.dst_symbol_name.clone(),
        kind: query.kind,
        project: query.project.clone(),
    };
    let rows = repo.search_relations(&filter, query.limit.unwrap_or(DEFAULT_RELATION_LIMIT))?;
    Ok(rows.into_iter().map(reshape_relation).collect())
}

fn reshape_symbol(row: SymbolRow) -> SymbolHit {
    SymbolHit {
        id: row.id,
        project: row.project,
        file_path: row.file_path,
        kind: row.kind,
        name: row.name,
        span: row.span,
        is_exported: row.is_exported,
        signature: row.signature,
        fingerprint: row.fingerprint,
        detail: row.detail,
        content_hash: row.content_hash,
    }
}

fn reshape_relation(row: RelationRow) -> RelationHit {
    RelationHit {
        id: row.id,
        project: row.project,
        kind: row.kind,
        src_file_path: row.src_file_path,
        src_symbol_name: row.src_symbol_name,
        dst_file_path: row.dst_file_path,
        dst_symbol_name: row.dst_symbol_name,
        meta: row.meta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::symbol_fingerprint;
    use crate::repo::{FileRecord, FileRepository, NewSymbol};
    use crate::store::Store;
    use std::sync::Arc;

    #[test]
    fn fts_expression_tokenizes_and_prefixes() {
        assert_eq!(
            build_fts_expression("User Svc").as_deref(),
            Some("\"User\"* \"Svc\"*")
        );
        assert_eq!(
            build_fts_expression("  padded  ").as_deref(),
            Some("\"padded\"*")
        );
        assert_eq!(build_fts_expression("   "), None);
    }

    #[test]
    fn fts_expression_escapes_quotes() {
        assert_eq!(
            build_fts_expression("a\"b").as_deref(),
            Some("\"a\"\"b\"*")
        );
    }

    fn seeded() -> (FileRepository, SymbolRepository) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let files = FileRepository::new(store.clone());
        let symbols = SymbolRepository::new(store);
        files
            .upsert_file(&FileRecord::new("app", "src/user.ts", 1, 1, "h"))
            .unwrap();
        let sig = Some("params:1|async:0".to_string());
        symbols
            .replace_file_symbols(
                "app",
                "src/user.ts",
                "h",
                &[NewSymbol {
                    name: "UserService".into(),
                    kind: SymbolKind::Class,
                    span: Span::new(3, 0, 40, 1),
                    is_exported: true,
                    signature: None,
                    fingerprint: Some(symbol_fingerprint("UserService", SymbolKind::Class, None)),
                    detail: serde_json::json!({"extends": "BaseService"}),
                }, NewSymbol {
                    name: "loadUser".into(),
                    kind: SymbolKind::Function,
                    span: Span::new(42, 0, 50, 1),
                    is_exported: false,
                    fingerprint: Some(symbol_fingerprint(
                        "loadUser",
                        SymbolKind::Function,
                        sig.as_deref(),
                    )),
                    signature: sig,
                    detail: serde_json::Value::Null,
                }],
            )
            .unwrap();
        (files, symbols)
    }

    #[test]
    fn free_text_search_reshapes_rows() {
        let (_files, symbols) = seeded();
        let hits = search_symbols(
            &symbols,
            &SymbolQuery {
                text: Some("UserSer".into()),
                project: Some("app".into()),
                ..SymbolQuery::default()
            },
        )
        .unwrap();

        assert_eq!(hits.len(), 1);
        let hit = &hits[0];
        assert_eq!(hit.name, "UserService");
        assert!(hit.is_exported);
        assert_eq!(hit.span.start.line, 3);
        assert_eq!(hit.detail["extends"], "BaseService");
    }

    #[test]
    fn file_filter_returns_exact_file_set() {
        let (_files, symbols) = seeded();
        let hits = search_symbols(
            &symbols,
            &SymbolQuery {
                file_path: Some("src/user.ts".into()),
                ..SymbolQuery::default()
            },
        )
        .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn blank_text_is_a_pure_filter_query() {
        let (_files, symbols) = seeded();
        let hits = search_symbols(
            &symbols,
            &SymbolQuery {
                text: Some("   ".into()),
                kind: Some(SymbolKind::Function),
                ..SymbolQuery::default()
            },
        )
        .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "loadUser");
    }
}
