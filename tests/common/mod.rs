//! Shared fixtures: a toy line-oriented analyzer and workspace builders.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use code_ledger::analysis::{
    function_signature, CodeRelation, Collaborators, ExtractedSymbol, ParsedSource,
    ProjectBoundary, RelationKind, SourceAnalyzer, Span, SymbolKind, WorkspaceLayout,
};
use code_ledger::error::{LedgerError, Result};
use code_ledger::layout::ManifestLayout;
use code_ledger::{LedgerOptions, Store};

/// Line-oriented toy language, just enough to exercise the pipeline:
///
/// ```text
/// export fn movedFn(a, b)          function, exported, params:2
/// async fn load(x)                 function, async
/// class Widget                     class
/// import "src/other.ts"            file-level imports edge
/// import helper from "src/b.ts"    symbol-level imports edge
/// PARSE_ERROR                      whole-file parse failure
/// ```
pub struct ToyAnalyzer;

#[derive(Debug, Clone)]
enum ToyDecl {
    Fn {
        name: String,
        params: usize,
        is_async: bool,
        exported: bool,
        line: u32,
    },
    Class {
        name: String,
        exported: bool,
        line: u32,
    },
    Import {
        dst: String,
        symbol: Option<String>,
        line: u32,
    },
}

impl SourceAnalyzer for ToyAnalyzer {
    fn parse(&self, file_path: &str, source: &str) -> Result<ParsedSource> {
        if source.contains("PARSE_ERROR") {
            return Err(LedgerError::Parse {
                file: file_path.to_string(),
                message: "forced parse error".to_string(),
            });
        }

        let mut decls = Vec::new();
        for (idx, raw) in source.lines().enumerate() {
            let line = idx as u32;
            let mut rest = raw.trim();
            let exported = if let Some(stripped) = rest.strip_prefix("export ") {
                rest = stripped;
                true
            } else {
                false
            };

            let is_async = if let Some(stripped) = rest.strip_prefix("async ") {
                rest = stripped;
                true
            } else {
                false
            };

            if let Some(fn_decl) = rest.strip_prefix("fn ") {
                let (name, params) = match fn_decl.split_once('(') {
                    Some((name, args)) => {
                        let args = args.trim_end_matches(')');
                        let count = args
                            .split(',')
                            .filter(|a| !a.trim().is_empty())
                            .count();
                        (name.trim().to_string(), count)
                    }
                    None => (fn_decl.trim().to_string(), 0),
                };
                decls.push(ToyDecl::Fn {
                    name,
                    params,
                    is_async,
                    exported,
                    line,
                });
            } else if let Some(class_decl) = rest.strip_prefix("class ") {
                decls.push(ToyDecl::Class {
                    name: class_decl.trim().to_string(),
                    exported,
                    line,
                });
            } else if let Some(import_decl) = rest.strip_prefix("import ") {
                if let Some((symbol, from)) = import_decl.split_once(" from ") {
                    if let Some(dst) = unquote(from) {
                        decls.push(ToyDecl::Import {
                            dst,
                            symbol: Some(symbol.trim().to_string()),
                            line,
                        });
                    }
                } else if let Some(dst) = unquote(import_decl) {
                    decls.push(ToyDecl::Import {
                        dst,
                        symbol: None,
                        line,
                    });
                }
            }
        }

        Ok(ParsedSource {
            file_path: file_path.to_string(),
            tree: Arc::new(decls),
            errors: Vec::new(),
            source_text: Arc::from(source),
        })
    }

    fn extract_symbols(&self, parsed: &ParsedSource) -> Vec<ExtractedSymbol> {
        let Some(decls) = parsed.tree.downcast_ref::<Vec<ToyDecl>>() else {
            return Vec::new();
        };
        decls
            .iter()
            .filter_map(|decl| match decl {
                ToyDecl::Fn {
                    name,
                    params,
                    is_async,
                    exported,
                    line,
                } => Some(ExtractedSymbol {
                    name: name.clone(),
                    kind: SymbolKind::Function,
                    span: Span::new(*line, 0, *line, 40),
                    is_exported: *exported,
                    signature: Some(function_signature(*params, *is_async)),
                    detail: serde_json::Value::Null,
                }),
                ToyDecl::Class {
                    name,
                    exported,
                    line,
                } => Some(ExtractedSymbol {
                    name: name.clone(),
                    kind: SymbolKind::Class,
                    span: Span::new(*line, 0, *line, 40),
                    is_exported: *exported,
                    signature: None,
                    detail: serde_json::Value::Null,
                }),
                ToyDecl::Import { .. } => None,
            })
            .collect()
    }

    fn extract_relations(&self, parsed: &ParsedSource) -> Vec<CodeRelation> {
        let Some(decls) = parsed.tree.downcast_ref::<Vec<ToyDecl>>() else {
            return Vec::new();
        };
        decls
            .iter()
            .filter_map(|decl| match decl {
                ToyDecl::Import { dst, symbol, .. } => Some(CodeRelation {
                    kind: RelationKind::Imports,
                    src_symbol: None,
                    dst_file_path: dst.clone(),
                    dst_symbol: symbol.clone(),
                    meta: serde_json::Value::Null,
                }),
                _ => None,
            })
            .collect()
    }
}

fn unquote(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .map(String::from)
}

/// Layout wrapper that counts collaborator invocations.
pub struct CountingLayout {
    inner: ManifestLayout,
    pub alias_loads: Arc<AtomicUsize>,
    pub discoveries: Arc<AtomicUsize>,
}

impl CountingLayout {
    pub fn new(options: &LedgerOptions) -> Self {
        Self {
            inner: ManifestLayout::new(options),
            alias_loads: Arc::new(AtomicUsize::new(0)),
            discoveries: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl WorkspaceLayout for CountingLayout {
    async fn discover_projects(&self, workspace_root: &Path) -> Result<Vec<ProjectBoundary>> {
        self.discoveries.fetch_add(1, Ordering::SeqCst);
        self.inner.discover_projects(workspace_root).await
    }

    fn resolve_project(&self, rel_path: &str, boundaries: &[ProjectBoundary]) -> String {
        self.inner.resolve_project(rel_path, boundaries)
    }

    async fn load_alias_table(&self, workspace_root: &Path) -> Result<Option<serde_json::Value>> {
        self.alias_loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_alias_table(workspace_root).await
    }
}

/// A throwaway workspace with compressed timings and a root manifest naming
/// the project `app`.
pub struct TestWorkspace {
    pub dir: TempDir,
    pub options: LedgerOptions,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = std::fs::canonicalize(dir.path()).expect("canonicalize");
        std::fs::write(root.join("package.json"), r#"{"name": "app"}"#).expect("manifest");

        let mut options = LedgerOptions::new(root);
        options.debounce = std::time::Duration::from_millis(100);
        options.heartbeat_interval = std::time::Duration::from_millis(100);
        options.healthcheck_interval = std::time::Duration::from_millis(150);
        options.ownership_staleness = std::time::Duration::from_millis(400);
        Self { dir, options }
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.options.workspace_root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, content).expect("write");
    }

    pub fn remove(&self, rel: &str) {
        let _ = std::fs::remove_file(self.options.workspace_root.join(rel));
    }

    pub fn store(&self) -> Arc<Store> {
        Arc::new(Store::open(&self.options.db_path()).expect("store"))
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            analyzer: Arc::new(ToyAnalyzer),
            layout: Arc::new(ManifestLayout::new(&self.options)),
        }
    }

    /// The root boundary as discovery would report it.
    pub fn app_boundary() -> Vec<ProjectBoundary> {
        vec![ProjectBoundary {
            dir: String::new(),
            name: "app".to_string(),
        }]
    }
}
