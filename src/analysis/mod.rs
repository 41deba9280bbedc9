//! The analysis surface: everything the index core consumes from language
//! tooling, expressed as one dependency bundle.
//!
//! The core never parses source itself. A [`SourceAnalyzer`] turns text into
//! an opaque tree plus extracted symbols and relations; a [`WorkspaceLayout`]
//! maps files onto project boundaries and loads the path-alias table. Both
//! are injected at open time through [`Collaborators`]; there are no global
//! registries.

pub mod cache;

use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::paths::hash_string;

/// Symbol classification persisted in the `kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Method,
    Class,
    Variable,
    Type,
    Interface,
    Enum,
    Property,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Function => "function",
            SymbolKind::Method => "method",
            SymbolKind::Class => "class",
            SymbolKind::Variable => "variable",
            SymbolKind::Type => "type",
            SymbolKind::Interface => "interface",
            SymbolKind::Enum => "enum",
            SymbolKind::Property => "property",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "function" => Some(SymbolKind::Function),
            "method" => Some(SymbolKind::Method),
            "class" => Some(SymbolKind::Class),
            "variable" => Some(SymbolKind::Variable),
            "type" => Some(SymbolKind::Type),
            "interface" => Some(SymbolKind::Interface),
            "enum" => Some(SymbolKind::Enum),
            "property" => Some(SymbolKind::Property),
            _ => None,
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed edge classification persisted in the `type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Imports,
    Calls,
    Extends,
    Implements,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Imports => "imports",
            RelationKind::Calls => "calls",
            RelationKind::Extends => "extends",
            RelationKind::Implements => "implements",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "imports" => Some(RelationKind::Imports),
            "calls" => Some(RelationKind::Calls),
            "extends" => Some(RelationKind::Extends),
            "implements" => Some(RelationKind::Implements),
            _ => None,
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Zero-based source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

/// Half-open source span of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start_line: u32, start_column: u32, end_line: u32, end_column: u32) -> Self {
        Self {
            start: Position {
                line: start_line,
                column: start_column,
            },
            end: Position {
                line: end_line,
                column: end_column,
            },
        }
    }
}

/// One symbol as produced by the extractor. The core adds the fingerprint,
/// owning-file hash, and timestamps before persisting.
#[derive(Debug, Clone)]
pub struct ExtractedSymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub span: Span,
    pub is_exported: bool,
    /// `params:N|async:{0|1}` for functions and methods, `None` otherwise.
    pub signature: Option<String>,
    /// Extractor-defined payload, opaque to the core.
    pub detail: serde_json::Value,
}

/// One outgoing relation as produced by the extractor. The source file is
/// implied by the file being indexed.
#[derive(Debug, Clone)]
pub struct CodeRelation {
    pub kind: RelationKind,
    /// Symbol inside the source file, `None` for file-level edges.
    pub src_symbol: Option<String>,
    pub dst_file_path: String,
    pub dst_symbol: Option<String>,
    /// Extractor-defined payload, opaque to the core.
    pub meta: serde_json::Value,
}

/// Output of a parse: the analyzer-defined tree plus diagnostics.
///
/// The tree is deliberately opaque: the core stores it in the parse cache
/// and hands it back to the same analyzer, nothing more.
#[derive(Clone)]
pub struct ParsedSource {
    pub file_path: String,
    pub tree: Arc<dyn Any + Send + Sync>,
    pub errors: Vec<String>,
    pub source_text: Arc<str>,
}

impl fmt::Debug for ParsedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedSource")
            .field("file_path", &self.file_path)
            .field("errors", &self.errors)
            .field("source_len", &self.source_text.len())
            .finish()
    }
}

/// Language tooling the coordinator drives for every indexed file.
///
/// `parse` must be pure and synchronous; it is called inside the full-index
/// transaction.
pub trait SourceAnalyzer: Send + Sync {
    fn parse(&self, file_path: &str, source: &str) -> Result<ParsedSource>;
    fn extract_symbols(&self, parsed: &ParsedSource) -> Vec<ExtractedSymbol>;
    fn extract_relations(&self, parsed: &ParsedSource) -> Vec<CodeRelation>;
}

/// A `(dir, name)` pair; the nearest ancestor boundary of a file decides
/// which project owns it. `dir` is workspace-relative with forward slashes,
/// empty for the root boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectBoundary {
    pub dir: String,
    pub name: String,
}

/// Workspace structure: project discovery and the path-alias table.
#[async_trait]
pub trait WorkspaceLayout: Send + Sync {
    async fn discover_projects(&self, workspace_root: &Path) -> Result<Vec<ProjectBoundary>>;

    /// Resolves the owning project of a workspace-relative file path.
    fn resolve_project(&self, rel_path: &str, boundaries: &[ProjectBoundary]) -> String;

    /// Loads the alias table, `None` when the workspace has no alias config.
    /// The value is opaque to the core.
    async fn load_alias_table(&self, workspace_root: &Path) -> Result<Option<serde_json::Value>>;
}

/// The dependency bundle injected into the coordinator and facade.
#[derive(Clone)]
pub struct Collaborators {
    pub analyzer: Arc<dyn SourceAnalyzer>,
    pub layout: Arc<dyn WorkspaceLayout>,
}

/// Builds the stable signature string for functions and methods.
pub fn function_signature(param_count: usize, is_async: bool) -> String {
    format!("params:{}|async:{}", param_count, if is_async { 1 } else { 0 })
}

/// 64-bit fingerprint correlating a symbol across files: hash of
/// `name|kind|signature`, with a missing signature contributing the empty
/// string.
pub fn symbol_fingerprint(name: &str, kind: SymbolKind, signature: Option<&str>) -> String {
    hash_string(&format!(
        "{}|{}|{}",
        name,
        kind.as_str(),
        signature.unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        for kind in [
            SymbolKind::Function,
            SymbolKind::Method,
            SymbolKind::Class,
            SymbolKind::Variable,
            SymbolKind::Type,
            SymbolKind::Interface,
            SymbolKind::Enum,
            SymbolKind::Property,
        ] {
            assert_eq!(SymbolKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SymbolKind::parse("module"), None);
    }

    #[test]
    fn relation_kind_round_trips() {
        for kind in [
            RelationKind::Imports,
            RelationKind::Calls,
            RelationKind::Extends,
            RelationKind::Implements,
        ] {
            assert_eq!(RelationKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn signature_format() {
        assert_eq!(function_signature(2, false), "params:2|async:0");
        assert_eq!(function_signature(0, true), "params:0|async:1");
    }

    #[test]
    fn fingerprint_ignores_signature_presence_consistently() {
        let with_sig = symbol_fingerprint("f", SymbolKind::Function, Some("params:1|async:0"));
        let without = symbol_fingerprint("f", SymbolKind::Function, None);
        assert_ne!(with_sig, without);
        assert_eq!(
            without,
            symbol_fingerprint("f", SymbolKind::Function, Some(""))
        );
    }
}
