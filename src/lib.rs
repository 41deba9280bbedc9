//! # code-ledger
//!
//! A code-intelligence infrastructure layer: watches a workspace, drives an
//! injected parser/extractor over changed files, and maintains a crash-safe
//! SQLite index of files, symbols, and inter-file relations, with full-text
//! symbol search and an import dependency graph on top.
//!
//! The crate is a foundation for higher-level tools, not an application.
//! Language analysis is deliberately external: callers supply a
//! [`analysis::SourceAnalyzer`] (and optionally a
//! [`analysis::WorkspaceLayout`]) through the [`analysis::Collaborators`]
//! bundle handed to [`facade::CodeLedger::open`].
//!
//! Exactly one process per workspace owns the file watcher, elected through
//! the database itself; other processes open as readers and promote
//! themselves if the owner dies.

pub mod analysis;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod detect;
pub mod error;
pub mod facade;
pub mod graph;
pub mod layout;
pub mod ownership;
pub mod paths;
pub mod repo;
pub mod search;
pub mod store;
pub mod watcher;

pub use analysis::{
    function_signature, symbol_fingerprint, CodeRelation, Collaborators, ExtractedSymbol,
    ParsedSource, Position, ProjectBoundary, RelationKind, SourceAnalyzer, Span, SymbolKind,
    WorkspaceLayout,
};
pub use config::LedgerOptions;
pub use coordinator::{IndexCoordinator, IndexResult, SubscriptionId};
pub use detect::{ChangeDetector, ChangeSet, FileEntry};
pub use error::{LedgerError, Result};
pub use facade::{default_collaborators, CodeLedger, SubscriptionToken};
pub use graph::DependencyGraph;
pub use layout::ManifestLayout;
pub use ownership::{OwnershipManager, WatcherRole};
pub use repo::{
    FileRecord, FileRepository, IndexStats, NewSymbol, RelationFilter, RelationRepository,
    RelationRow, SymbolFilter, SymbolRepository, SymbolRow,
};
pub use search::{RelationHit, RelationQuery, SymbolHit, SymbolQuery};
pub use store::Store;
pub use watcher::{FileWatcher, WatchEvent, WatchEventType};
