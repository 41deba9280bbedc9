//! Query CLI over an existing index database.
//!
//! Read-only by design: indexing needs the embedding application's analyzer,
//! so the write path is only reachable through the library facade. These
//! commands open the database, verify schema compatibility, and query.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::analysis::{RelationKind, SymbolKind};
use crate::config::LedgerOptions;
use crate::error::{LedgerError, Result};
use crate::graph::DependencyGraph;
use crate::ownership::is_process_alive;
use crate::repo::{FileRepository, RelationRepository, SymbolRepository};
use crate::search::{self, RelationQuery, SymbolQuery};
use crate::store::{unix_millis, Store};

#[derive(Parser)]
#[command(name = "code-ledger", about = "Query a code-ledger index database", version)]
pub struct Cli {
    /// Workspace root containing the index
    #[arg(short = 'C', long, default_value = ".", global = true)]
    pub workspace: PathBuf,

    /// Explicit database path (overrides --workspace)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Index statistics
    Stats {
        #[arg(long)]
        project: Option<String>,
    },

    /// Search symbols by free text and filters
    Symbols {
        /// Free-text query (prefix-matched per token)
        query: Option<String>,

        #[arg(long)]
        kind: Option<String>,

        /// Exact file path filter
        #[arg(long)]
        file: Option<String>,

        /// Only exported symbols
        #[arg(long)]
        exported: bool,

        #[arg(long)]
        project: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Search relations by endpoints and type
    Relations {
        #[arg(long)]
        src: Option<String>,

        #[arg(long)]
        dst: Option<String>,

        #[arg(long = "type")]
        relation_type: Option<String>,

        #[arg(long)]
        project: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Direct imports of a file
    Deps {
        path: String,
        #[arg(long)]
        project: Option<String>,
    },

    /// Direct importers of a file
    Dependents {
        path: String,
        #[arg(long)]
        project: Option<String>,
    },

    /// Transitive dependents of one or more files
    Affected {
        paths: Vec<String>,
        #[arg(long)]
        project: Option<String>,
    },

    /// Check the import graph for cycles
    Cycles {
        #[arg(long)]
        project: Option<String>,
    },

    /// Show the current watcher owner
    Owner,

    /// List database tables
    Tables,
}

pub fn run(cli: Cli) -> Result<()> {
    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => LedgerOptions::new(std::fs::canonicalize(&cli.workspace)?).db_path(),
    };
    let store = Arc::new(Store::open_existing(&db_path)?);
    let files = FileRepository::new(store.clone());
    let symbols = SymbolRepository::new(store.clone());
    let relations = RelationRepository::new(store.clone());

    match cli.command {
        Commands::Stats { project } => {
            let stats = symbols.get_stats(project.as_deref())?;
            println!("files:   {}", stats.file_count);
            println!("symbols: {}", stats.symbol_count);
            if project.is_none() {
                let projects = files.list_projects()?;
                println!("projects: {}", projects.join(", "));
            }
        }

        Commands::Symbols {
            query,
            kind,
            file,
            exported,
            project,
            limit,
            json,
        } => {
            let kind = parse_symbol_kind(kind.as_deref())?;
            let hits = search::search_symbols(
                &symbols,
                &SymbolQuery {
                    text: query,
                    kind,
                    file_path: file,
                    is_exported: exported.then_some(true),
                    project,
                    limit: Some(limit),
                },
            )?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                for hit in &hits {
                    println!(
                        "{:<10} {:<30} {}:{}",
                        hit.kind,
                        hit.name,
                        hit.file_path,
                        hit.span.start.line + 1
                    );
                }
                println!("{} result(s)", hits.len());
            }
        }

        Commands::Relations {
            src,
            dst,
            relation_type,
            project,
            limit,
            json,
        } => {
            let kind = parse_relation_kind(relation_type.as_deref())?;
            let hits = search::search_relations(
                &relations,
                &RelationQuery {
                    src_file_path: src,
                    dst_file_path: dst,
                    kind,
                    project,
                    limit: Some(limit),
                    ..RelationQuery::default()
                },
            )?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                for hit in &hits {
                    let src_symbol = hit.src_symbol_name.as_deref().unwrap_or("<file>");
                    let dst_symbol = hit.dst_symbol_name.as_deref().unwrap_or("<file>");
                    println!(
                        "{:<10} {}#{} -> {}#{}",
                        hit.kind, hit.src_file_path, src_symbol, hit.dst_file_path, dst_symbol
                    );
                }
                println!("{} result(s)", hits.len());
            }
        }

        Commands::Deps { path, project } => {
            let project = resolve_project(&files, &path, project)?;
            for row in relations.get_outgoing(&project, &path, None)? {
                if row.kind == RelationKind::Imports {
                    println!("{}", row.dst_file_path);
                }
            }
        }

        Commands::Dependents { path, project } => {
            let project = resolve_project(&files, &path, project)?;
            for row in relations.get_incoming(&project, &path)? {
                if row.kind == RelationKind::Imports {
                    println!("{}", row.src_file_path);
                }
            }
        }

        Commands::Affected { paths, project } => {
            if paths.is_empty() {
                return Err(LedgerError::Usage("affected requires at least one path".into()));
            }
            let project = resolve_project(&files, &paths[0], project)?;
            let graph = DependencyGraph::build(&relations, &project)?;
            for path in graph.affected_by_change(&paths) {
                println!("{path}");
            }
        }

        Commands::Cycles { project } => {
            let projects = match project {
                Some(p) => vec![p],
                None => files.list_projects()?,
            };
            let mut found = false;
            for project in projects {
                let graph = DependencyGraph::build(&relations, &project)?;
                if graph.has_cycle() {
                    println!("cycle detected in project '{project}'");
                    found = true;
                }
            }
            if !found {
                println!("no cycles");
            }
        }

        Commands::Owner => {
            let ownership = crate::ownership::OwnershipManager::new(
                store.clone(),
                std::time::Duration::from_secs(90),
            );
            match ownership.current_owner()? {
                Some((pid, started_at, heartbeat_at)) => {
                    let alive = is_process_alive(pid);
                    let age_s = (unix_millis() - heartbeat_at) / 1000;
                    println!("owner pid: {pid} ({})", if alive { "alive" } else { "dead" });
                    println!("started:   {started_at}");
                    println!("heartbeat: {heartbeat_at} ({age_s}s ago)");
                }
                None => println!("no watcher owner registered"),
            }
        }

        Commands::Tables => {
            for table in store.list_tables()? {
                println!("{table}");
            }
        }
    }

    Ok(())
}

fn resolve_project(
    files: &FileRepository,
    path: &str,
    project: Option<String>,
) -> Result<String> {
    if let Some(project) = project {
        return Ok(project);
    }
    let mut projects = files.projects_of_path(path)?;
    match projects.len() {
        0 => Err(LedgerError::Usage(format!("{path} is not in the index"))),
        1 => Ok(projects.remove(0)),
        _ => Err(LedgerError::Usage(format!(
            "{path} exists in multiple projects ({}); pass --project",
            projects.join(", ")
        ))),
    }
}

fn parse_symbol_kind(value: Option<&str>) -> Result<Option<SymbolKind>> {
    match value {
        None => Ok(None),
        Some(raw) => SymbolKind::parse(raw).map(Some).ok_or_else(|| {
            LedgerError::Usage(format!("unknown symbol kind '{raw}'"))
        }),
    }
}

fn parse_relation_kind(value: Option<&str>) -> Result<Option<RelationKind>> {
    match value {
        None => Ok(None),
        Some(raw) => RelationKind::parse(raw).map(Some).ok_or_else(|| {
            LedgerError::Usage(format!("unknown relation type '{raw}'"))
        }),
    }
}
