//! Default workspace layout: manifest-driven project boundaries.
//!
//! A project boundary is a directory containing a manifest file. The file's
//! `name` field names the project; the nearest ancestor boundary of a path
//! decides which project owns it. The alias table comes from the root alias
//! config's `compilerOptions.paths`, passed through opaquely.
//!
//! Library users with different conventions substitute their own
//! [`WorkspaceLayout`].

use std::path::Path;

use async_trait::async_trait;
use ignore::WalkBuilder;
use tracing::{debug, warn};

use crate::analysis::{ProjectBoundary, WorkspaceLayout};
use crate::config::LedgerOptions;
use crate::error::{LedgerError, Result};
use crate::paths;
use crate::watcher::build_ignore_matcher;

/// Fallback project name when no boundary claims a file.
pub const DEFAULT_PROJECT: &str = "workspace";

#[derive(Debug, Clone)]
pub struct ManifestLayout {
    manifest_name: String,
    alias_config_name: String,
    ignore_globs: Vec<String>,
}

impl ManifestLayout {
    pub fn new(options: &LedgerOptions) -> Self {
        Self {
            manifest_name: options.manifest_name.clone(),
            alias_config_name: options.alias_config_name.clone(),
            ignore_globs: options.ignore_globs.clone(),
        }
    }
}

#[async_trait]
impl WorkspaceLayout for ManifestLayout {
    async fn discover_projects(&self, workspace_root: &Path) -> Result<Vec<ProjectBoundary>> {
        let root = workspace_root.to_path_buf();
        let manifest_name = self.manifest_name.clone();
        let ignore_globs = self.ignore_globs.clone();

        let mut boundaries = tokio::task::spawn_blocking(move || {
            scan_boundaries(&root, &manifest_name, &ignore_globs)
        })
        .await
        .map_err(|e| LedgerError::Lifecycle(format!("boundary discovery failed: {e}")))??;

        if !boundaries.iter().any(|b| b.dir.is_empty()) {
            boundaries.insert(
                0,
                ProjectBoundary {
                    dir: String::new(),
                    name: root_project_name(workspace_root),
                },
            );
        }
        debug!(count = boundaries.len(), "project boundaries discovered");
        Ok(boundaries)
    }

    fn resolve_project(&self, rel_path: &str, boundaries: &[ProjectBoundary]) -> String {
        let mut best: Option<&ProjectBoundary> = None;
        for boundary in boundaries {
            let contains = boundary.dir.is_empty()
                || rel_path.starts_with(&format!("{}/", boundary.dir));
            if contains {
                let better = match best {
                    Some(current) => boundary.dir.len() > current.dir.len(),
                    None => true,
                };
                if better {
                    best = Some(boundary);
                }
            }
        }
        best.map(|b| b.name.clone())
            .unwrap_or_else(|| DEFAULT_PROJECT.to_string())
    }

    async fn load_alias_table(&self, workspace_root: &Path) -> Result<Option<serde_json::Value>> {
        let config_path = workspace_root.join(&self.alias_config_name);
        let text = match tokio::fs::read_to_string(&config_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Alias configs in the wild carry comments and trailing commas; a
        // config we cannot parse is treated as absent, not fatal.
        let parsed: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "alias config unparseable, ignoring");
                return Ok(None);
            }
        };
        Ok(parsed
            .get("compilerOptions")
            .and_then(|opts| opts.get("paths"))
            .cloned())
    }
}

fn scan_boundaries(
    root: &Path,
    manifest_name: &str,
    ignore_globs: &[String],
) -> Result<Vec<ProjectBoundary>> {
    let ignore = build_ignore_matcher(root, ignore_globs)?;
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .ignore(true)
        .build();

    let mut boundaries = Vec::new();
    for entry in walker.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let Some(rel) = paths::to_workspace_relative(root, entry.path()) else {
            continue;
        };
        if paths::base_name(&rel) != manifest_name || ignore.matched(&rel, false).is_ignore() {
            continue;
        }
        let dir = rel
            .rsplit_once('/')
            .map(|(d, _)| d.to_string())
            .unwrap_or_default();
        let name = manifest_project_name(entry.path())
            .unwrap_or_else(|| boundary_dir_name(root, &dir));
        boundaries.push(ProjectBoundary { dir, name });
    }

    boundaries.sort_by(|a, b| a.dir.cmp(&b.dir));
    Ok(boundaries)
}

fn manifest_project_name(manifest_path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(manifest_path).ok()?;
    let parsed: serde_json::Value = serde_json::from_str(&text).ok()?;
    parsed
        .get("name")
        .and_then(|n| n.as_str())
        .map(String::from)
}

fn boundary_dir_name(root: &Path, dir: &str) -> String {
    if dir.is_empty() {
        root_project_name(root)
    } else {
        paths::base_name(dir).to_string()
    }
}

fn root_project_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_PROJECT.to_string())
}
