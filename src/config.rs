//! Open-time configuration for a ledger instance.

use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::paths;

/// File name of the index database inside the app directory.
pub const DB_FILE_NAME: &str = "code-ledger.db";

/// Source extensions indexed when the caller does not supply a set.
static DEFAULT_EXTENSIONS: Lazy<Vec<String>> = Lazy::new(|| {
    ["ts", "tsx", "mts", "cts", "js", "jsx", "mjs", "cjs"]
        .iter()
        .map(|s| s.to_string())
        .collect()
});

/// Ignore patterns applied on top of whatever the caller provides.
pub const FIXED_IGNORES: &[&str] = &[
    ".git/",
    "node_modules/",
    "dist/",
    "build/",
    "out/",
    "coverage/",
    ".code-ledger/",
];

/// Options accepted by [`crate::facade::CodeLedger::open`].
///
/// Timing knobs default to the production values; integration tests compress
/// them to keep wall-clock time sane.
#[derive(Debug, Clone)]
pub struct LedgerOptions {
    /// Absolute workspace root. Everything indexed lives underneath it.
    pub workspace_root: PathBuf,
    /// Extensions (no dot, lowercase) eligible for indexing.
    pub extensions: Vec<String>,
    /// User ignore globs, merged with [`FIXED_IGNORES`].
    pub ignore_globs: Vec<String>,
    /// Capacity of the in-process parse cache.
    pub parse_cache_capacity: usize,
    /// Directory (under the workspace root) holding the database.
    pub app_dir: String,
    /// Project-manifest base name; events on it bypass the extension filter
    /// and schedule a boundary rediscovery.
    pub manifest_name: String,
    /// Path-alias config base name; events on it reload aliases and force a
    /// full index.
    pub alias_config_name: String,
    /// Declaration-only suffixes that never get indexed.
    pub declaration_suffixes: Vec<String>,
    /// Watcher event coalescing window.
    pub debounce: Duration,
    /// Owner heartbeat period.
    pub heartbeat_interval: Duration,
    /// Reader re-election probe period.
    pub healthcheck_interval: Duration,
    /// Age beyond which a heartbeat no longer protects the owner row.
    pub ownership_staleness: Duration,
}

impl LedgerOptions {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            extensions: DEFAULT_EXTENSIONS.clone(),
            ignore_globs: Vec::new(),
            parse_cache_capacity: 500,
            app_dir: ".code-ledger".to_string(),
            manifest_name: "package.json".to_string(),
            alias_config_name: "tsconfig.json".to_string(),
            declaration_suffixes: vec![".d.ts".to_string()],
            debounce: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            healthcheck_interval: Duration::from_secs(60),
            ownership_staleness: Duration::from_secs(90),
        }
    }

    /// Location of the index database for this workspace.
    pub fn db_path(&self) -> PathBuf {
        self.workspace_root.join(&self.app_dir).join(DB_FILE_NAME)
    }

    /// Whether a workspace-relative path is eligible for indexing: allowed
    /// extension or a manifest/alias-config file, and not declaration-only.
    pub fn is_indexable(&self, rel_path: &str) -> bool {
        if self.has_indexable_extension(rel_path) {
            return true;
        }
        let name = paths::base_name(rel_path);
        (name == self.manifest_name || name == self.alias_config_name)
            && !self.is_declaration(rel_path)
    }

    /// Extension-only eligibility, without the manifest/alias-config bypass.
    /// Disk scans use this; manifests only matter as watcher events.
    pub fn has_indexable_extension(&self, rel_path: &str) -> bool {
        if self.is_declaration(rel_path) {
            return false;
        }
        match paths::extension(rel_path) {
            Some(ext) => self.extensions.iter().any(|e| e == &ext),
            None => false,
        }
    }

    pub fn is_manifest(&self, rel_path: &str) -> bool {
        paths::base_name(rel_path) == self.manifest_name
    }

    pub fn is_alias_config(&self, rel_path: &str) -> bool {
        paths::base_name(rel_path) == self.alias_config_name
    }

    fn is_declaration(&self, rel_path: &str) -> bool {
        self.declaration_suffixes
            .iter()
            .any(|suffix| rel_path.ends_with(suffix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_extension_filter() {
        let options = LedgerOptions::new("/ws");
        assert!(options.is_indexable("src/app.ts"));
        assert!(options.is_indexable("src/Component.tsx"));
        assert!(!options.is_indexable("readme.md"));
        assert!(!options.is_indexable("LICENSE"));
    }

    #[test]
    fn declarations_are_excluded() {
        let options = LedgerOptions::new("/ws");
        assert!(!options.is_indexable("types/global.d.ts"));
    }

    #[test]
    fn manifests_bypass_extension_filter() {
        let mut options = LedgerOptions::new("/ws");
        options.extensions = vec!["ts".into()];
        assert!(options.is_indexable("apps/web/package.json"));
        assert!(options.is_indexable("tsconfig.json"));
        assert!(options.is_manifest("apps/web/package.json"));
        assert!(options.is_alias_config("tsconfig.json"));
    }

    #[test]
    fn db_path_lives_under_app_dir() {
        let options = LedgerOptions::new("/ws");
        assert_eq!(
            options.db_path(),
            PathBuf::from("/ws/.code-ledger/code-ledger.db")
        );
    }
}
