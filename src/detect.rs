//! Disk-vs-store change detection.
//!
//! Walks the workspace, compares what is on disk against the persisted file
//! records, and classifies every candidate into changed / unchanged /
//! deleted. Changed entries carry an empty content-hash placeholder; the
//! coordinator fills it when it actually reads the file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use ignore::WalkBuilder;
use tracing::debug;

use crate::config::LedgerOptions;
use crate::error::{LedgerError, Result};
use crate::paths;
use crate::repo::FileRecord;
use crate::watcher::build_ignore_matcher;

/// A file observed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub mtime_ms: i64,
    pub size: i64,
    /// Empty until the coordinator reads the file.
    pub content_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub changed: Vec<FileEntry>,
    pub unchanged: Vec<FileEntry>,
    pub deleted: Vec<String>,
}

#[derive(Clone)]
pub struct ChangeDetector {
    options: Arc<LedgerOptions>,
}

impl ChangeDetector {
    pub fn new(options: Arc<LedgerOptions>) -> Self {
        Self { options }
    }

    /// Diffs the disk against `known` (file records aggregated across all
    /// projects, keyed by workspace-relative path).
    pub async fn detect(&self, known: &HashMap<String, FileRecord>) -> Result<ChangeSet> {
        let disk = self.scan().await?;

        let mut set = ChangeSet::default();
        let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();

        for entry in &disk {
            seen.insert(entry.path.as_str());
            match known.get(&entry.path) {
                Some(record) if record.mtime_ms == entry.mtime_ms && record.size == entry.size => {
                    set.unchanged.push(FileEntry {
                        content_hash: record.content_hash.clone(),
                        ..entry.clone()
                    });
                }
                _ => set.changed.push(entry.clone()),
            }
        }

        for path in known.keys() {
            if !seen.contains(path.as_str()) {
                set.deleted.push(path.clone());
            }
        }
        set.deleted.sort();

        debug!(
            changed = set.changed.len(),
            unchanged = set.unchanged.len(),
            deleted = set.deleted.len(),
            "change detection complete"
        );
        Ok(set)
    }

    /// Everything indexable currently on disk, as change candidates. Used by
    /// the full rebuild.
    pub async fn scan_all(&self) -> Result<Vec<FileEntry>> {
        self.scan().await
    }

    async fn scan(&self) -> Result<Vec<FileEntry>> {
        let options = self.options.clone();
        tokio::task::spawn_blocking(move || scan_disk(&options))
            .await
            .map_err(|e| LedgerError::Coordinator(format!("scan task failed: {e}")))?
    }
}

fn scan_disk(options: &LedgerOptions) -> Result<Vec<FileEntry>> {
    let root = &options.workspace_root;
    let ignore = build_ignore_matcher(root, &options.ignore_globs)?;

    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(true)
        .ignore(true)
        .build();

    let mut entries = Vec::new();
    for entry in walker.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let Some(rel) = paths::to_workspace_relative(root, entry.path()) else {
            continue;
        };
        if !options.has_indexable_extension(&rel) {
            continue;
        }
        if ignore.matched(&rel, false).is_ignore() {
            continue;
        }
        if let Some(file) = stat_entry(entry.path(), rel) {
            entries.push(file);
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn stat_entry(path: &Path, rel: String) -> Option<FileEntry> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Some(FileEntry {
        path: rel,
        mtime_ms,
        size: meta.len() as i64,
        content_hash: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace(files: &[(&str, &str)]) -> (TempDir, ChangeDetector) {
        let dir = tempfile::tempdir().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let options = Arc::new(LedgerOptions::new(dir.path()));
        (dir, ChangeDetector::new(options))
    }

    fn record(path: &str, mtime_ms: i64, size: i64) -> FileRecord {
        FileRecord {
            project: "app".into(),
            path: path.into(),
            mtime_ms,
            size,
            content_hash: "stored-hash".into(),
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn new_files_are_changed() {
        let (_dir, detector) = workspace(&[("src/a.ts", "export const a = 1;")]);
        let set = detector.detect(&HashMap::new()).await.unwrap();

        assert_eq!(set.changed.len(), 1);
        assert_eq!(set.changed[0].path, "src/a.ts");
        assert!(set.changed[0].content_hash.is_empty());
        assert!(set.unchanged.is_empty());
        assert!(set.deleted.is_empty());
    }

    #[tokio::test]
    async fn matching_mtime_and_size_is_unchanged() {
        let (dir, detector) = workspace(&[("src/a.ts", "export const a = 1;")]);
        let meta = std::fs::metadata(dir.path().join("src/a.ts")).unwrap();
        let mtime_ms = meta
            .modified()
            .unwrap()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;

        let mut known = HashMap::new();
        known.insert(
            "src/a.ts".to_string(),
            record("src/a.ts", mtime_ms, meta.len() as i64),
        );

        let set = detector.detect(&known).await.unwrap();
        assert!(set.changed.is_empty());
        assert_eq!(set.unchanged.len(), 1);
        assert_eq!(set.unchanged[0].content_hash, "stored-hash");
    }

    #[tokio::test]
    async fn missing_files_are_deleted() {
        let (_dir, detector) = workspace(&[("src/a.ts", "x")]);
        let mut known = HashMap::new();
        known.insert("src/gone.ts".to_string(), record("src/gone.ts", 1, 1));

        let set = detector.detect(&known).await.unwrap();
        assert_eq!(set.deleted, vec!["src/gone.ts".to_string()]);
    }

    #[tokio::test]
    async fn non_source_and_ignored_files_are_invisible() {
        let (_dir, detector) = workspace(&[
            ("src/a.ts", "x"),
            ("README.md", "docs"),
            ("node_modules/pkg/index.ts", "dep"),
            ("types/env.d.ts", "decl"),
        ]);
        let set = detector.detect(&HashMap::new()).await.unwrap();
        let paths: Vec<_> = set.changed.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/a.ts"]);
    }
}
