//! Workspace path normalization and content hashing.
//!
//! Every path persisted in the index is relative to the workspace root and
//! uses forward slashes, regardless of platform. Paths that escape the root
//! never enter the pipeline.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};

/// Computes a 64-bit hash of a string, rendered as 16 lowercase hex chars.
///
/// Used for file content hashes and symbol fingerprints. Stability matters
/// only within one index database, so the std hasher is sufficient.
pub fn hash_string(input: &str) -> String {
    let mut hasher = DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Converts an absolute path into a workspace-relative, forward-slash path.
///
/// Returns `None` when the path lies outside the workspace root.
pub fn to_workspace_relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                if !out.is_empty() {
                    out.push('/');
                }
                out.push_str(&part.to_string_lossy());
            }
            Component::CurDir => {}
            // Any parent traversal escapes the workspace.
            _ => return None,
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Joins a workspace-relative path back onto the root.
pub fn to_absolute(root: &Path, rel: &str) -> PathBuf {
    let mut abs = root.to_path_buf();
    for part in rel.split('/') {
        abs.push(part);
    }
    abs
}

/// True when a relative path stays inside the workspace.
pub fn is_within_workspace(rel: &str) -> bool {
    !rel.starts_with("..") && !Path::new(rel).is_absolute()
}

/// The final path component, e.g. `package.json` for `apps/web/package.json`.
pub fn base_name(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}

/// The lowercase extension without the dot, if any.
pub fn extension(rel: &str) -> Option<String> {
    let name = base_name(rel);
    let dot = name.rfind('.')?;
    if dot == 0 || dot + 1 == name.len() {
        return None;
    }
    Some(name[dot + 1..].to_ascii_lowercase())
}
