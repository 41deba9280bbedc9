//! File-system watching.
//!
//! Bridges notify's synchronous callback into the async world: the callback
//! normalizes and filters each raw event, then forwards typed
//! [`WatchEvent`]s over a tokio channel. The coordinator owns debouncing;
//! this layer only decides what is worth delivering.

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::{LedgerOptions, FIXED_IGNORES};
use crate::error::Result;
use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventType {
    Create,
    Change,
    Delete,
}

impl WatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchEventType::Create => "create",
            WatchEventType::Change => "change",
            WatchEventType::Delete => "delete",
        }
    }
}

/// A normalized watcher event: workspace-relative forward-slash path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub file_path: String,
}

impl WatchEvent {
    pub fn new(event_type: WatchEventType, file_path: impl Into<String>) -> Self {
        Self {
            event_type,
            file_path: file_path.into(),
        }
    }
}

/// OS subscription under the workspace root. Dropping (or `close`) stops
/// delivery; both are idempotent.
pub struct FileWatcher {
    watcher: Option<RecommendedWatcher>,
    root: PathBuf,
}

impl FileWatcher {
    /// Starts watching and forwards filtered events into `events_tx`.
    ///
    /// The notify callback runs on the watcher's own thread and uses
    /// `blocking_send`; if the channel is closed the event is dropped.
    pub fn start(options: &LedgerOptions, events_tx: mpsc::Sender<WatchEvent>) -> Result<Self> {
        let filter = EventFilter::new(options)?;
        let root = options.workspace_root.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for mapped in filter.map_event(&event) {
                        trace!(event = ?mapped, "watch event");
                        if events_tx.blocking_send(mapped).is_err() {
                            debug!("watch channel closed, dropping event");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "watcher backend error"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        info!(root = %root.display(), "file watcher started");
        Ok(Self {
            watcher: Some(watcher),
            root,
        })
    }

    /// Stops the subscription. Safe to call more than once.
    pub fn close(&mut self) {
        if self.watcher.take().is_some() {
            info!(root = %self.root.display(), "file watcher stopped");
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Filter pipeline applied to every raw event path, in order: workspace
/// containment, ignore patterns, extension/manifest eligibility.
struct EventFilter {
    root: PathBuf,
    options: LedgerOptions,
    ignore: Gitignore,
}

impl EventFilter {
    fn new(options: &LedgerOptions) -> Result<Self> {
        Ok(Self {
            root: options.workspace_root.clone(),
            options: options.clone(),
            ignore: build_ignore_matcher(&options.workspace_root, &options.ignore_globs)?,
        })
    }

    fn map_event(&self, event: &Event) -> Vec<WatchEvent> {
        let Some(event_type) = map_event_kind(&event.kind) else {
            return Vec::new();
        };
        event
            .paths
            .iter()
            .filter_map(|path| {
                let rel = self.accept(path)?;
                Some(WatchEvent::new(event_type, rel))
            })
            .collect()
    }

    /// Returns the workspace-relative path when the event should be
    /// delivered.
    fn accept(&self, path: &Path) -> Option<String> {
        let rel = paths::to_workspace_relative(&self.root, path)?;
        if !paths::is_within_workspace(&rel) {
            return None;
        }
        if self.ignore.matched(&rel, false).is_ignore() {
            return None;
        }
        if !self.options.is_indexable(&rel) {
            return None;
        }
        Some(rel)
    }
}

fn map_event_kind(kind: &EventKind) -> Option<WatchEventType> {
    match kind {
        EventKind::Create(_) => Some(WatchEventType::Create),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(WatchEventType::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(WatchEventType::Create),
        EventKind::Modify(_) => Some(WatchEventType::Change),
        EventKind::Remove(_) => Some(WatchEventType::Delete),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

/// Fixed ignore patterns merged with the caller's, compiled once.
pub(crate) fn build_ignore_matcher(root: &Path, user_globs: &[String]) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in FIXED_IGNORES {
        // Static patterns are known-valid.
        let _ = builder.add_line(None, pattern);
    }
    for pattern in user_globs {
        if let Err(e) = builder.add_line(None, pattern) {
            warn!(pattern, error = %e, "skipping invalid ignore pattern");
        }
    }
    builder
        .build()
        .map_err(|e| crate::error::LedgerError::Lifecycle(format!("ignore patterns: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> EventFilter {
        let mut options = LedgerOptions::new("/ws");
        options.ignore_globs = vec!["generated/".to_string()];
        EventFilter::new(&options).unwrap()
    }

    #[test]
    fn accepts_source_files_under_root() {
        let f = filter();
        assert_eq!(
            f.accept(Path::new("/ws/src/app.ts")).as_deref(),
            Some("src/app.ts")
        );
    }

    #[test]
    fn drops_paths_outside_workspace() {
        let f = filter();
        assert_eq!(f.accept(Path::new("/elsewhere/app.ts")), None);
    }

    #[test]
    fn drops_unknown_extensions_but_keeps_manifests() {
        let f = filter();
        assert_eq!(f.accept(Path::new("/ws/README.md")), None);
        assert_eq!(
            f.accept(Path::new("/ws/apps/web/package.json")).as_deref(),
            Some("apps/web/package.json")
        );
        assert_eq!(
            f.accept(Path::new("/ws/tsconfig.json")).as_deref(),
            Some("tsconfig.json")
        );
    }

    #[test]
    fn drops_declaration_files() {
        let f = filter();
        assert_eq!(f.accept(Path::new("/ws/types/env.d.ts")), None);
    }

    #[test]
    fn fixed_and_user_ignores_apply() {
        let f = filter();
        assert_eq!(f.accept(Path::new("/ws/node_modules/pkg/index.ts")), None);
        assert_eq!(f.accept(Path::new("/ws/generated/api.ts")), None);
    }

    #[test]
    fn event_kind_mapping() {
        use notify::event::{CreateKind, DataChange, RemoveKind};

        assert_eq!(
            map_event_kind(&EventKind::Create(CreateKind::File)),
            Some(WatchEventType::Create)
        );
        assert_eq!(
            map_event_kind(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(WatchEventType::Change)
        );
        assert_eq!(
            map_event_kind(&EventKind::Remove(RemoveKind::File)),
            Some(WatchEventType::Delete)
        );
        assert_eq!(
            map_event_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            Some(WatchEventType::Delete)
        );
        assert_eq!(
            map_event_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            Some(WatchEventType::Create)
        );
        assert_eq!(map_event_kind(&EventKind::Any), None);
    }

    #[test]
    fn map_event_pairs_kind_with_each_path() {
        let f = filter();
        let event = Event::new(EventKind::Create(notify::event::CreateKind::File))
            .add_path(PathBuf::from("/ws/src/a.ts"))
            .add_path(PathBuf::from("/ws/skip.md"));
        let mapped = f.map_event(&event);
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].file_path, "src/a.ts");
        assert_eq!(mapped[0].event_type, WatchEventType::Create);
    }
}
