//! The index coordinator: a single-writer, debounced pipeline turning
//! file-change events into atomic index updates.
//!
//! One boolean lock gates every run. Watcher events land in a buffer; a
//! 100 ms debounce timer drains the buffer into an incremental run. Requests
//! arriving while a run is in flight join that run's completion handle;
//! full requests additionally queue a follow-up rebuild. Whatever happens
//! inside a run, the finalizer releases the lock and drains anything that
//! accumulated meanwhile.
//!
//! Deleted files are snapshotted before removal so symbols that reappear
//! elsewhere under the same fingerprint get their incoming relations
//! retargeted instead of lost.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rusqlite::Connection;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analysis::{cache::ParseCache, symbol_fingerprint, Collaborators, ProjectBoundary};
use crate::config::LedgerOptions;
use crate::detect::{ChangeDetector, FileEntry};
use crate::error::{LedgerError, Result};
use crate::paths::{self, hash_string};
use crate::repo::{
    self, FileRecord, FileRepository, NewSymbol, RelationRepository, SymbolRepository, SymbolRow,
};
use crate::store::Store;
use crate::watcher::{WatchEvent, WatchEventType};

/// Summary of one indexing run.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct IndexResult {
    pub indexed_files: usize,
    pub removed_files: usize,
    pub total_symbols: usize,
    pub total_relations: usize,
    pub duration_ms: u64,
    pub changed_files: Vec<String>,
    pub deleted_files: Vec<String>,
    pub failed_files: Vec<String>,
}

/// Removal token returned by [`IndexCoordinator::on_indexed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type RunOutcome = std::result::Result<IndexResult, Arc<LedgerError>>;
type RunHandle = watch::Receiver<Option<RunOutcome>>;
type SubscriberFn = Box<dyn Fn(&IndexResult) + Send + Sync>;

enum RunRequest {
    Full,
    Incremental(Option<Vec<WatchEvent>>),
}

enum AliasState {
    Loaded(Option<serde_json::Value>),
    Loading(JoinHandle<Result<Option<serde_json::Value>>>),
}

struct State {
    indexing: bool,
    pending_events: Vec<WatchEvent>,
    pending_full: bool,
    debounce: Option<JoinHandle<()>>,
    current_run: Option<RunHandle>,
    boundaries: Vec<ProjectBoundary>,
    boundaries_refresh: Option<JoinHandle<Result<Vec<ProjectBoundary>>>>,
    alias: AliasState,
}

#[derive(Clone)]
pub struct IndexCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    options: Arc<LedgerOptions>,
    store: Arc<Store>,
    files: FileRepository,
    symbols: SymbolRepository,
    relations: RelationRepository,
    detector: ChangeDetector,
    collab: Collaborators,
    cache: ParseCache,
    state: Mutex<State>,
    subscribers: Mutex<Vec<(u64, SubscriberFn)>>,
    next_subscriber: AtomicU64,
}

impl IndexCoordinator {
    pub fn new(
        store: Arc<Store>,
        options: Arc<LedgerOptions>,
        collab: Collaborators,
        boundaries: Vec<ProjectBoundary>,
        alias_table: Option<serde_json::Value>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                files: FileRepository::new(store.clone()),
                symbols: SymbolRepository::new(store.clone()),
                relations: RelationRepository::new(store.clone()),
                detector: ChangeDetector::new(options.clone()),
                cache: ParseCache::new(options.parse_cache_capacity),
                store,
                options,
                collab,
                state: Mutex::new(State {
                    indexing: false,
                    pending_events: Vec::new(),
                    pending_full: false,
                    debounce: None,
                    current_run: None,
                    boundaries,
                    boundaries_refresh: None,
                    alias: AliasState::Loaded(alias_table),
                }),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// Forces a from-scratch rebuild. Joins the in-flight run (and queues the
    /// rebuild behind it) when one is active.
    pub async fn full_index(&self) -> Result<IndexResult> {
        let handle = Inner::start_run(&self.inner, RunRequest::Full);
        wait_outcome(handle).await
    }

    /// Processes an explicit event list, or whatever the change detector
    /// reports when `events` is `None`.
    pub async fn incremental_index(&self, events: Option<Vec<WatchEvent>>) -> Result<IndexResult> {
        let handle = Inner::start_run(&self.inner, RunRequest::Incremental(events));
        wait_outcome(handle).await
    }

    /// Non-blocking intake for the watcher callback. Never starts indexing
    /// synchronously: it arms the debounce timer or appends to the buffer.
    ///
    /// Must be called from within the tokio runtime.
    pub fn handle_watcher_event(&self, event: WatchEvent) {
        let inner = &self.inner;

        if inner.options.is_alias_config(&event.file_path) {
            debug!(file = %event.file_path, "alias config changed, reloading aliases and rebuilding");
            let layout = inner.collab.layout.clone();
            let root = inner.options.workspace_root.clone();
            {
                let mut state = inner.state.lock().expect("coordinator state poisoned");
                state.alias = AliasState::Loading(tokio::spawn(async move {
                    layout.load_alias_table(&root).await
                }));
            }
            let _ = Inner::start_run(inner, RunRequest::Full);
            return;
        }

        if inner.options.is_manifest(&event.file_path) {
            debug!(file = %event.file_path, "manifest changed, scheduling boundary rediscovery");
            let layout = inner.collab.layout.clone();
            let root = inner.options.workspace_root.clone();
            let mut state = inner.state.lock().expect("coordinator state poisoned");
            // A newer manifest event supersedes any refresh still in flight;
            // only the latest result is consulted.
            state.boundaries_refresh = Some(tokio::spawn(async move {
                layout.discover_projects(&root).await
            }));
            // The event itself still joins the buffer below.
        }

        let mut state = inner.state.lock().expect("coordinator state poisoned");
        state.pending_events.push(event);
        if state.debounce.is_none() {
            let inner = inner.clone();
            let delay = inner.options.debounce;
            state.debounce = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                Inner::flush_debounce(&inner);
            }));
        }
    }

    /// Registers a completion callback; fires once per finished run, in
    /// registration order.
    pub fn on_indexed(
        &self,
        callback: impl Fn(&IndexResult) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .expect("subscriber set poisoned")
            .push((id, Box::new(callback)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, token: SubscriptionId) {
        self.inner
            .subscribers
            .lock()
            .expect("subscriber set poisoned")
            .retain(|(id, _)| *id != token.0);
    }

    /// Cancels the debounce timer and awaits any in-flight run.
    pub async fn shutdown(&self) {
        let (debounce, run) = {
            let mut state = self.inner.state.lock().expect("coordinator state poisoned");
            (state.debounce.take(), state.current_run.clone())
        };
        if let Some(timer) = debounce {
            timer.abort();
        }
        if let Some(handle) = run {
            let _ = wait_outcome(handle).await;
        }
        debug!("coordinator shut down");
    }

    /// Current project boundaries.
    pub fn boundaries(&self) -> Vec<ProjectBoundary> {
        self.inner
            .state
            .lock()
            .expect("coordinator state poisoned")
            .boundaries
            .clone()
    }

    /// The loaded alias table; `None` while a reload is still in flight.
    pub fn alias_table(&self) -> Option<serde_json::Value> {
        let state = self.inner.state.lock().expect("coordinator state poisoned");
        match &state.alias {
            AliasState::Loaded(value) => value.clone(),
            AliasState::Loading(_) => None,
        }
    }

    /// Whether a run currently holds the indexing lock.
    pub fn is_indexing(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("coordinator state poisoned")
            .indexing
    }
}

impl Inner {
    /// Gate for every run. When the lock is held, full requests set the
    /// follow-up flag, incremental events join the buffer, and the caller
    /// gets the in-flight run's handle.
    fn start_run(inner: &Arc<Inner>, request: RunRequest) -> RunHandle {
        let mut state = inner.state.lock().expect("coordinator state poisoned");
        if state.indexing {
            match request {
                RunRequest::Full => {
                    debug!("full index queued behind in-flight run");
                    state.pending_full = true;
                }
                RunRequest::Incremental(Some(events)) => {
                    state.pending_events.extend(events);
                }
                RunRequest::Incremental(None) => {}
            }
            return state
                .current_run
                .clone()
                .expect("indexing lock held without a current run");
        }
        Inner::begin_run(inner, &mut state, request)
    }

    fn begin_run(inner: &Arc<Inner>, state: &mut State, request: RunRequest) -> RunHandle {
        state.indexing = true;
        let (tx, rx) = watch::channel(None);
        state.current_run = Some(rx.clone());

        let task_inner = inner.clone();
        tokio::spawn(async move { task_inner.run_task(request, tx).await });
        rx
    }

    /// Debounce expiry: start a run from the buffered events if the lock is
    /// free; otherwise leave them for the finalizer drain.
    fn flush_debounce(inner: &Arc<Inner>) {
        let mut state = inner.state.lock().expect("coordinator state poisoned");
        state.debounce = None;
        if state.indexing || state.pending_events.is_empty() {
            return;
        }
        let events = dedup_events(std::mem::take(&mut state.pending_events));
        let _ = Inner::begin_run(inner, &mut state, RunRequest::Incremental(Some(events)));
    }

    async fn run_task(self: Arc<Self>, request: RunRequest, tx: watch::Sender<Option<RunOutcome>>) {
        let outcome = match request {
            RunRequest::Full => self.do_index(None, true).await,
            RunRequest::Incremental(events) => self.do_index(events, false).await,
        };

        match &outcome {
            Ok(result) => self.fanout(result),
            Err(e) => warn!(error = %e, "indexing run failed"),
        }

        // The finalizer: release the lock whatever happened, then drain.
        let follow_up = {
            let mut state = self.state.lock().expect("coordinator state poisoned");
            state.indexing = false;
            state.current_run = None;
            if std::mem::take(&mut state.pending_full) {
                Some(RunRequest::Full)
            } else if !state.pending_events.is_empty() {
                let events = dedup_events(std::mem::take(&mut state.pending_events));
                Some(RunRequest::Incremental(Some(events)))
            } else {
                None
            }
        };

        let _ = tx.send(Some(outcome.map_err(Arc::new)));

        if let Some(next) = follow_up {
            let _ = Inner::start_run(&self, next);
        }
    }

    /// One indexing run. `use_transaction` selects the full-rebuild path:
    /// pre-read everything, then a single synchronous transaction.
    async fn do_index(
        &self,
        events: Option<Vec<WatchEvent>>,
        use_transaction: bool,
    ) -> Result<IndexResult> {
        let started = Instant::now();

        // A manifest event may have scheduled a boundary refresh; consult it
        // before classifying anything.
        let refresh = {
            let mut state = self.state.lock().expect("coordinator state poisoned");
            state.boundaries_refresh.take()
        };
        if let Some(handle) = refresh {
            match handle.await {
                Ok(Ok(boundaries)) => {
                    let mut state = self.state.lock().expect("coordinator state poisoned");
                    state.boundaries = boundaries;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "boundary rediscovery failed, keeping previous boundaries")
                }
                Err(e) => warn!(error = %e, "boundary rediscovery task failed"),
            }
        }
        let boundaries = {
            self.state
                .lock()
                .expect("coordinator state poisoned")
                .boundaries
                .clone()
        };

        // Classify the changeset. Explicit events skip the change detector;
        // callers depend on that.
        let explicit = events.is_some();
        let (changed, deleted) = match events {
            Some(events) => classify_events(&events),
            None if use_transaction => (self.detector.scan_all().await?, Vec::new()),
            None => {
                let mut known = HashMap::new();
                for boundary in &boundaries {
                    known.extend(self.files.get_files_map(&boundary.name)?);
                }
                let set = self.detector.detect(&known).await?;
                (set.changed, set.deleted)
            }
        };
        debug!(
            changed = changed.len(),
            deleted = deleted.len(),
            explicit,
            full = use_transaction,
            "indexing run classified"
        );

        self.await_alias_table().await;

        // Move-detection snapshot, taken before anything is deleted.
        let mut snapshot: Vec<(String, String, Vec<SymbolRow>)> = Vec::new();
        for path in &deleted {
            let project = self.collab.layout.resolve_project(path, &boundaries);
            let symbols = self.symbols.get_file_symbols(&project, path)?;
            if !symbols.is_empty() {
                snapshot.push((project, path.clone(), symbols));
            }
        }

        let mut indexed = 0usize;
        let mut total_symbols = 0usize;
        let mut total_relations = 0usize;
        let mut failed: Vec<String> = Vec::new();

        if use_transaction {
            // Pre-read outside the transaction: the transaction body must
            // stay synchronous.
            let mut prepared = Vec::with_capacity(changed.len());
            for entry in &changed {
                match self.pre_read(entry).await {
                    Ok(file) => prepared.push(file),
                    Err(e) => {
                        warn!(file = %entry.path, error = %e, "pre-read failed");
                        failed.push(entry.path.clone());
                    }
                }
            }

            let projects: BTreeSet<String> =
                boundaries.iter().map(|b| b.name.clone()).collect();

            self.store.transaction(|tx| {
                let conn = tx.conn();
                for project in &projects {
                    repo::delete_project_files_in(conn, project)?;
                }
                for file in &prepared {
                    match self.index_prepared(conn, file, &boundaries) {
                        Ok((symbols, relations)) => {
                            indexed += 1;
                            total_symbols += symbols;
                            total_relations += relations;
                        }
                        Err(e) if e.is_file_scoped() => {
                            warn!(file = %file.path, error = %e, "file failed during rebuild");
                            failed.push(file.path.clone());
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            })?;
        } else {
            for path in &deleted {
                let project = self.collab.layout.resolve_project(path, &boundaries);
                self.files.delete_file(&project, path)?;
                self.cache.remove(path);
            }

            for entry in &changed {
                match self.index_file(entry, &boundaries).await {
                    Ok((symbols, relations)) => {
                        indexed += 1;
                        total_symbols += symbols;
                        total_relations += relations;
                    }
                    Err(e) => {
                        warn!(file = %entry.path, error = %e, "file failed during indexing");
                        failed.push(entry.path.clone());
                    }
                }
            }
        }

        self.retarget_moved_symbols(&snapshot)?;

        let result = IndexResult {
            indexed_files: indexed,
            removed_files: deleted.len(),
            total_symbols,
            total_relations,
            duration_ms: started.elapsed().as_millis() as u64,
            changed_files: changed.into_iter().map(|f| f.path).collect(),
            deleted_files: deleted,
            failed_files: failed,
        };
        info!(
            indexed = result.indexed_files,
            removed = result.removed_files,
            symbols = result.total_symbols,
            relations = result.total_relations,
            failed = result.failed_files.len(),
            duration_ms = result.duration_ms,
            "indexing run complete"
        );
        Ok(result)
    }

    /// The alias table may still be a pending load kicked off by an
    /// alias-config event; settle it before indexing.
    async fn await_alias_table(&self) {
        let pending = {
            let mut state = self.state.lock().expect("coordinator state poisoned");
            match std::mem::replace(&mut state.alias, AliasState::Loaded(None)) {
                AliasState::Loading(handle) => Some(handle),
                AliasState::Loaded(value) => {
                    state.alias = AliasState::Loaded(value);
                    None
                }
            }
        };
        if let Some(handle) = pending {
            let value = match handle.await {
                Ok(Ok(value)) => value,
                Ok(Err(e)) => {
                    warn!(error = %e, "alias reload failed");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "alias reload task failed");
                    None
                }
            };
            let mut state = self.state.lock().expect("coordinator state poisoned");
            state.alias = AliasState::Loaded(value);
        }
    }

    async fn pre_read(&self, entry: &FileEntry) -> Result<PreparedFile> {
        let abs = paths::to_absolute(&self.options.workspace_root, &entry.path);
        let text = tokio::fs::read_to_string(&abs).await?;
        let meta = tokio::fs::metadata(&abs).await?;
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(entry.mtime_ms);
        let hash = if entry.content_hash.is_empty() {
            hash_string(&text)
        } else {
            entry.content_hash.clone()
        };
        Ok(PreparedFile {
            path: entry.path.clone(),
            mtime_ms,
            size: meta.len() as i64,
            hash,
            text,
        })
    }

    /// Incremental per-file unit: read, then parse/extract/persist in its own
    /// transaction.
    async fn index_file(
        &self,
        entry: &FileEntry,
        boundaries: &[ProjectBoundary],
    ) -> Result<(usize, usize)> {
        let prepared = self.pre_read(entry).await?;
        self.store
            .transaction(|tx| self.index_prepared(tx.conn(), &prepared, boundaries))
    }

    /// Synchronous parse/extract/persist of one pre-read file.
    fn index_prepared(
        &self,
        conn: &Connection,
        file: &PreparedFile,
        boundaries: &[ProjectBoundary],
    ) -> Result<(usize, usize)> {
        let project = self.collab.layout.resolve_project(&file.path, boundaries);

        let parsed = Arc::new(self.collab.analyzer.parse(&file.path, &file.text)?);
        self.cache.put(&file.path, &file.hash, parsed.clone());

        repo::upsert_file_in(
            conn,
            &FileRecord::new(
                project.clone(),
                file.path.clone(),
                file.mtime_ms,
                file.size,
                file.hash.clone(),
            ),
        )?;

        let symbols: Vec<NewSymbol> = self
            .collab
            .analyzer
            .extract_symbols(&parsed)
            .into_iter()
            .map(|s| NewSymbol {
                fingerprint: Some(symbol_fingerprint(&s.name, s.kind, s.signature.as_deref())),
                name: s.name,
                kind: s.kind,
                span: s.span,
                is_exported: s.is_exported,
                signature: s.signature,
                detail: s.detail,
            })
            .collect();
        repo::replace_file_symbols_in(conn, &project, &file.path, &file.hash, &symbols)?;

        let relations = self.collab.analyzer.extract_relations(&parsed);
        repo::replace_file_relations_in(conn, &project, &file.path, &relations)?;

        Ok((symbols.len(), relations.len()))
    }

    /// For every snapshotted symbol whose fingerprint now lives in exactly
    /// one place, repoint incoming relations there. Ambiguous matches are
    /// skipped by design.
    fn retarget_moved_symbols(
        &self,
        snapshot: &[(String, String, Vec<SymbolRow>)],
    ) -> Result<()> {
        for (project, old_path, symbols) in snapshot {
            for symbol in symbols {
                let Some(fingerprint) = &symbol.fingerprint else {
                    continue;
                };
                let matches = self.symbols.get_by_fingerprint(project, fingerprint)?;
                if matches.len() != 1 {
                    continue;
                }
                let target = &matches[0];
                let rewritten = self.relations.retarget_relations(
                    project,
                    old_path,
                    Some(&symbol.name),
                    &target.file_path,
                    Some(&target.name),
                )?;
                if rewritten > 0 {
                    info!(
                        symbol = %symbol.name,
                        from = %old_path,
                        to = %target.file_path,
                        rewritten,
                        "retargeted relations after move"
                    );
                }
            }
        }
        Ok(())
    }

    fn fanout(&self, result: &IndexResult) {
        let subscribers = self.subscribers.lock().expect("subscriber set poisoned");
        for (id, callback) in subscribers.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                warn!(subscriber = *id, "subscriber panicked during fanout");
            }
        }
    }
}

struct PreparedFile {
    path: String,
    mtime_ms: i64,
    size: i64,
    hash: String,
    text: String,
}

async fn wait_outcome(mut handle: RunHandle) -> Result<IndexResult> {
    loop {
        let settled = handle.borrow().clone();
        if let Some(outcome) = settled {
            return outcome.map_err(|e| LedgerError::Coordinator(e.to_string()));
        }
        if handle.changed().await.is_err() {
            return Err(LedgerError::Coordinator("indexing task dropped".into()));
        }
    }
}

/// Create/change events become changed entries with placeholder metadata;
/// deletes become deletions. Duplicate changed paths collapse.
fn classify_events(events: &[WatchEvent]) -> (Vec<FileEntry>, Vec<String>) {
    let mut changed = Vec::new();
    let mut changed_seen: HashSet<&str> = HashSet::new();
    let mut deleted = Vec::new();
    for event in events {
        match event.event_type {
            WatchEventType::Create | WatchEventType::Change => {
                if changed_seen.insert(event.file_path.as_str()) {
                    changed.push(FileEntry {
                        path: event.file_path.clone(),
                        mtime_ms: 0,
                        size: 0,
                        content_hash: String::new(),
                    });
                }
            }
            WatchEventType::Delete => deleted.push(event.file_path.clone()),
        }
    }
    deleted.dedup();
    (changed, deleted)
}

/// Drops exact `(type, path)` duplicates while preserving arrival order.
fn dedup_events(events: Vec<WatchEvent>) -> Vec<WatchEvent> {
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter(|e| seen.insert((e.event_type, e.file_path.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: WatchEventType, path: &str) -> WatchEvent {
        WatchEvent::new(event_type, path)
    }

    #[test]
    fn classify_splits_changes_and_deletes() {
        let (changed, deleted) = classify_events(&[
            event(WatchEventType::Create, "a.ts"),
            event(WatchEventType::Change, "b.ts"),
            event(WatchEventType::Delete, "c.ts"),
        ]);
        assert_eq!(changed.len(), 2);
        assert!(changed.iter().all(|f| f.content_hash.is_empty()));
        assert_eq!(deleted, vec!["c.ts".to_string()]);
    }

    #[test]
    fn classify_collapses_duplicate_changed_paths() {
        let (changed, _) = classify_events(&[
            event(WatchEventType::Create, "a.ts"),
            event(WatchEventType::Change, "a.ts"),
            event(WatchEventType::Change, "a.ts"),
        ]);
        assert_eq!(changed.len(), 1);
    }

    #[test]
    fn dedup_preserves_arrival_order() {
        let events = dedup_events(vec![
            event(WatchEventType::Change, "b.ts"),
            event(WatchEventType::Change, "a.ts"),
            event(WatchEventType::Change, "b.ts"),
        ]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].file_path, "b.ts");
        assert_eq!(events[1].file_path, "a.ts");
    }
}
