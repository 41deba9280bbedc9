//! The public entry point: lifecycle, role management, and the query
//! surface.
//!
//! `CodeLedger::open` validates the workspace, opens the store, and runs
//! leader election. The owner process starts the watcher, a heartbeat timer,
//! and an initial full index; readers run a healthcheck loop that promotes
//! them when the owner dies. Either way the handle serves queries until
//! `close`.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::{
    CodeRelation, Collaborators, ExtractedSymbol, ParsedSource, ProjectBoundary, RelationKind,
    SourceAnalyzer,
};
use crate::config::LedgerOptions;
use crate::coordinator::{IndexCoordinator, IndexResult};
use crate::error::{LedgerError, Result};
use crate::graph::DependencyGraph;
use crate::layout::ManifestLayout;
use crate::ownership::{OwnershipManager, WatcherRole};
use crate::repo::{IndexStats, RelationRepository, SymbolRepository};
use crate::search::{self, RelationHit, RelationQuery, SymbolHit, SymbolQuery};
use crate::store::Store;

type SubscriberFn = dyn Fn(&IndexResult) + Send + Sync;
type SubscriberRegistry = Arc<Mutex<Vec<(u64, Arc<SubscriberFn>)>>>;

/// Removal token returned by [`CodeLedger::on_indexed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

/// Builds the collaborator bundle with the stock manifest-driven layout.
pub fn default_collaborators(
    analyzer: Arc<dyn SourceAnalyzer>,
    options: &LedgerOptions,
) -> Collaborators {
    Collaborators {
        analyzer,
        layout: Arc::new(ManifestLayout::new(options)),
    }
}

#[derive(Clone)]
pub struct CodeLedger {
    inner: Arc<LedgerInner>,
}

impl std::fmt::Debug for CodeLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeLedger").finish_non_exhaustive()
    }
}

struct LedgerInner {
    options: Arc<LedgerOptions>,
    store: Arc<Store>,
    symbols: SymbolRepository,
    relations: RelationRepository,
    ownership: OwnershipManager,
    collab: Collaborators,
    pid: u32,
    role: Mutex<WatcherRole>,
    coordinator: Mutex<Option<IndexCoordinator>>,
    watcher: Mutex<Option<crate::watcher::FileWatcher>>,
    boundaries: Mutex<Vec<ProjectBoundary>>,
    subscribers: SubscriberRegistry,
    next_subscriber: AtomicU64,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl CodeLedger {
    /// Opens the workspace: store, migrations, boundary discovery, role
    /// election, and (for owners) watcher plus initial full index.
    pub async fn open(options: LedgerOptions, collab: Collaborators) -> Result<Self> {
        if !options.workspace_root.is_absolute() {
            return Err(LedgerError::Lifecycle(format!(
                "workspace root must be absolute: {}",
                options.workspace_root.display()
            )));
        }
        if !options.workspace_root.is_dir() {
            return Err(LedgerError::Lifecycle(format!(
                "workspace root does not exist: {}",
                options.workspace_root.display()
            )));
        }

        let options = Arc::new(options);
        let store = Arc::new(Store::open(&options.db_path())?);

        match Self::startup(options, store.clone(), collab).await {
            Ok(ledger) => Ok(ledger),
            Err(e) => {
                // Anything acquired after the store must not leak it.
                let _ = store.close();
                Err(e)
            }
        }
    }

    async fn startup(
        options: Arc<LedgerOptions>,
        store: Arc<Store>,
        collab: Collaborators,
    ) -> Result<Self> {
        let pid = std::process::id();
        let ownership = OwnershipManager::new(store.clone(), options.ownership_staleness);
        let role = ownership.acquire(pid)?;
        info!(?role, pid, root = %options.workspace_root.display(), "code ledger opening");

        let inner = Arc::new(LedgerInner {
            symbols: SymbolRepository::new(store.clone()),
            relations: RelationRepository::new(store.clone()),
            ownership,
            collab,
            pid,
            role: Mutex::new(role),
            coordinator: Mutex::new(None),
            watcher: Mutex::new(None),
            boundaries: Mutex::new(Vec::new()),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            options,
            store,
        });

        let started: Result<()> = match role {
            WatcherRole::Owner => become_owner(&inner).await,
            WatcherRole::Reader => {
                match inner
                    .collab
                    .layout
                    .discover_projects(&inner.options.workspace_root)
                    .await
                {
                    Ok(boundaries) => {
                        *lock(&inner.boundaries) = boundaries;
                        spawn_healthcheck(&inner);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        };
        if let Err(e) = started {
            // A failed startup must not keep the owner role (or any helper
            // task) alive.
            inner.cancel.cancel();
            let _ = inner.ownership.release(pid);
            return Err(e);
        }

        let ledger = Self { inner };
        ledger.spawn_signal_handler();
        Ok(ledger)
    }

    /// Shuts everything down, releases ownership, closes the store. Runs
    /// once; later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(pid = self.inner.pid, "code ledger closing");

        // Stops signal handlers, heartbeat, healthcheck, and the event
        // forwarder.
        self.inner.cancel.cancel();

        let coordinator = lock(&self.inner.coordinator).take();
        if let Some(coordinator) = coordinator {
            coordinator.shutdown().await;
        }
        if let Some(mut watcher) = lock(&self.inner.watcher).take() {
            watcher.close();
        }
        self.inner.ownership.release(self.inner.pid)?;
        self.inner.store.close()?;
        Ok(())
    }

    /// The role this process currently holds.
    pub fn role(&self) -> WatcherRole {
        *lock(&self.inner.role)
    }

    /// Names of all known projects, sorted.
    pub fn projects(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let boundaries = match lock(&self.inner.coordinator).as_ref() {
            Some(coordinator) => coordinator.boundaries(),
            None => lock(&self.inner.boundaries).clone(),
        };
        let names: BTreeSet<String> = boundaries.into_iter().map(|b| b.name).collect();
        Ok(names.into_iter().collect())
    }

    pub fn get_stats(&self, project: Option<&str>) -> Result<IndexStats> {
        self.ensure_open()?;
        self.inner.symbols.get_stats(project)
    }

    pub fn search_symbols(&self, query: &SymbolQuery) -> Result<Vec<SymbolHit>> {
        self.ensure_open()?;
        search::search_symbols(&self.inner.symbols, query)
    }

    pub fn search_relations(&self, query: &RelationQuery) -> Result<Vec<RelationHit>> {
        self.ensure_open()?;
        search::search_relations(&self.inner.relations, query)
    }

    /// Direct imports of `path`.
    pub fn get_dependencies(&self, path: &str, project: Option<&str>) -> Result<Vec<String>> {
        self.ensure_open()?;
        let project = self.project_of(path, project);
        let rows = self.inner.relations.get_outgoing(&project, path, None)?;
        let targets: BTreeSet<String> = rows
            .into_iter()
            .filter(|r| r.kind == RelationKind::Imports)
            .map(|r| r.dst_file_path)
            .collect();
        Ok(targets.into_iter().collect())
    }

    /// Direct importers of `path`.
    pub fn get_dependents(&self, path: &str, project: Option<&str>) -> Result<Vec<String>> {
        self.ensure_open()?;
        let project = self.project_of(path, project);
        let rows = self.inner.relations.get_incoming(&project, path)?;
        let sources: BTreeSet<String> = rows
            .into_iter()
            .filter(|r| r.kind == RelationKind::Imports)
            .map(|r| r.src_file_path)
            .collect();
        Ok(sources.into_iter().collect())
    }

    /// Transitive dependents of all inputs, deduplicated.
    pub fn get_affected(&self, paths: &[String], project: Option<&str>) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut affected: BTreeSet<String> = BTreeSet::new();
        let mut graphs: std::collections::HashMap<String, DependencyGraph> = Default::default();
        for path in paths {
            let project = self.project_of(path, project);
            if !graphs.contains_key(&project) {
                graphs.insert(
                    project.clone(),
                    DependencyGraph::build(&self.inner.relations, &project)?,
                );
            }
            affected.extend(graphs[&project].transitive_dependents(path));
        }
        Ok(affected.into_iter().collect())
    }

    /// Whether any project's import graph contains a cycle.
    pub fn has_cycle(&self, project: Option<&str>) -> Result<bool> {
        self.ensure_open()?;
        let projects = match project {
            Some(p) => vec![p.to_string()],
            None => self.projects()?,
        };
        for project in projects {
            if DependencyGraph::build(&self.inner.relations, &project)?.has_cycle() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // Pass-throughs to the injected analyzer.

    pub fn parse_source(&self, file_path: &str, source: &str) -> Result<ParsedSource> {
        self.ensure_open()?;
        self.inner.collab.analyzer.parse(file_path, source)
    }

    pub fn extract_symbols(&self, parsed: &ParsedSource) -> Result<Vec<ExtractedSymbol>> {
        self.ensure_open()?;
        Ok(self.inner.collab.analyzer.extract_symbols(parsed))
    }

    pub fn extract_relations(&self, parsed: &ParsedSource) -> Result<Vec<CodeRelation>> {
        self.ensure_open()?;
        Ok(self.inner.collab.analyzer.extract_relations(parsed))
    }

    /// Registers a completion callback. Survives reader-to-owner promotion:
    /// a freshly built coordinator picks up every registered subscriber.
    pub fn on_indexed(
        &self,
        callback: impl Fn(&IndexResult) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers).push((id, Arc::new(callback)));
        SubscriptionToken(id)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        lock(&self.inner.subscribers).retain(|(id, _)| *id != token.0);
    }

    /// Owner-only full rebuild.
    pub async fn reindex(&self) -> Result<IndexResult> {
        self.ensure_open()?;
        let coordinator = lock(&self.inner.coordinator).clone();
        match coordinator {
            Some(coordinator) => coordinator.full_index().await,
            None => Err(LedgerError::Usage(
                "reindex requires watcher ownership; this process is a reader".into(),
            )),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(LedgerError::Usage("ledger is closed".into()));
        }
        Ok(())
    }

    fn project_of(&self, path: &str, project: Option<&str>) -> String {
        match project {
            Some(p) => p.to_string(),
            None => {
                let boundaries = match lock(&self.inner.coordinator).as_ref() {
                    Some(coordinator) => coordinator.boundaries(),
                    None => lock(&self.inner.boundaries).clone(),
                };
                self.inner.collab.layout.resolve_project(path, &boundaries)
            }
        }
    }

    fn spawn_signal_handler(&self) {
        let ledger = self.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = terminate_signal() => {
                    info!("termination signal received, closing ledger");
                    if let Err(e) = ledger.close().await {
                        warn!(error = %e, "close on signal failed");
                    }
                }
            }
        });
    }
}

/// Builds the coordinator + watcher + heartbeat for the owner role, then
/// runs the initial full index.
async fn become_owner(inner: &Arc<LedgerInner>) -> Result<()> {
    let root = &inner.options.workspace_root;
    let boundaries = inner.collab.layout.discover_projects(root).await?;
    let alias_table = inner.collab.layout.load_alias_table(root).await?;
    *lock(&inner.boundaries) = boundaries.clone();

    let coordinator = IndexCoordinator::new(
        inner.store.clone(),
        inner.options.clone(),
        inner.collab.clone(),
        boundaries,
        alias_table,
    );

    // One bridge subscriber reads the facade registry on every run, so
    // subscriptions made before promotion (or after) all fire, in
    // registration order.
    let registry = inner.subscribers.clone();
    coordinator.on_indexed(move |result| {
        let callbacks: Vec<Arc<SubscriberFn>> =
            lock(&registry).iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| (*callback)(result))).is_err() {
                warn!("indexing subscriber panicked");
            }
        }
    });

    // Watcher events flow through a channel into the coordinator's intake.
    let (events_tx, mut events_rx) = mpsc::channel(256);
    let watcher = crate::watcher::FileWatcher::start(&inner.options, events_tx)?;
    {
        let coordinator = coordinator.clone();
        let cancel = inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events_rx.recv() => match event {
                        Some(event) => coordinator.handle_watcher_event(event),
                        None => break,
                    }
                }
            }
            debug!("watch event forwarder stopped");
        });
    }

    spawn_heartbeat(inner);

    *lock(&inner.coordinator) = Some(coordinator.clone());
    *lock(&inner.watcher) = Some(watcher);
    *lock(&inner.role) = WatcherRole::Owner;

    coordinator.full_index().await?;
    Ok(())
}

fn spawn_heartbeat(inner: &Arc<LedgerInner>) {
    let inner = inner.clone();
    let cancel = inner.cancel.clone();
    let period = inner.options.heartbeat_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = inner.ownership.heartbeat(inner.pid) {
                        warn!(error = %e, "heartbeat failed");
                    }
                }
            }
        }
    });
}

/// Reader loop: periodically retry acquisition; on success, promote this
/// process to owner and rebuild.
fn spawn_healthcheck(inner: &Arc<LedgerInner>) {
    let inner = inner.clone();
    let cancel = inner.cancel.clone();
    let period = inner.options.healthcheck_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match inner.ownership.acquire(inner.pid) {
                        Ok(WatcherRole::Owner) => {
                            info!(pid = inner.pid, "previous owner gone, promoting to owner");
                            match become_owner(&inner).await {
                                Ok(()) => break,
                                Err(e) => {
                                    // A half-promoted process must not squat
                                    // on the owner row: undo whatever was
                                    // built, give the row back, and keep
                                    // probing as a reader.
                                    warn!(error = %e, "promotion failed, staying reader");
                                    let coordinator = lock(&inner.coordinator).take();
                                    if let Some(coordinator) = coordinator {
                                        coordinator.shutdown().await;
                                    }
                                    if let Some(mut watcher) = lock(&inner.watcher).take() {
                                        watcher.close();
                                    }
                                    *lock(&inner.role) = WatcherRole::Reader;
                                    let _ = inner.ownership.release(inner.pid);
                                }
                            }
                        }
                        Ok(WatcherRole::Reader) => {}
                        Err(e) => warn!(error = %e, "ownership probe failed"),
                    }
                }
            }
        }
    });
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
