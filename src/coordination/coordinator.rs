use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{
    now_ms, CoordinationState, Heartbeat, RecoverableSession, StalenessOracle, StateStore,
    StoreWatcher, TerminalInfo, WindowState, WindowTerminal,
};
use crate::classifier::{Classification, TerminalClassifier, UntrackedReason};
use crate::config::CoordinationConfig;
use crate::error::StoreError;
use crate::host::{TerminalHandle, TerminalHost, TerminalId};

/// Timing knobs for a coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub heartbeat_interval: Duration,
    pub stale_threshold: Duration,
    pub change_debounce: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        (&CoordinationConfig::default()).into()
    }
}

impl From<&CoordinationConfig> for CoordinatorSettings {
    fn from(config: &CoordinationConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            stale_threshold: config.stale_threshold(),
            change_debounce: config.change_debounce(),
        }
    }
}

/// A terminal this window has confirmed as an agent session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedTerminal {
    pub id: TerminalId,
    pub name: String,
    pub workspace_path: String,
    pub pid: Option<u32>,
}

type CountCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// This window's own view: which host terminals are open, and which of
/// those are tracked, grouped by workspace
#[derive(Default)]
struct LocalTerminals {
    open: HashSet<TerminalId>,
    by_workspace: BTreeMap<String, Vec<TrackedTerminal>>,
}

impl LocalTerminals {
    fn all(&self) -> Vec<TrackedTerminal> {
        self.by_workspace.values().flatten().cloned().collect()
    }

    fn infos(&self) -> Vec<TerminalInfo> {
        self.by_workspace
            .values()
            .flatten()
            .map(|t| TerminalInfo::new(&t.name, &t.workspace_path))
            .collect()
    }

    fn is_tracked(&self, id: &str) -> bool {
        self.by_workspace.values().flatten().any(|t| t.id == id)
    }

    fn remove(&mut self, id: &str) -> bool {
        let mut removed = false;
        self.by_workspace.retain(|_, terminals| {
            let before = terminals.len();
            terminals.retain(|t| t.id != id);
            removed |= terminals.len() != before;
            !terminals.is_empty()
        });
        removed
    }
}

struct Inner {
    window_id: String,
    store: StateStore,
    oracle: StalenessOracle,
    host: Arc<dyn TerminalHost>,
    classifier: Arc<TerminalClassifier>,
    heartbeat: Heartbeat,
    watcher: Mutex<Option<StoreWatcher>>,
    local: Mutex<LocalTerminals>,
    /// Classification and refresh tasks, aborted on shutdown
    tasks: Mutex<JoinSet<()>>,
    on_count_changed: Mutex<Option<CountCallback>>,
    shut_down: AtomicBool,
}

/// Per-window façade over the shared record.
///
/// Tracks this window's agent terminals, mirrors them into the shared
/// record through the heartbeat, and answers global queries by reading the
/// record fresh each time. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Start heartbeating and watching for external changes.
    /// Must be called from within a tokio runtime.
    pub fn start(
        window_id: String,
        store: StateStore,
        settings: CoordinatorSettings,
        host: Arc<dyn TerminalHost>,
        classifier: Arc<TerminalClassifier>,
    ) -> Self {
        let heartbeat = Heartbeat::start(
            store.clone(),
            window_id.clone(),
            settings.heartbeat_interval,
        );

        let inner = Arc::new(Inner {
            window_id,
            store,
            oracle: StalenessOracle::new(settings.stale_threshold),
            host,
            classifier,
            heartbeat,
            watcher: Mutex::new(None),
            local: Mutex::new(LocalTerminals::default()),
            tasks: Mutex::new(JoinSet::new()),
            on_count_changed: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let watcher = StoreWatcher::start(
            inner.store.path(),
            settings.change_debounce,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        Coordinator { inner }.handle_external_change().await;
                    }
                }
            },
        );
        match watcher {
            Ok(watcher) => *lock(&inner.watcher) = Some(watcher),
            // Still usable; the UI just won't hear about other windows until it asks
            Err(e) => warn!(error = %e, "State file watcher unavailable"),
        }

        info!(window_id = %inner.window_id, path = %inner.store.path().display(), "Coordinator started");
        Self { inner }
    }

    pub fn window_id(&self) -> &str {
        &self.inner.window_id
    }

    /// Register the callback that receives the global active count after
    /// every local change and every external change to the shared record
    pub fn on_global_count_changed(&self, callback: impl Fn(usize) + Send + Sync + 'static) {
        *lock(&self.inner.on_count_changed) = Some(Arc::new(callback));
    }

    /// Host reported a new terminal; classify it in the background
    pub fn terminal_opened(&self, terminal: TerminalHandle) {
        if self.is_shut_down() {
            return;
        }
        if !lock(&self.inner.local).open.insert(terminal.id.clone()) {
            debug!(terminal = %terminal.id, "Duplicate open event ignored");
            return;
        }

        let this = self.clone();
        self.spawn(async move {
            this.track_if_agent(terminal).await;
        });
    }

    /// Host reported a terminal closed
    pub fn terminal_closed(&self, id: &str) {
        let removed = {
            let mut local = lock(&self.inner.local);
            local.open.remove(id);
            local.remove(id)
        };
        if removed {
            info!(terminal = %id, "Agent terminal closed");
            self.local_changed();
        }
    }

    /// Classify an open terminal and register it if it is an agent session.
    ///
    /// The terminal may close at any point while this runs; registration
    /// re-checks under the lock and skips terminals that are already gone.
    pub async fn track_if_agent(&self, terminal: TerminalHandle) -> Classification {
        let id = terminal.id.clone();
        let is_open = {
            let inner = self.inner.clone();
            move || !inner.shut_down.load(Ordering::SeqCst) && lock(&inner.local).open.contains(&id)
        };

        let classification = self
            .inner
            .classifier
            .classify(&terminal, self.inner.host.as_ref(), &is_open)
            .await;

        let Classification::Tracked { pid, source } = classification else {
            return classification;
        };

        let workspace_path = self.resolve_workspace(pid).await;
        let tracked = TrackedTerminal {
            id: terminal.id.clone(),
            name: terminal.name.clone(),
            workspace_path,
            pid,
        };

        let registered = {
            let mut local = lock(&self.inner.local);
            if self.is_shut_down() || !local.open.contains(&tracked.id) || local.is_tracked(&tracked.id) {
                false
            } else {
                local
                    .by_workspace
                    .entry(tracked.workspace_path.clone())
                    .or_default()
                    .push(tracked.clone());
                true
            }
        };

        if !registered {
            debug!(terminal = %terminal.id, "Terminal closed before registration");
            return Classification::Untracked(UntrackedReason::Closed);
        }

        info!(
            terminal = %tracked.id,
            name = %tracked.name,
            workspace = %tracked.workspace_path,
            ?source,
            "Tracking agent terminal"
        );
        self.local_changed();
        classification
    }

    /// This window's tracked terminals
    pub fn local_terminals(&self) -> Vec<TrackedTerminal> {
        lock(&self.inner.local).all()
    }

    /// Tracked terminals of this window grouped by workspace path
    pub fn local_terminals_by_workspace(&self) -> HashMap<String, Vec<TrackedTerminal>> {
        lock(&self.inner.local)
            .by_workspace
            .iter()
            .map(|(path, terminals)| (path.clone(), terminals.clone()))
            .collect()
    }

    /// Agent sessions running in all active windows
    pub async fn total_count(&self) -> usize {
        let state = self.snapshot().await;
        self.inner
            .oracle
            .total_active_terminal_count(&state, now_ms())
    }

    /// Terminals of every active window, this one included
    pub async fn all_terminals(&self) -> Vec<WindowTerminal> {
        let state = self.snapshot().await;
        self.inner.oracle.active_terminals(&state, now_ms())
    }

    /// Terminals left behind by crashed windows, one per workspace path
    /// (the most recently seen), newest first
    pub async fn recoverable_sessions(&self) -> Vec<RecoverableSession> {
        let state = self.snapshot().await;
        dedupe_by_workspace(self.inner.oracle.recoverable_sessions(&state, now_ms()))
    }

    /// Remove every stale window from the shared record, returning how many
    /// were removed. Only meant to run after the user has dealt with the
    /// recovery prompt.
    pub async fn clear_stale_sessions(&self) -> Result<usize, StoreError> {
        let own_id = self.inner.window_id.clone();
        let oracle = self.inner.oracle;
        let removed = self
            .inner
            .store
            .remove_windows_matching("stale", |w| {
                w.window_id != own_id && oracle.is_stale(w, now_ms())
            })
            .await?;

        if !removed.is_empty() {
            info!(windows = ?removed, "Cleared stale windows");
            self.publish_count().await;
        }
        Ok(removed.len())
    }

    /// Graceful shutdown: cancel classification, stop watching, stop the
    /// heartbeat and remove our entry. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        lock(&self.inner.tasks).abort_all();
        if let Some(watcher) = lock(&self.inner.watcher).take() {
            watcher.stop();
        }
        self.inner.heartbeat.stop().await;

        if let Err(e) = self.inner.store.remove_window(&self.inner.window_id).await {
            warn!(window_id = %self.inner.window_id, error = %e, "Failed to remove window entry");
        }
        *lock(&self.inner.local) = LocalTerminals::default();
        info!(window_id = %self.inner.window_id, "Coordinator shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Fresh read of the shared record with our own entry replaced by the
    /// live local view, so this window is never stale to itself
    async fn snapshot(&self) -> CoordinationState {
        let mut state = self.inner.store.read().await;
        if !self.is_shut_down() {
            let terminals = lock(&self.inner.local).infos();
            state.windows.insert(
                self.inner.window_id.clone(),
                WindowState {
                    window_id: self.inner.window_id.clone(),
                    pid: std::process::id(),
                    last_update: now_ms(),
                    terminals,
                },
            );
        }
        state
    }

    async fn resolve_workspace(&self, pid: Option<u32>) -> String {
        let cwd = match pid {
            Some(pid) => self.inner.host.cwd_of(pid).await,
            None => None,
        };
        cwd.or_else(|| self.inner.host.current_workspace_paths().into_iter().next())
            .map(|p: PathBuf| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn local_changed(&self) {
        let infos = lock(&self.inner.local).infos();
        self.inner.heartbeat.update(infos);

        let this = self.clone();
        self.spawn(async move {
            this.publish_count().await;
        });
    }

    async fn handle_external_change(&self) {
        if self.is_shut_down() {
            return;
        }
        debug!(window_id = %self.inner.window_id, "Shared state changed");
        self.publish_count().await;
    }

    async fn publish_count(&self) {
        let count = self.total_count().await;
        let callback = lock(&self.inner.on_count_changed).clone();
        if let Some(callback) = callback {
            callback(count);
        }
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        if self.is_shut_down() {
            return;
        }
        let mut tasks = lock(&self.inner.tasks);
        // Reap finished tasks so the set doesn't grow without bound
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }
}

/// Keep the most recently seen session per workspace path, newest first
fn dedupe_by_workspace(sessions: Vec<RecoverableSession>) -> Vec<RecoverableSession> {
    let mut latest: HashMap<String, RecoverableSession> = HashMap::new();
    for session in sessions {
        match latest.get(&session.workspace_path) {
            Some(existing) if existing.last_update >= session.last_update => {}
            _ => {
                latest.insert(session.workspace_path.clone(), session);
            }
        }
    }
    let mut sessions: Vec<RecoverableSession> = latest.into_values().collect();
    sessions.sort_by(|a, b| {
        b.last_update
            .cmp(&a.last_update)
            .then_with(|| a.workspace_path.cmp(&b.workspace_path))
    });
    sessions
}

/// Lock ignoring poisoning; the guarded data stays consistent across panics
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
