use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{StateStore, TerminalInfo};
use crate::error::StoreError;

/// Shortest accepted interval; `tokio::time::interval` panics on zero
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Keeps one window's entry fresh in the shared record.
///
/// A single background task owns all writes for the window, so writes never
/// overlap. The terminal list travels over a `watch` channel: an update that
/// arrives while a write is in flight replaces any earlier pending list
/// instead of queueing behind it.
pub struct Heartbeat {
    terminals: watch::Sender<Vec<TerminalInfo>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    /// Start beating immediately, then every `interval`
    pub fn start(store: StateStore, window_id: String, interval: Duration) -> Self {
        let (terminals_tx, terminals_rx) = watch::channel(Vec::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        if interval < MIN_INTERVAL {
            warn!(window_id = %window_id, ?interval, "Heartbeat interval too short, using {:?}", MIN_INTERVAL);
        }
        let interval = interval.max(MIN_INTERVAL);

        let writer_id = window_id.clone();
        let write = move |terminals: Vec<TerminalInfo>| {
            let store = store.clone();
            let window_id = writer_id.clone();
            async move { store.update_window(&window_id, terminals).await }
        };
        let task = tokio::spawn(run(window_id, interval, terminals_rx, shutdown_rx, write));

        Self {
            terminals: terminals_tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    /// Replace the terminal list and write it without waiting for the next tick
    pub fn update(&self, terminals: Vec<TerminalInfo>) {
        self.terminals.send_replace(terminals);
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// Stop the timer, waiting for any in-flight write to land.
    /// Returns `false` if already stopped.
    pub async fn stop(&self) -> bool {
        let shutdown = self.shutdown.lock().ok().and_then(|mut s| s.take());
        let task = self.task.lock().ok().and_then(|mut t| t.take());

        let Some(task) = task else {
            return false;
        };
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
        if let Err(e) = task.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }
        true
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn run<W, Fut>(
    window_id: String,
    interval: Duration,
    mut terminals: watch::Receiver<Vec<TerminalInfo>>,
    mut shutdown: oneshot::Receiver<()>,
    write: W,
) where
    W: Fn(Vec<TerminalInfo>) -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
            changed = terminals.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let current = terminals.borrow_and_update().clone();
        let count = current.len();
        match write(current).await {
            Ok(()) => debug!(window_id = %window_id, terminals = count, "Heartbeat written"),
            // Degrade to "alone": other windows just miss our entry for a tick
            Err(e) => warn!(window_id = %window_id, error = %e, "Heartbeat write failed"),
        }
    }

    debug!(window_id = %window_id, "Heartbeat stopped");
}
