use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Debounced change notifications for the shared state file.
///
/// Watches the file's parent directory, since every write replaces the file
/// by rename, and only reacts to events naming the file itself. A burst of
/// raw events produces one callback once the burst has been quiet for the
/// debounce period.
pub struct StoreWatcher {
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StoreWatcher {
    pub fn start<F, Fut>(path: &Path, debounce: Duration, on_change: F) -> notify::Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(notify::Error::io)?;
        let file_name = path.file_name().map(OsString::from).unwrap_or_default();

        let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    if is_relevant(&event, &file_name) {
                        let _ = event_tx.send(());
                    }
                }
            },
            Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(path = %path.display(), "Watching state file for changes");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the task
            let _watcher = watcher;
            debounce_loop(event_rx, shutdown_rx, debounce, on_change).await;
            debug!("State file watcher stopped");
        });

        Ok(Self {
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Stop watching. Safe to call more than once.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().ok().and_then(|mut s| s.take()) {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
    }
}

impl Drop for StoreWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_relevant(event: &Event, file_name: &OsString) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

async fn debounce_loop<F, Fut>(
    mut events: mpsc::UnboundedReceiver<()>,
    mut shutdown: oneshot::Receiver<()>,
    debounce: Duration,
    on_change: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            _ = &mut shutdown => return,
            event = events.recv() => {
                if event.is_none() {
                    return;
                }
            }
        }

        // Trailing edge: wait until the burst goes quiet
        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                _ = tokio::time::sleep(debounce) => break,
                event = events.recv() => {
                    if event.is_none() {
                        return;
                    }
                }
            }
        }

        on_change().await;
    }
}
