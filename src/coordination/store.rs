//! File-backed shared record of all coordinating windows.
//!
//! Every window reads and writes the same JSON file. There is no lock: a
//! write goes to a temp file in the same directory and is renamed over the
//! canonical path, so readers only ever see a complete record. Each window
//! writes only its own key, so a read-modify-write that loses a race is
//! detected by re-reading and simply re-applied after a random jitter.
//!
//! Reads never fail. A missing, empty, or corrupt file is an empty state.

use rand::Rng;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{now_ms, CoordinationState, TerminalInfo, WindowState};
use crate::error::StoreError;

/// Retry budget for read-modify-write cycles
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Upper bound of the random pause between attempts (lower bound is 1ms)
    pub jitter_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            jitter_max: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    fn jitter(&self) -> Duration {
        let max = (self.jitter_max.as_millis() as u64).max(1);
        Duration::from_millis(rand::thread_rng().gen_range(1..=max))
    }
}

/// Handle to the shared coordination record. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    pid: u32,
    retry: RetryPolicy,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pid: std::process::id(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current record, treating any failure as an empty state
    pub async fn read(&self) -> CoordinationState {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => parse_state(&bytes, &self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CoordinationState::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "State file unreadable, treating as empty");
                CoordinationState::default()
            }
        }
    }

    /// Atomically replace the record
    pub async fn write(&self, state: &CoordinationState) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(state)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let staged = stage(&path, &content)?;
            commit(staged, &path)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Set this process's entry for `window_id`, stamped with the current
    /// time on every attempt
    pub async fn update_window(
        &self,
        window_id: &str,
        terminals: Vec<TerminalInfo>,
    ) -> Result<(), StoreError> {
        let stamp = AtomicI64::new(0);
        let written = |last_update: i64| WindowState {
            window_id: window_id.to_string(),
            pid: self.pid,
            last_update,
            terminals: terminals.clone(),
        };

        self.read_modify_write(
            window_id,
            |state| {
                let now = now_ms();
                stamp.store(now, Ordering::SeqCst);
                state.windows.insert(window_id.to_string(), written(now));
                Some(())
            },
            |state| state.windows.get(window_id) == Some(&written(stamp.load(Ordering::SeqCst))),
        )
        .await
        .map(|_| ())
    }

    /// Delete one window's entry. Missing entries are not an error.
    pub async fn remove_window(&self, window_id: &str) -> Result<(), StoreError> {
        self.remove_windows(&[window_id.to_string()])
            .await
            .map(|_| ())
    }

    /// Delete several entries in one cycle, returning how many were present
    pub async fn remove_windows(&self, window_ids: &[String]) -> Result<usize, StoreError> {
        self.remove_windows_matching("remove", |w| {
            window_ids.contains(&w.window_id)
        })
        .await
        .map(|removed| removed.len())
    }

    /// Delete every entry for which `matches` holds, returning the removed ids.
    ///
    /// The predicate is re-evaluated on each attempt, so an entry that stops
    /// matching in the meantime (a slow window heartbeating again) survives.
    pub async fn remove_windows_matching(
        &self,
        label: &str,
        matches: impl Fn(&WindowState) -> bool,
    ) -> Result<Vec<String>, StoreError> {
        let removed = self
            .read_modify_write(
                label,
                |state| {
                    let ids: Vec<String> = state
                        .windows
                        .values()
                        .filter(|w| matches(w))
                        .map(|w| w.window_id.clone())
                        .collect();
                    if ids.is_empty() {
                        return None;
                    }
                    for id in &ids {
                        state.windows.remove(id);
                    }
                    Some(ids)
                },
                |state| !state.windows.values().any(|w| matches(w)),
            )
            .await?;
        Ok(removed.unwrap_or_default())
    }

    /// Optimistic read-modify-write with verification.
    ///
    /// `apply` returns `None` when the state already holds what we want, in
    /// which case nothing is written. After a write we pause briefly and
    /// re-read; if `committed` no longer holds, a concurrent writer replaced
    /// the file with a copy that predates ours and we go again.
    async fn read_modify_write<T>(
        &self,
        label: &str,
        mut apply: impl FnMut(&mut CoordinationState) -> Option<T>,
        committed: impl Fn(&CoordinationState) -> bool,
    ) -> Result<Option<T>, StoreError> {
        let attempts = self.retry.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let mut state = self.read().await;
            let Some(outcome) = apply(&mut state) else {
                return Ok(None);
            };

            match self.write(&state).await {
                Ok(()) => {
                    tokio::time::sleep(self.retry.jitter()).await;
                    if committed(&self.read().await) {
                        return Ok(Some(outcome));
                    }
                    debug!(window_id = label, attempt, "Write clobbered by concurrent writer");
                    last_error = None;
                }
                Err(e) => {
                    debug!(window_id = label, attempt, error = %e, "State write failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.retry.jitter()).await;
            }
        }

        Err(last_error.unwrap_or_else(|| StoreError::Conflict {
            window_id: label.to_string(),
            attempts,
        }))
    }
}

fn parse_state(bytes: &[u8], path: &Path) -> CoordinationState {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return CoordinationState::default();
    }
    match serde_json::from_slice(bytes) {
        Ok(state) => state,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "State file corrupt, treating as empty");
            CoordinationState::default()
        }
    }
}

/// Write `content` to a uniquely named temp file next to `path`
fn stage(path: &Path, content: &[u8]) -> Result<NamedTempFile, StoreError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| StoreError::unavailable(dir, e))?;

    let prefix = format!(
        ".{}.",
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| StoreError::unavailable(dir, e))?;

    tmp.write_all(content)
        .and_then(|_| tmp.flush())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| StoreError::unavailable(tmp.path(), e))?;
    Ok(tmp)
}

/// Rename a staged temp file over `path`. The temp file is removed on failure.
fn commit(staged: NamedTempFile, path: &Path) -> Result<(), StoreError> {
    match staged.persist(path) {
        Ok(_) => Ok(()),
        Err(e) => {
            if let Err(close_err) = e.file.close() {
                warn!(error = %close_err, "Failed to remove temp state file");
            }
            Err(StoreError::unavailable(path, e.error))
        }
    }
}
