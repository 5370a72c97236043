mod coordinator;
mod heartbeat;
mod staleness;
mod store;
mod watcher;

pub use coordinator::{Coordinator, CoordinatorSettings, TrackedTerminal};
pub use heartbeat::Heartbeat;
pub use staleness::StalenessOracle;
pub use store::{RetryPolicy, StateStore};
pub use watcher::StoreWatcher;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A terminal as recorded in the shared state file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    /// Display name; not unique
    pub name: String,
    pub workspace_path: String,
}

impl TerminalInfo {
    pub fn new(name: impl Into<String>, workspace_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workspace_path: workspace_path.into(),
        }
    }
}

/// One coordinating window's entry in the shared record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowState {
    pub window_id: String,
    pub pid: u32,
    /// Epoch milliseconds of the last heartbeat or terminal change
    pub last_update: i64,
    #[serde(default)]
    pub terminals: Vec<TerminalInfo>,
}

/// The entire shared record, keyed by window id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationState {
    #[serde(default)]
    pub windows: BTreeMap<String, WindowState>,
}

impl CoordinationState {
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// A terminal left behind by a window that stopped heartbeating
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverableSession {
    pub name: String,
    pub workspace_path: String,
    pub window_id: String,
    pub last_update: i64,
}

impl RecoverableSession {
    /// Shell command that resumes this session in its working directory
    pub fn resume_command(&self, program: &str) -> String {
        format!("cd {} && {}", shell_quote(&self.workspace_path), program)
    }
}

/// A terminal of some active window, tagged with its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowTerminal {
    pub window_id: String,
    pub terminal: TerminalInfo,
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Window id for this process: pid plus start time, never reused
pub fn generate_window_id() -> String {
    format!("{}-{}", std::process::id(), now_ms())
}
