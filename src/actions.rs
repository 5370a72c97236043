use crossterm::event::KeyEvent;

use agent_beacon::host::HostEvent;

use crate::app::Snapshot;

/// Actions that can be dispatched through the application
#[derive(Debug, Clone)]
pub enum Action {
    /// A key was pressed
    KeyPress(KeyEvent),
    /// Terminals opened or closed in the host
    Host(Vec<HostEvent>),
    /// The global session count changed
    CountChanged(usize),
    /// Fresh view of local and recoverable sessions
    Snapshot(Snapshot),
    /// An error occurred
    Error(String),
    /// Re-read the shared state
    Refresh,
    /// Copy a resume command to the clipboard
    CopyResume(String),
    /// Remove crashed windows from the shared state
    ClearStale,
}
