//! Boundary to whatever owns the terminals (an editor, a multiplexer).
//!
//! Hosts report terminals opening and closing as typed [`HostEvent`]s and
//! answer a handful of lookups. Nothing untyped crosses into the core.

mod tmux;

pub use tmux::{PaneRecord, TmuxHost};

use async_trait::async_trait;
use std::path::PathBuf;

/// Opaque host-assigned terminal id
pub type TerminalId = String;

/// A terminal as first reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalHandle {
    pub id: TerminalId,
    pub name: String,
}

impl TerminalHandle {
    pub fn new(id: impl Into<TerminalId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Opened(TerminalHandle),
    Closed(TerminalId),
}

/// Lookups the core needs from the host
#[async_trait]
pub trait TerminalHost: Send + Sync {
    /// Current display name, `None` once the terminal is gone
    async fn name_of(&self, id: &str) -> Option<String>;

    /// Root process of the terminal; may be unknown right after creation
    async fn process_id_of(&self, id: &str) -> Option<u32>;

    async fn cwd_of(&self, pid: u32) -> Option<PathBuf>;

    /// Folders the host currently has open
    fn current_workspace_paths(&self) -> Vec<PathBuf>;
}
