use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::Command;

use super::{HostEvent, TerminalHandle, TerminalHost};

/// Fields requested from `tmux list-panes`, tab separated. The title goes
/// last since it is free text.
const PANE_FORMAT: &str =
    "#{pane_id}\t#{pane_pid}\t#{session_name}\t#{pane_current_command}\t#{pane_current_path}\t#{pane_title}";

/// One tmux pane, as parsed from `list-panes`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneRecord {
    /// Pane ID (e.g., "%3")
    pub id: String,
    /// Pid of the pane's root process (usually a shell)
    pub pid: u32,
    pub session: String,
    pub current_command: String,
    pub current_path: PathBuf,
    pub title: String,
}

impl PaneRecord {
    /// Display name: the pane title, or the running command when untitled
    pub fn display_name(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.current_command
        } else {
            &self.title
        }
    }
}

/// Terminal host backed by tmux panes.
///
/// tmux has no push notifications, so [`TmuxHost::poll`] diffs successive
/// pane listings into open/close events.
pub struct TmuxHost {
    /// Path to tmux binary
    tmux_path: String,
    /// Restrict to one session; all sessions when unset
    session: Option<String>,
    workspaces: Vec<PathBuf>,
    panes: Mutex<HashMap<String, PaneRecord>>,
}

impl TmuxHost {
    pub fn new(session: Option<String>) -> Self {
        let workspaces = std::env::current_dir().into_iter().collect();
        Self {
            tmux_path: "tmux".to_string(),
            session,
            workspaces,
            panes: Mutex::new(HashMap::new()),
        }
    }

    /// Check if tmux server is running
    pub async fn is_server_running(&self) -> bool {
        Command::new(&self.tmux_path)
            .arg("list-sessions")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// List panes of the configured session (or all sessions)
    pub async fn list_panes(&self) -> Result<Vec<PaneRecord>> {
        let mut cmd = Command::new(&self.tmux_path);
        cmd.arg("list-panes");
        match &self.session {
            Some(session) => cmd.args(["-s", "-t", session.as_str()]),
            None => cmd.arg("-a"),
        };
        let output = cmd
            .args(["-F", PANE_FORMAT])
            .output()
            .await
            .context("Failed to execute tmux list-panes")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no server running")
                || stderr.contains("no sessions")
                || stderr.contains("can't find session")
            {
                return Ok(Vec::new());
            }
            anyhow::bail!("tmux list-panes failed: {}", stderr);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut panes = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            match parse_pane_line(line) {
                Some(pane) => panes.push(pane),
                None => tracing::warn!(line, "Ignoring malformed tmux pane line"),
            }
        }
        Ok(panes)
    }

    /// Refresh the pane cache and report what opened or closed since last poll
    pub async fn poll(&self) -> Result<Vec<HostEvent>> {
        let current = self.list_panes().await?;
        let mut panes = self
            .panes
            .lock()
            .map_err(|_| anyhow::anyhow!("pane cache poisoned"))?;
        let events = diff_panes(&panes, &current);
        *panes = current.into_iter().map(|p| (p.id.clone(), p)).collect();
        Ok(events)
    }

    fn with_pane<T>(&self, id: &str, f: impl FnOnce(&PaneRecord) -> T) -> Option<T> {
        self.panes.lock().ok()?.get(id).map(f)
    }
}

impl Default for TmuxHost {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl TerminalHost for TmuxHost {
    async fn name_of(&self, id: &str) -> Option<String> {
        self.with_pane(id, |p| p.display_name().to_string())
    }

    async fn process_id_of(&self, id: &str) -> Option<u32> {
        self.with_pane(id, |p| p.pid)
    }

    async fn cwd_of(&self, pid: u32) -> Option<PathBuf> {
        self.panes
            .lock()
            .ok()?
            .values()
            .find(|p| p.pid == pid)
            .map(|p| p.current_path.clone())
    }

    fn current_workspace_paths(&self) -> Vec<PathBuf> {
        self.workspaces.clone()
    }
}

/// Parse one `list-panes` line; `None` for anything that doesn't fit the format
pub fn parse_pane_line(line: &str) -> Option<PaneRecord> {
    let parts: Vec<&str> = line.splitn(6, '\t').collect();
    if parts.len() < 6 {
        return None;
    }

    let id = parts[0];
    if !id.starts_with('%') {
        return None;
    }
    let pid = parts[1].parse().ok()?;

    Some(PaneRecord {
        id: id.to_string(),
        pid,
        session: parts[2].to_string(),
        current_command: parts[3].to_string(),
        current_path: PathBuf::from(parts[4]),
        title: parts[5].to_string(),
    })
}

/// Events turning `previous` into `current`, closes first
pub fn diff_panes(previous: &HashMap<String, PaneRecord>, current: &[PaneRecord]) -> Vec<HostEvent> {
    let mut closed: Vec<&String> = previous
        .keys()
        .filter(|id| !current.iter().any(|p| &p.id == *id))
        .collect();
    closed.sort();

    let mut events: Vec<HostEvent> = closed
        .into_iter()
        .map(|id| HostEvent::Closed(id.clone()))
        .collect();
    events.extend(
        current
            .iter()
            .filter(|p| !previous.contains_key(&p.id))
            .map(|p| HostEvent::Opened(TerminalHandle::new(&p.id, p.display_name()))),
    );
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pane(id: &str, pid: u32, title: &str) -> PaneRecord {
        PaneRecord {
            id: id.to_string(),
            pid,
            session: "work".to_string(),
            current_command: "zsh".to_string(),
            current_path: PathBuf::from("/repo"),
            title: title.to_string(),
        }
    }

    #[test]
    fn test_parse_pane_line() {
        let pane = parse_pane_line("%3\t4242\twork\tnode\t/home/me/repo\t✳ Claude Code").unwrap();
        assert_eq!(pane.id, "%3");
        assert_eq!(pane.pid, 4242);
        assert_eq!(pane.session, "work");
        assert_eq!(pane.current_path, PathBuf::from("/home/me/repo"));
        assert_eq!(pane.display_name(), "✳ Claude Code");
    }

    #[test]
    fn test_parse_keeps_tabs_in_title() {
        let pane = parse_pane_line("%1\t1\ts\tzsh\t/\ta\tb").unwrap();
        assert_eq!(pane.title, "a\tb");
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(parse_pane_line("").is_none());
        assert!(parse_pane_line("%1\t1\ts").is_none());
        assert!(parse_pane_line("%1\tnotapid\ts\tzsh\t/\ttitle").is_none());
        assert!(parse_pane_line("3\t1\ts\tzsh\t/\ttitle").is_none());
    }

    #[test]
    fn test_untitled_pane_uses_command() {
        let mut p = pane("%1", 1, "  ");
        p.current_command = "claude".to_string();
        assert_eq!(p.display_name(), "claude");
    }

    #[test]
    fn test_diff_panes() {
        let previous: HashMap<String, PaneRecord> = [pane("%1", 1, "a"), pane("%2", 2, "b")]
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        let current = vec![pane("%2", 2, "b"), pane("%3", 3, "claude")];

        let events = diff_panes(&previous, &current);
        assert_eq!(
            events,
            vec![
                HostEvent::Closed("%1".to_string()),
                HostEvent::Opened(TerminalHandle::new("%3", "claude")),
            ]
        );
        assert!(diff_panes(&previous, &previous.values().cloned().collect::<Vec<_>>()).is_empty());
    }

    #[tokio::test]
    async fn test_lookups_use_pane_cache() {
        let host = TmuxHost::new(None);
        {
            let mut panes = host.panes.lock().unwrap();
            panes.insert("%1".to_string(), pane("%1", 77, "claude"));
        }
        assert_eq!(host.name_of("%1").await.as_deref(), Some("claude"));
        assert_eq!(host.process_id_of("%1").await, Some(77));
        assert_eq!(host.cwd_of(77).await, Some(PathBuf::from("/repo")));
        assert_eq!(host.process_id_of("%9").await, None);
    }
}
