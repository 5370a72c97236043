//! Decides whether a terminal is running an agent session.
//!
//! Fast path: the terminal's name carries a marker. Slow path: look up the
//! terminal's root process and match its command line, then its direct
//! children (the agent usually runs under a shell). The process id is often
//! not known yet when a terminal opens, so the slow path polls a bounded
//! number of times. A terminal that runs out of attempts is left untracked
//! for good.

mod process;

pub use process::{
    parse_command_output, parse_pid_list, parse_wmic_values, ProcessInspector, SystemInspector,
};

use once_cell::sync::Lazy;
use regex::Regex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{ClassifierConfig, DEFAULT_COMMAND_PATTERN};
use crate::error::ConfigError;
use crate::host::{TerminalHandle, TerminalHost};

static DEFAULT_AGENT_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(DEFAULT_COMMAND_PATTERN).unwrap());

/// What identified a terminal as an agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    Name,
    CommandLine,
    ChildProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UntrackedReason {
    /// The terminal closed before (or while) it was classified
    Closed,
    /// No match within the polling budget
    Exhausted,
}

/// Final outcome for a terminal; never revisited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Tracked { pid: Option<u32>, source: MatchSource },
    Untracked(UntrackedReason),
}

pub struct TerminalClassifier {
    /// Lowercased name markers
    name_markers: Vec<String>,
    command_pattern: Regex,
    inspector: Arc<dyn ProcessInspector>,
    poll_attempts: u32,
    poll_interval: Duration,
    query_timeout: Duration,
}

impl TerminalClassifier {
    pub fn new(
        config: &ClassifierConfig,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Result<Self, ConfigError> {
        let command_pattern = if config.command_pattern == DEFAULT_COMMAND_PATTERN {
            DEFAULT_AGENT_COMMAND.clone()
        } else {
            Regex::new(&config.command_pattern)?
        };

        Ok(Self {
            name_markers: config
                .name_markers
                .iter()
                .filter(|m| !m.is_empty())
                .map(|m| m.to_lowercase())
                .collect(),
            command_pattern,
            inspector,
            poll_attempts: config.poll_attempts.max(1),
            poll_interval: config.poll_interval(),
            query_timeout: config.query_timeout(),
        })
    }

    pub fn name_matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.name_markers.iter().any(|m| name.contains(m.as_str()))
    }

    pub fn command_matches(&self, command_line: &str) -> bool {
        self.command_pattern.is_match(command_line)
    }

    /// Classify a freshly opened terminal.
    ///
    /// `is_open` is consulted before every attempt so polling stops as soon
    /// as the terminal goes away. A `Tracked` result still has to be checked
    /// against a fresh `is_open` by the caller before registering.
    pub async fn classify(
        &self,
        terminal: &TerminalHandle,
        host: &dyn TerminalHost,
        is_open: &(dyn Fn() -> bool + Send + Sync),
    ) -> Classification {
        if self.name_matches(&terminal.name) {
            let pid = self.bounded(host.process_id_of(&terminal.id)).await.flatten();
            return Classification::Tracked {
                pid,
                source: MatchSource::Name,
            };
        }

        for attempt in 1..=self.poll_attempts {
            if !is_open() {
                debug!(terminal = %terminal.id, attempt, "Terminal closed during classification");
                return Classification::Untracked(UntrackedReason::Closed);
            }

            // Names can change after launch (e.g. the agent sets a title)
            if let Some(name) = self.bounded(host.name_of(&terminal.id)).await.flatten() {
                if self.name_matches(&name) {
                    let pid = self.bounded(host.process_id_of(&terminal.id)).await.flatten();
                    return Classification::Tracked {
                        pid,
                        source: MatchSource::Name,
                    };
                }
            }

            if let Some(pid) = self.bounded(host.process_id_of(&terminal.id)).await.flatten() {
                if let Some(source) = self.inspect_process(pid).await {
                    return Classification::Tracked {
                        pid: Some(pid),
                        source,
                    };
                }
            }

            if attempt < self.poll_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        debug!(terminal = %terminal.id, attempts = self.poll_attempts, "No agent found in terminal");
        Classification::Untracked(UntrackedReason::Exhausted)
    }

    /// Match the process, then its direct children
    async fn inspect_process(&self, pid: u32) -> Option<MatchSource> {
        let command = self
            .bounded(self.inspector.command_line_of(pid))
            .await
            .flatten();
        if command.is_some_and(|c| self.command_matches(&c)) {
            return Some(MatchSource::CommandLine);
        }

        let children = self
            .bounded(self.inspector.child_processes_of(pid))
            .await
            .unwrap_or_default();
        for child in children {
            let command = self
                .bounded(self.inspector.command_line_of(child))
                .await
                .flatten();
            if command.is_some_and(|c| self.command_matches(&c)) {
                return Some(MatchSource::ChildProcess);
            }
        }
        None
    }

    /// Run an OS or host query under the per-query timeout; `None` on timeout
    async fn bounded<T>(&self, query: impl Future<Output = T>) -> Option<T> {
        match tokio::time::timeout(self.query_timeout, query).await {
            Ok(value) => Some(value),
            Err(_) => {
                debug!(timeout_ms = self.query_timeout.as_millis() as u64, "Process query timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeInspector {
        commands: HashMap<u32, String>,
        children: HashMap<u32, Vec<u32>>,
        hang: bool,
    }

    #[async_trait]
    impl ProcessInspector for FakeInspector {
        async fn command_line_of(&self, pid: u32) -> Option<String> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.commands.get(&pid).cloned()
        }

        async fn child_processes_of(&self, pid: u32) -> Vec<u32> {
            self.children.get(&pid).cloned().unwrap_or_default()
        }
    }

    /// Host whose pid shows up only after `pid_after` lookups
    struct FakeHost {
        name: Mutex<String>,
        pid: u32,
        pid_after: u32,
        lookups: AtomicU32,
    }

    impl FakeHost {
        fn new(name: &str, pid: u32, pid_after: u32) -> Self {
            Self {
                name: Mutex::new(name.to_string()),
                pid,
                pid_after,
                lookups: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl TerminalHost for FakeHost {
        async fn name_of(&self, _id: &str) -> Option<String> {
            Some(self.name.lock().unwrap().clone())
        }

        async fn process_id_of(&self, _id: &str) -> Option<u32> {
            let n = self.lookups.fetch_add(1, Ordering::SeqCst);
            (n >= self.pid_after).then_some(self.pid)
        }

        async fn cwd_of(&self, _pid: u32) -> Option<PathBuf> {
            None
        }

        fn current_workspace_paths(&self) -> Vec<PathBuf> {
            Vec::new()
        }
    }

    fn config() -> ClassifierConfig {
        ClassifierConfig {
            poll_attempts: 5,
            poll_interval_ms: 5,
            query_timeout_ms: 100,
            ..ClassifierConfig::default()
        }
    }

    fn classifier(inspector: FakeInspector) -> TerminalClassifier {
        TerminalClassifier::new(&config(), Arc::new(inspector)).unwrap()
    }

    fn always_open() -> impl Fn() -> bool + Send + Sync {
        || true
    }

    #[test]
    fn test_default_command_pattern() {
        let c = classifier(FakeInspector::default());
        assert!(c.command_matches("claude"));
        assert!(c.command_matches("/usr/local/bin/claude --resume"));
        assert!(c.command_matches("node /opt/node_modules/@anthropic-ai/claude-code/cli.js"));
        assert!(c.command_matches(r"C:\Users\me\AppData\Roaming\npm\claude.cmd"));
        assert!(!c.command_matches("vim claude-notes.md"));
        assert!(!c.command_matches("-zsh"));
    }

    #[test]
    fn test_name_match_is_case_insensitive() {
        let c = classifier(FakeInspector::default());
        assert!(c.name_matches("Claude Code"));
        assert!(c.name_matches("✳ claude"));
        assert!(!c.name_matches("zsh"));
    }

    #[tokio::test]
    async fn test_fast_path_by_name() {
        let c = classifier(FakeInspector::default());
        let host = FakeHost::new("Claude", 10, 0);
        let result = c
            .classify(&TerminalHandle::new("t1", "Claude"), &host, &always_open())
            .await;
        assert_eq!(
            result,
            Classification::Tracked {
                pid: Some(10),
                source: MatchSource::Name
            }
        );
    }

    #[tokio::test]
    async fn test_slow_path_waits_for_pid() {
        let inspector = FakeInspector {
            commands: [(10, "claude".to_string())].into(),
            ..Default::default()
        };
        let c = classifier(inspector);
        let host = FakeHost::new("zsh", 10, 3);
        let result = c
            .classify(&TerminalHandle::new("t1", "zsh"), &host, &always_open())
            .await;
        assert_eq!(
            result,
            Classification::Tracked {
                pid: Some(10),
                source: MatchSource::CommandLine
            }
        );
    }

    #[tokio::test]
    async fn test_agent_as_child_of_shell() {
        let inspector = FakeInspector {
            commands: [(10, "-zsh".to_string()), (11, "git status".to_string()), (12, "claude".to_string())].into(),
            children: [(10, vec![11, 12])].into(),
            ..Default::default()
        };
        let c = classifier(inspector);
        let host = FakeHost::new("zsh", 10, 0);
        let result = c
            .classify(&TerminalHandle::new("t1", "zsh"), &host, &always_open())
            .await;
        assert_eq!(
            result,
            Classification::Tracked {
                pid: Some(10),
                source: MatchSource::ChildProcess
            }
        );
    }

    #[tokio::test]
    async fn test_plain_shell_exhausts_budget() {
        let inspector = FakeInspector {
            commands: [(10, "-zsh".to_string())].into(),
            ..Default::default()
        };
        let c = classifier(inspector);
        let host = FakeHost::new("zsh", 10, 0);
        let result = c
            .classify(&TerminalHandle::new("t1", "zsh"), &host, &always_open())
            .await;
        assert_eq!(result, Classification::Untracked(UntrackedReason::Exhausted));
        // One pid lookup per attempt
        assert_eq!(host.lookups.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_name_change_during_polling() {
        let c = classifier(FakeInspector::default());
        let host = FakeHost::new("zsh", 10, u32::MAX);
        *host.name.lock().unwrap() = "Claude Code".to_string();
        let result = c
            .classify(&TerminalHandle::new("t1", "zsh"), &host, &always_open())
            .await;
        assert!(matches!(
            result,
            Classification::Tracked {
                source: MatchSource::Name,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_close_stops_polling() {
        let c = classifier(FakeInspector::default());
        let host = FakeHost::new("zsh", 10, u32::MAX);
        let open = AtomicBool::new(true);
        let is_open = || {
            let was_open = open.load(Ordering::SeqCst);
            // Close right after the first check
            open.store(false, Ordering::SeqCst);
            was_open
        };
        let result = c
            .classify(&TerminalHandle::new("t1", "zsh"), &host, &is_open)
            .await;
        assert_eq!(result, Classification::Untracked(UntrackedReason::Closed));
        assert_eq!(host.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hung_query_is_bounded() {
        let inspector = FakeInspector {
            hang: true,
            ..Default::default()
        };
        let c = classifier(inspector);
        let host = FakeHost::new("zsh", 10, 0);
        let started = std::time::Instant::now();
        let result = c
            .classify(&TerminalHandle::new("t1", "zsh"), &host, &always_open())
            .await;
        assert_eq!(result, Classification::Untracked(UntrackedReason::Exhausted));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
