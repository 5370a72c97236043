use std::time::Duration;

use super::{CoordinationState, RecoverableSession, WindowState, WindowTerminal};

/// Classifies windows as active or stale (crash-suspected).
///
/// Holds only the threshold; every method is a pure function of the state
/// and the supplied `now` (epoch ms).
#[derive(Debug, Clone, Copy)]
pub struct StalenessOracle {
    threshold_ms: i64,
}

impl StalenessOracle {
    pub const DEFAULT_THRESHOLD: Duration = Duration::from_secs(30);

    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold_ms: i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Stale iff strictly more than the threshold has elapsed. A timestamp
    /// in the future (clock skew) counts as fresh.
    pub fn is_stale(&self, window: &WindowState, now: i64) -> bool {
        let elapsed = now.saturating_sub(window.last_update).max(0);
        elapsed > self.threshold_ms
    }

    pub fn active_windows<'a>(
        &self,
        state: &'a CoordinationState,
        now: i64,
    ) -> impl Iterator<Item = &'a WindowState> + 'a {
        let oracle = *self;
        state
            .windows
            .values()
            .filter(move |w| !oracle.is_stale(w, now))
    }

    pub fn stale_windows<'a>(
        &self,
        state: &'a CoordinationState,
        now: i64,
    ) -> impl Iterator<Item = &'a WindowState> + 'a {
        let oracle = *self;
        state
            .windows
            .values()
            .filter(move |w| oracle.is_stale(w, now))
    }

    pub fn stale_window_ids(&self, state: &CoordinationState, now: i64) -> Vec<String> {
        self.stale_windows(state, now)
            .map(|w| w.window_id.clone())
            .collect()
    }

    /// Number of agent sessions running anywhere
    pub fn total_active_terminal_count(&self, state: &CoordinationState, now: i64) -> usize {
        self.active_windows(state, now)
            .map(|w| w.terminals.len())
            .sum()
    }

    pub fn active_terminals(&self, state: &CoordinationState, now: i64) -> Vec<WindowTerminal> {
        self.active_windows(state, now)
            .flat_map(|w| {
                w.terminals.iter().map(move |t| WindowTerminal {
                    window_id: w.window_id.clone(),
                    terminal: t.clone(),
                })
            })
            .collect()
    }

    /// Every terminal of every stale window, not deduplicated
    pub fn recoverable_sessions(
        &self,
        state: &CoordinationState,
        now: i64,
    ) -> Vec<RecoverableSession> {
        self.stale_windows(state, now)
            .flat_map(|w| {
                w.terminals.iter().map(move |t| RecoverableSession {
                    name: t.name.clone(),
                    workspace_path: t.workspace_path.clone(),
                    window_id: w.window_id.clone(),
                    last_update: w.last_update,
                })
            })
            .collect()
    }
}

impl Default for StalenessOracle {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::TerminalInfo;

    const NOW: i64 = 1_700_000_000_000;

    fn state(windows: &[(&str, i64, usize)]) -> CoordinationState {
        let mut state = CoordinationState::default();
        for (id, age_ms, count) in windows {
            state.windows.insert(
                id.to_string(),
                WindowState {
                    window_id: id.to_string(),
                    pid: 1,
                    last_update: NOW - age_ms,
                    terminals: (0..*count)
                        .map(|i| TerminalInfo::new("claude", format!("/{id}/{i}")))
                        .collect(),
                },
            );
        }
        state
    }

    #[test]
    fn test_threshold_boundary() {
        let oracle = StalenessOracle::default();
        let s = state(&[("young", 29_000, 1), ("exact", 30_000, 1), ("old", 31_000, 1)]);
        assert!(!oracle.is_stale(&s.windows["young"], NOW));
        assert!(!oracle.is_stale(&s.windows["exact"], NOW));
        assert!(oracle.is_stale(&s.windows["old"], NOW));
    }

    #[test]
    fn test_future_timestamp_is_active() {
        let oracle = StalenessOracle::default();
        let s = state(&[("skewed", -60_000, 1)]);
        assert!(!oracle.is_stale(&s.windows["skewed"], NOW));
    }

    #[test]
    fn test_count_only_active_terminals() {
        let oracle = StalenessOracle::default();
        let s = state(&[("a", 1_000, 2), ("b", 5_000, 3), ("dead", 60_000, 4)]);
        assert_eq!(oracle.total_active_terminal_count(&s, NOW), 5);
        assert_eq!(oracle.active_terminals(&s, NOW).len(), 5);
        assert_eq!(oracle.stale_window_ids(&s, NOW), vec!["dead".to_string()]);
    }

    #[test]
    fn test_recoverable_sessions_tagged_with_window() {
        let oracle = StalenessOracle::default();
        let s = state(&[("alive", 0, 1), ("dead", 45_000, 2)]);
        let sessions = oracle.recoverable_sessions(&s, NOW);
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|r| r.window_id == "dead"));
        assert!(sessions.iter().all(|r| r.last_update == NOW - 45_000));
    }

    #[test]
    fn test_custom_threshold() {
        let oracle = StalenessOracle::new(Duration::from_secs(5));
        let s = state(&[("a", 6_000, 1)]);
        assert_eq!(oracle.total_active_terminal_count(&s, NOW), 0);
        assert_eq!(oracle.recoverable_sessions(&s, NOW).len(), 1);
    }

    #[test]
    fn test_threshold_beyond_i64_saturates() {
        let oracle = StalenessOracle::new(Duration::MAX);
        let s = state(&[("ancient", 365 * 86_400_000, 1)]);
        assert!(!oracle.is_stale(&s.windows["ancient"], NOW));
        assert_eq!(oracle.total_active_terminal_count(&s, NOW), 1);
    }
}
