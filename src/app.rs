use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph},
    Frame,
};

use agent_beacon::{RecoverableSession, TrackedTerminal};

use crate::actions::Action;

/// Dashboard colors
pub struct Theme {
    pub fg: Color,
    pub accent: Color,
    pub dim: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            fg: Color::Rgb(220, 220, 220),
            accent: Color::Rgb(217, 119, 87), // Claude orange
            dim: Color::Rgb(100, 100, 100),
            success: Color::Rgb(80, 200, 120),
            warning: Color::Rgb(255, 193, 7),
            error: Color::Rgb(220, 53, 69),
        }
    }
}

/// Everything the dashboard shows, read from the coordinator in one go
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub total_count: usize,
    pub local: Vec<TrackedTerminal>,
    pub recoverable: Vec<RecoverableSession>,
}

/// Which list has focus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pane {
    Local,
    Recoverable,
}

/// Input mode for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    ConfirmingClear,
}

/// Main application state
pub struct App {
    pub window_id: String,
    pub total_count: usize,
    pub local: Vec<TrackedTerminal>,
    pub recoverable: Vec<RecoverableSession>,
    pub focus: Pane,
    pub local_state: ListState,
    pub recoverable_state: ListState,
    /// Current message to display (info or error)
    pub message: Option<String>,
    pub theme: Theme,
    pub input_mode: InputMode,
    /// Program run by copied resume commands
    pub resume_command: String,
    /// Pending action queue
    pub pending_actions: Vec<Action>,
}

impl App {
    pub fn new(window_id: String, resume_command: String) -> Self {
        Self {
            window_id,
            total_count: 0,
            local: Vec::new(),
            recoverable: Vec::new(),
            focus: Pane::Local,
            local_state: ListState::default(),
            recoverable_state: ListState::default(),
            message: None,
            theme: Theme::default(),
            input_mode: InputMode::Normal,
            resume_command,
            pending_actions: Vec::new(),
        }
    }

    /// Get the currently selected recoverable session
    pub fn selected_recoverable(&self) -> Option<&RecoverableSession> {
        self.recoverable_state
            .selected()
            .and_then(|i| self.recoverable.get(i))
    }

    /// Take pending actions (drains the queue)
    pub fn take_pending_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending_actions)
    }

    pub fn apply_snapshot(&mut self, snapshot: Snapshot) {
        self.total_count = snapshot.total_count;
        self.local = snapshot.local;
        self.recoverable = snapshot.recoverable;
        clamp_selection(&mut self.local_state, self.local.len());
        clamp_selection(&mut self.recoverable_state, self.recoverable.len());
    }

    /// Handle an action and return whether to quit
    pub fn handle_action(&mut self, action: Action) -> Result<bool> {
        match action {
            Action::KeyPress(key) => self.handle_key(key),
            Action::Snapshot(snapshot) => {
                self.apply_snapshot(snapshot);
                Ok(false)
            }
            Action::CountChanged(count) => {
                self.total_count = count;
                self.pending_actions.push(Action::Refresh);
                Ok(false)
            }
            Action::Error(msg) => {
                self.message = Some(msg);
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        // Clear message on any key press
        if self.message.is_some() && self.input_mode == InputMode::Normal {
            self.message = None;
        }

        match self.input_mode {
            InputMode::Normal => self.handle_normal_key(key),
            InputMode::ConfirmingClear => self.handle_confirming_key(key),
        }
    }

    fn handle_normal_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Ok(true);
            }
            KeyCode::Char('j') | KeyCode::Down => self.move_selection(1),
            KeyCode::Char('k') | KeyCode::Up => self.move_selection(-1),
            KeyCode::Tab => {
                self.focus = match self.focus {
                    Pane::Local => Pane::Recoverable,
                    Pane::Recoverable => Pane::Local,
                };
            }
            KeyCode::Char('y') | KeyCode::Enter => {
                if let Some(session) = self.selected_recoverable() {
                    let command = session.resume_command(&self.resume_command);
                    self.pending_actions.push(Action::CopyResume(command));
                }
            }
            KeyCode::Char('c') => {
                if self.recoverable.is_empty() {
                    self.message = Some("No stale sessions to clear".to_string());
                } else {
                    self.input_mode = InputMode::ConfirmingClear;
                }
            }
            KeyCode::Char('r') => self.pending_actions.push(Action::Refresh),
            _ => {}
        }
        Ok(false)
    }

    fn handle_confirming_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') => {
                self.pending_actions.push(Action::ClearStale);
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
            }
            _ => {}
        }
        Ok(false)
    }

    fn move_selection(&mut self, delta: isize) {
        let (state, len) = match self.focus {
            Pane::Local => (&mut self.local_state, self.local.len()),
            Pane::Recoverable => (&mut self.recoverable_state, self.recoverable.len()),
        };
        if len == 0 {
            return;
        }
        let i = match state.selected() {
            Some(i) => (i as isize + delta).rem_euclid(len as isize) as usize,
            None => 0,
        };
        state.select(Some(i));
    }

    pub fn render(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(0),    // Main content
                Constraint::Length(3), // Footer/status
            ])
            .split(frame.area());

        self.render_header(frame, chunks[0]);
        self.render_main(frame, chunks[1]);
        self.render_footer(frame, chunks[2]);

        if self.input_mode == InputMode::ConfirmingClear {
            self.render_confirm_dialog(frame);
        }
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let title = Paragraph::new(Line::from(vec![
            Span::styled(
                " AgentBeacon ",
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!("│ {} active agent sessions ", self.total_count),
                Style::default().fg(self.theme.fg),
            ),
            Span::styled(
                format!("│ window {}", self.window_id),
                Style::default().fg(self.theme.dim),
            ),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(title, area);
    }

    fn render_main(&mut self, frame: &mut Frame, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Percentage(50), // Local terminals
                Constraint::Percentage(50), // Recoverable sessions
            ])
            .split(area);

        self.render_local_list(frame, chunks[0]);
        self.render_recoverable_list(frame, chunks[1]);
    }

    fn pane_block(&self, title: &'static str, pane: Pane) -> Block<'static> {
        let border = if self.focus == pane {
            self.theme.accent
        } else {
            self.theme.dim
        };
        Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(Style::default().fg(border))
    }

    fn render_local_list(&mut self, frame: &mut Frame, area: Rect) {
        let items: Vec<ListItem> = if self.local.is_empty() {
            vec![ListItem::new(Line::from(Span::styled(
                "  No agent sessions in this window.",
                Style::default().fg(self.theme.dim),
            )))]
        } else {
            self.local
                .iter()
                .map(|terminal| {
                    ListItem::new(Line::from(vec![
                        Span::styled("● ", Style::default().fg(self.theme.success)),
                        Span::styled(terminal.name.clone(), Style::default().fg(self.theme.fg)),
                        Span::styled(
                            format!("  {}", terminal.workspace_path),
                            Style::default().fg(self.theme.dim),
                        ),
                    ]))
                })
                .collect()
        };

        let list = List::new(items)
            .block(self.pane_block(" This Window ", Pane::Local))
            .highlight_style(
                Style::default()
                    .bg(Color::Rgb(50, 50, 50))
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("▶ ");

        frame.render_stateful_widget(list, area, &mut self.local_state);
    }

    fn render_recoverable_list(&mut self, frame: &mut Frame, area: Rect) {
        let now = chrono::Utc::now().timestamp_millis();
        let items: Vec<ListItem> = if self.recoverable.is_empty() {
            vec![ListItem::new(Line::from(Span::styled(
                "  Nothing to recover.",
                Style::default().fg(self.theme.dim),
            )))]
        } else {
            self.recoverable
                .iter()
                .map(|session| {
                    ListItem::new(Line::from(vec![
                        Span::styled("✗ ", Style::default().fg(self.theme.warning)),
                        Span::styled(
                            session.workspace_path.clone(),
                            Style::default().fg(self.theme.fg),
                        ),
                        Span::styled(
                            format!("  {} · {}", session.name, format_age(session.last_update, now)),
                            Style::default().fg(self.theme.dim),
                        ),
                    ]))
                })
                .collect()
        };

        let list = List::new(items)
            .block(self.pane_block(" Recoverable ", Pane::Recoverable))
            .highlight_style(
                Style::default()
                    .bg(Color::Rgb(50, 50, 50))
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("▶ ");

        frame.render_stateful_widget(list, area, &mut self.recoverable_state);
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let help_text =
            " q: Quit │ j/k: Navigate │ Tab: Switch pane │ y: Copy resume command │ c: Clear stale │ r: Refresh ";

        let content = if let Some(ref msg) = self.message {
            let style = if msg.contains("copied") || msg.contains("Cleared") {
                Style::default().fg(self.theme.success)
            } else {
                Style::default().fg(self.theme.error)
            };
            Line::from(Span::styled(format!(" {} ", msg), style))
        } else {
            Line::from(Span::styled(help_text, Style::default().fg(self.theme.dim)))
        };

        let footer = Paragraph::new(content).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(footer, area);
    }

    fn render_confirm_dialog(&self, frame: &mut Frame) {
        let area = centered_rect(50, 20, frame.area());

        frame.render_widget(Clear, area);

        let block = Block::default()
            .title(" Clear Stale Sessions ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.error));

        let inner = block.inner(area);
        frame.render_widget(block, area);

        let text = vec![
            Line::from(""),
            Line::from(Span::styled(
                format!("Forget {} recoverable session(s)?", self.recoverable.len()),
                Style::default().fg(self.theme.fg),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "They will no longer be offered for recovery.",
                Style::default().fg(self.theme.warning),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "Press 'y' to confirm, 'n' or Esc to cancel",
                Style::default().fg(self.theme.dim),
            )),
        ];

        let paragraph = Paragraph::new(text);
        frame.render_widget(paragraph, inner);
    }
}

fn clamp_selection(state: &mut ListState, len: usize) {
    match state.selected() {
        _ if len == 0 => state.select(None),
        Some(i) if i >= len => state.select(Some(len - 1)),
        None => state.select(Some(0)),
        Some(_) => {}
    }
}

/// Coarse "how long ago" for epoch-ms timestamps
pub fn format_age(then_ms: i64, now_ms: i64) -> String {
    let secs = (now_ms - then_ms).max(0) / 1000;
    match secs {
        s if s < 60 => format!("{s}s ago"),
        s if s < 3600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3600),
        s => format!("{}d ago", s / 86_400),
    }
}

/// Helper function to create a centered rectangle
fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> Action {
        Action::KeyPress(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn session(path: &str) -> RecoverableSession {
        RecoverableSession {
            name: "claude".to_string(),
            workspace_path: path.to_string(),
            window_id: "1-1".to_string(),
            last_update: 0,
        }
    }

    fn app_with_recoverable() -> App {
        let mut app = App::new("me".to_string(), "claude --continue".to_string());
        app.apply_snapshot(Snapshot {
            total_count: 2,
            local: Vec::new(),
            recoverable: vec![session("/a"), session("/b")],
        });
        app
    }

    #[test]
    fn test_quit_keys() {
        let mut app = App::new("me".to_string(), String::new());
        assert!(app.handle_action(key(KeyCode::Char('q'))).unwrap());
        let ctrl_c = Action::KeyPress(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL));
        assert!(app.handle_action(ctrl_c).unwrap());
    }

    #[test]
    fn test_copy_resume_for_selected_session() {
        let mut app = app_with_recoverable();
        app.handle_action(key(KeyCode::Tab)).unwrap();
        app.handle_action(key(KeyCode::Char('j'))).unwrap();
        app.handle_action(key(KeyCode::Char('y'))).unwrap();

        let actions = app.take_pending_actions();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::CopyResume(cmd) => assert_eq!(cmd, "cd '/b' && claude --continue"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_clear_requires_confirmation() {
        let mut app = app_with_recoverable();
        app.handle_action(key(KeyCode::Char('c'))).unwrap();
        assert_eq!(app.input_mode, InputMode::ConfirmingClear);
        assert!(app.take_pending_actions().is_empty());

        app.handle_action(key(KeyCode::Esc)).unwrap();
        assert_eq!(app.input_mode, InputMode::Normal);
        assert!(app.take_pending_actions().is_empty());

        app.handle_action(key(KeyCode::Char('c'))).unwrap();
        app.handle_action(key(KeyCode::Char('y'))).unwrap();
        assert!(matches!(
            app.take_pending_actions().as_slice(),
            [Action::ClearStale]
        ));
    }

    #[test]
    fn test_clear_with_nothing_stale() {
        let mut app = App::new("me".to_string(), String::new());
        app.handle_action(key(KeyCode::Char('c'))).unwrap();
        assert_eq!(app.input_mode, InputMode::Normal);
        assert!(app.message.is_some());
    }

    #[test]
    fn test_count_change_requests_refresh() {
        let mut app = App::new("me".to_string(), String::new());
        app.handle_action(Action::CountChanged(4)).unwrap();
        assert_eq!(app.total_count, 4);
        assert!(matches!(app.take_pending_actions().as_slice(), [Action::Refresh]));
    }

    #[test]
    fn test_snapshot_clamps_selection() {
        let mut app = app_with_recoverable();
        app.recoverable_state.select(Some(1));
        app.apply_snapshot(Snapshot {
            total_count: 0,
            local: Vec::new(),
            recoverable: vec![session("/a")],
        });
        assert_eq!(app.recoverable_state.selected(), Some(0));

        app.apply_snapshot(Snapshot::default());
        assert_eq!(app.recoverable_state.selected(), None);
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(0, 5_000), "5s ago");
        assert_eq!(format_age(0, 125_000), "2m ago");
        assert_eq!(format_age(0, 7_200_000), "2h ago");
        assert_eq!(format_age(0, 2 * 86_400_000), "2d ago");
        assert_eq!(format_age(10_000, 0), "0s ago");
    }
}
