use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyEventKind};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use agent_beacon::classifier::SystemInspector;
use agent_beacon::coordination::{generate_window_id, RetryPolicy};
use agent_beacon::host::{HostEvent, TmuxHost};
use agent_beacon::{Config, Coordinator, CoordinatorSettings, StateStore, TerminalClassifier};

mod actions;
mod app;

use actions::Action;
use app::{App, Snapshot};

/// Dashboard of agent sessions across windows, with recovery of crashed ones
#[derive(Debug, Parser)]
#[command(name = "agent-beacon", version, about)]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shared state file, overriding the config
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Only track panes of this tmux session
    #[arg(long)]
    tmux_session: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(path) = cli.state_file {
        config.state_file = Some(path);
    }
    if let Some(session) = cli.tmux_session {
        config.tmux.session = Some(session);
    }

    // The TUI owns stdout, so logs go to a file
    init_logging(&config)?;

    let store = StateStore::new(config.state_file()).with_retry(RetryPolicy {
        attempts: config.coordination.write_attempts,
        jitter_max: Duration::from_millis(config.coordination.jitter_max_ms),
    });
    let host = Arc::new(TmuxHost::new(config.tmux.session.clone()));
    let classifier = Arc::new(TerminalClassifier::new(
        &config.classifier,
        Arc::new(SystemInspector),
    )?);

    if !host.is_server_running().await {
        tracing::warn!("tmux server not running; waiting for panes to appear");
    }

    let coordinator = Coordinator::start(
        generate_window_id(),
        store,
        CoordinatorSettings::from(&config.coordination),
        host.clone(),
        classifier,
    );

    // Create event channel
    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();

    let count_tx = tx.clone();
    coordinator.on_global_count_changed(move |count| {
        let _ = count_tx.send(Action::CountChanged(count));
    });

    // Spawn input handler
    let input_tx = tx.clone();
    tokio::task::spawn_blocking(move || loop {
        if input_tx.is_closed() {
            break;
        }
        if event::poll(Duration::from_millis(100)).unwrap_or(false) {
            if let Ok(Event::Key(key)) = event::read() {
                if key.kind == KeyEventKind::Press {
                    let _ = input_tx.send(Action::KeyPress(key));
                }
            }
        }
    });

    // Spawn tmux poller
    let poll_tx = tx.clone();
    let poll_interval = Duration::from_millis(config.tmux.poll_interval_ms);
    let poll_host = host.clone();
    let poller = tokio::spawn(async move {
        loop {
            match poll_host.poll().await {
                Ok(events) if events.is_empty() => {}
                Ok(events) => {
                    let _ = poll_tx.send(Action::Host(events));
                }
                Err(e) => {
                    let _ = poll_tx.send(Action::Error(format!("Tmux: {}", e)));
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    });

    let mut terminal = ratatui::init();
    let mut app = App::new(
        coordinator.window_id().to_string(),
        config.recovery.resume_command.clone(),
    );
    app.pending_actions.push(Action::Refresh);

    // Main event loop
    let result = loop {
        if let Err(e) = terminal.draw(|f| app.render(f)) {
            break Err(e.into());
        }

        // Process any pending actions from the app
        for pending_action in app.take_pending_actions() {
            match pending_action {
                Action::Refresh => {
                    let _ = tx.send(Action::Snapshot(snapshot(&coordinator).await));
                }
                Action::CopyResume(command) => {
                    app.message = Some(match copy_to_clipboard(&command) {
                        Ok(()) => format!("Resume command copied: {}", command),
                        Err(e) => format!("Clipboard error: {}", e),
                    });
                }
                Action::ClearStale => {
                    app.message = Some(match coordinator.clear_stale_sessions().await {
                        Ok(count) => format!("Cleared {} stale window(s)", count),
                        Err(e) => format!("Failed to clear: {}", e),
                    });
                    let _ = tx.send(Action::Snapshot(snapshot(&coordinator).await));
                }
                _ => {}
            }
        }

        // Handle events from channel
        let Some(action) = rx.recv().await else {
            break Ok(());
        };
        let action = match action {
            Action::Host(events) => {
                for host_event in events {
                    match host_event {
                        HostEvent::Opened(handle) => coordinator.terminal_opened(handle),
                        HostEvent::Closed(id) => coordinator.terminal_closed(&id),
                    }
                }
                Action::Refresh
            }
            other => other,
        };
        if matches!(action, Action::Refresh) {
            app.pending_actions.push(action);
            continue;
        }
        match app.handle_action(action) {
            Ok(true) => break Ok(()),
            Ok(false) => {}
            Err(e) => break Err(e),
        }
    };

    // Restore terminal
    ratatui::restore();
    poller.abort();
    drop(rx);
    coordinator.shutdown().await;
    result
}

async fn snapshot(coordinator: &Coordinator) -> Snapshot {
    Snapshot {
        total_count: coordinator.total_count().await,
        local: coordinator.local_terminals(),
        recoverable: coordinator.recoverable_sessions().await,
    }
}

fn copy_to_clipboard(text: &str) -> Result<()> {
    let mut clipboard = arboard::Clipboard::new()?;
    clipboard.set_text(text)?;
    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    let path = config.log_file();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}
