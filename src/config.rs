use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

const APP_DIR: &str = "agent-beacon";

/// Default pattern for agent command lines: a `claude` executable (bare,
/// by path, or a Windows shim) or the npm package entry point.
pub const DEFAULT_COMMAND_PATTERN: &str =
    r"(?i)(^|[\s/\\])claude(\.exe|\.cmd)?(\s|$)|@anthropic-ai[/\\]claude-code";

/// Top-level configuration, loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Override for the shared state file location
    pub state_file: Option<PathBuf>,
    pub coordination: CoordinationConfig,
    pub classifier: ClassifierConfig,
    pub tmux: TmuxConfig,
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub heartbeat_interval_ms: u64,
    /// A window whose last heartbeat is older than this is treated as crashed
    pub stale_threshold_ms: u64,
    pub change_debounce_ms: u64,
    pub write_attempts: u32,
    pub jitter_max_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            stale_threshold_ms: 30_000,
            change_debounce_ms: 100,
            write_attempts: 3,
            jitter_max_ms: 50,
        }
    }
}

impl CoordinationConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn change_debounce(&self) -> Duration {
        Duration::from_millis(self.change_debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Case-insensitive substrings that mark a terminal name as an agent session
    pub name_markers: Vec<String>,
    /// Regex matched against process command lines
    pub command_pattern: String,
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
    /// Upper bound on a single OS process query
    pub query_timeout_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            name_markers: vec!["claude".to_string()],
            command_pattern: DEFAULT_COMMAND_PATTERN.to_string(),
            poll_attempts: 10,
            poll_interval_ms: 100,
            query_timeout_ms: 1_000,
        }
    }
}

impl ClassifierConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TmuxConfig {
    /// Only track panes of this session; all sessions when unset
    pub session: Option<String>,
    pub poll_interval_ms: u64,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            session: None,
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Command that resumes an agent session in its working directory
    pub resume_command: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            resume_command: "claude --continue".to_string(),
        }
    }
}

impl Config {
    /// Load from an explicit path, or from the default location if it exists,
    /// or fall back to defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => {
                    tracing::debug!("No config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse { path, source },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.coordination;
        if c.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if c.stale_threshold_ms <= c.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "stale_threshold_ms ({}) must exceed heartbeat_interval_ms ({})",
                c.stale_threshold_ms, c.heartbeat_interval_ms
            )));
        }
        if c.write_attempts == 0 {
            return Err(ConfigError::Invalid(
                "write_attempts must be at least 1".to_string(),
            ));
        }
        regex::Regex::new(&self.classifier.command_pattern)?;
        Ok(())
    }

    /// Where the shared record lives
    pub fn state_file(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| app_dir().join("windows.json"))
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_file()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(app_dir)
            .join("agent-beacon.log")
    }
}

fn app_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_default()
        .join(APP_DIR)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
}
