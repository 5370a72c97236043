use std::path::PathBuf;

/// Errors from the shared coordination record.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The record (or its directory) could not be read or written.
    #[error("state file unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize coordination state: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Our own entry kept getting clobbered by concurrent writers.
    #[error("write conflict on window {window_id} after {attempts} attempts")]
    Conflict { window_id: String, attempts: u32 },

    #[error("store task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub(crate) fn unavailable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Unavailable {
            path: path.into(),
            source,
        }
    }
}

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid command pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
