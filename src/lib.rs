//! Cross-window tracking of AI agent terminal sessions.
//!
//! Independent, crash-prone processes ("windows") each track the agent
//! terminals they own and publish them to a shared JSON file. Every window
//! heartbeats its own entry; an entry that stops being refreshed marks a
//! crashed window whose sessions can be offered for recovery.

pub mod classifier;
pub mod config;
pub mod coordination;
pub mod error;
pub mod host;

pub use classifier::{Classification, TerminalClassifier};
pub use config::Config;
pub use coordination::{
    Coordinator, CoordinatorSettings, RecoverableSession, StalenessOracle, StateStore,
    TrackedTerminal,
};
pub use error::{ConfigError, StoreError};
