//! Error types for the agent configuration distribution core.
//!
//! Most failures inside the core's hot loops (intake, reconciliation) are
//! logged and absorbed in place — nothing encountered while handling an
//! individual agent is allowed to take the whole daemon down. [`CoreError`]
//! exists for the smaller set of bootstrap-time failures that do need to
//! propagate to `main` as a typed value, plus [`ConfigError`] for
//! configuration loading.

use std::fmt;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// CoreError
// ---------------------------------------------------------------------------

/// Unified error type for bootstrap-time failures in the reconciliation core.
#[derive(Debug)]
pub enum CoreError {
    /// The shared-configuration directory could not be opened.
    SharedDirUnavailable {
        /// Path that could not be opened.
        path: PathBuf,
        /// Underlying I/O error description.
        detail: String,
    },

    /// The agent-info directory could not be created.
    AgentInfoDirUnavailable {
        /// Path that could not be created.
        path: PathBuf,
        /// Underlying I/O error description.
        detail: String,
    },

    /// A configuration value failed validation.
    InvalidConfig {
        /// The config error this wraps.
        source: ConfigError,
    },

    /// The listening transport could not be bound.
    TransportBindFailed {
        /// Address that could not be bound.
        addr: String,
        /// Underlying I/O error description.
        detail: String,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedDirUnavailable { path, detail } => write!(
                f,
                "cannot open shared-config directory '{}': {detail}\n  To fix: create the directory or point `shared_dir` at an existing one.",
                path.display()
            ),
            Self::AgentInfoDirUnavailable { path, detail } => write!(
                f,
                "cannot create agent-info directory '{}': {detail}\n  To fix: check permissions on the parent directory.",
                path.display()
            ),
            Self::InvalidConfig { source } => write!(f, "invalid configuration: {source}"),
            Self::TransportBindFailed { addr, detail } => write!(
                f,
                "cannot bind transport on '{addr}': {detail}\n  To fix: choose a free address or stop the process already using it."
            ),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidConfig { source } => Some(source),
            _ => None,
        }
    }
}

impl From<ConfigError> for CoreError {
    fn from(source: ConfigError) -> Self {
        Self::InvalidConfig { source }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// A configuration file could not be loaded or a value failed validation.
#[derive(Debug)]
pub struct ConfigError {
    /// Path to the configuration file, when the error originated from a file.
    pub path: Option<PathBuf>,
    /// Human-readable description of the problem.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path.display(), self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}
