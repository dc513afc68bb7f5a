//! Error types for admitsync.
//!
//! Library crates use [`AdmitError`] via `thiserror`.
//! App crates (cli/server) wrap this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all admitsync operations.
#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while fetching from the catalog site.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// No extraction strategy recognized the page.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Headless browser launch or automation error.
    #[error("browser error: {0}")]
    Browser(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Malformed natural key or request input.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A batch job is already running.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Record absent after the full strategy chain and polling.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, AdmitError>;

impl AdmitError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap any storage-backend error.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Short machine-readable kind, used in API payloads and run stats.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Fetch(_) => "fetch",
            Self::Parse { .. } => "parse",
            Self::Storage(_) => "storage",
            Self::Browser(_) => "browser",
            Self::Io { .. } => "io",
            Self::Validation { .. } => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
        }
    }
}
