//! Run-level errors.
//!
//! Everything that can go wrong with a single task is captured in its
//! [`Outcome`](crate::outcome::Outcome). [`DispatchError`] only covers
//! misconfiguration detected before the first task is admitted.

use std::path::PathBuf;

/// Errors surfaced to the caller before any task is admitted.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The config file could not be read from disk.
    #[error("failed to read config file {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The config file is not valid TOML or does not match the schema.
    #[error("failed to parse config TOML: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// The config parsed but carries values the dispatcher cannot run with.
    #[error("config validation error: {message}")]
    ConfigValidation { message: String },

    /// The task source produced nothing to dispatch.
    #[error("task source is empty")]
    EmptySource,

    /// An input file could not be read.
    #[error("failed to read input file {path}: {source}")]
    InputIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    HttpClient {
        #[from]
        source: reqwest::Error,
    },
}

impl DispatchError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
