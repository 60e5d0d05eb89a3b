//! Error types for the remote image cache

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single load, shared by every caller waiting on the same fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Remote returned status {0}")]
    Status(u16),
    #[error("Remote returned an empty body")]
    EmptyBody,
    #[error("Payload is not a decodable image: {0}")]
    Decode(String),
    #[error("Fetch was cancelled")]
    Cancelled,
}

impl LoadError {
    /// True for failures of the remote fetch itself, as opposed to decoding.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LoadError::Transport(_) | LoadError::Status(_) | LoadError::EmptyBody
        )
    }
}

impl From<reqwest::Error> for LoadError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => LoadError::Status(status.as_u16()),
            None => LoadError::Transport(err.to_string()),
        }
    }
}

/// Disk tier failure. Absorbed by the cache facade, never seen by `load` callers.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Blocking disk task failed: {0}")]
    Task(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LoadError>;
