//! Error types for todo-sync
//!
//! Nothing in the sync core is fatal: every variant here is something a caller
//! degrades around (keep the mutation queued, fall back to the local store,
//! show a warning).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Device-level storage failure (quota, corruption, locked file)
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// No connectivity to the remote side
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Remote rejected the request or failed transiently (5xx, timeout)
    #[error("Request failed{}: {message}", .status.map(|s| format!(" with status {}", s)).unwrap_or_default())]
    RequestFailed { status: Option<u16>, message: String },

    /// Record missing on the remote or local side
    #[error("Not found: {0}")]
    NotFound(String),

    /// Insert of an id that is already stored
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Mutation record whose kind and payload disagree
    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn request_failed(message: impl Into<String>) -> Self {
        SyncError::RequestFailed {
            status: None,
            message: message.into(),
        }
    }

    /// Failures worth retrying on a later flush
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable(_) | SyncError::RequestFailed { .. }
        )
    }

    /// Connectivity loss, not the record's fault
    pub fn is_offline(&self) -> bool {
        matches!(self, SyncError::NetworkUnavailable(_))
    }

    /// The request can never succeed as-is; retrying is pointless
    pub fn is_permanent(&self) -> bool {
        match self {
            SyncError::NotFound(_)
            | SyncError::InvalidMutation(_)
            | SyncError::Serialization(_) => true,
            // 4xx other than 408/429 means the payload itself was rejected
            SyncError::RequestFailed {
                status: Some(status),
                ..
            } => (400..500).contains(status) && *status != 408 && *status != 429,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::StorageUnavailable(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::request_failed(format!("timed out: {}", err))
        } else if err.is_connect() {
            SyncError::NetworkUnavailable(err.to_string())
        } else if err.is_decode() {
            SyncError::RequestFailed {
                status: None,
                message: format!("invalid response body: {}", err),
            }
        } else {
            SyncError::RequestFailed {
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
