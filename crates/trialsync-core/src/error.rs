//! Error types for trialsync-core

use std::sync::Arc;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type alias using trialsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in trialsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    /// Local storage is full, busy, or read-only. Callers retry later.
    #[error("Local storage unavailable: {0}")]
    StorageCapacity(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Field path rejected by the entity schema
    #[error("Invalid field path: {0}")]
    InvalidPath(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transient network failure (timeout, unreachable host)
    #[error("Network error: {0}")]
    Network(String),

    /// Remote store rejected the request
    #[error("Remote store error{}: {message}", status_suffix(.status))]
    Remote {
        status: Option<u16>,
        message: String,
    },

    /// Write rejected because a newer version is already stored
    #[error("Stale write for {table}/{id}: version {attempted} is older than stored version {stored}")]
    StaleWrite {
        table: String,
        id: String,
        attempted: u64,
        stored: u64,
    },

    /// Sync lock could not be acquired
    #[error("Failed to acquire lock for {0}")]
    LockUnavailable(String),

    /// Unresolvable conflict
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Payload compression failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// Component used before it was initialized
    #[error("{0} not initialized")]
    NotInitialized(&'static str),

    /// Error shared between deduplicated callers
    #[error(transparent)]
    Shared(Arc<Error>),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|status| format!(" ({status})")).unwrap_or_default()
}

impl Error {
    /// Whether the failed operation may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Network(_) | Self::StorageCapacity(_) | Self::LockUnavailable(_) => {
                true
            }
            Self::Remote { status, .. } => {
                status.map_or(true, |status| {
                    status == 408 || status == 429 || status >= 500
                })
            }
            Self::Shared(inner) => inner.is_retryable(),
            _ => false,
        }
    }

    /// Whether the error was caused by a missing auxiliary table.
    pub fn is_missing_namespace(&self) -> bool {
        match self {
            Self::Sqlite(error) => error.to_string().contains("no such table"),
            Self::Shared(inner) => inner.is_missing_namespace(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref failure, _) = error {
            if matches!(
                failure.code,
                ErrorCode::DiskFull
                    | ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::ReadOnly
                    | ErrorCode::CannotOpen
                    | ErrorCode::OutOfMemory
            ) {
                return Self::StorageCapacity(error.to_string());
            }
        }
        Self::Sqlite(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_retry_only_on_server_side_status() {
        let server = Error::Remote {
            status: Some(503),
            message: "unavailable".to_string(),
        };
        let client = Error::Remote {
            status: Some(400),
            message: "bad request".to_string(),
        };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(Error::Network("timeout".to_string()).is_retryable());
        assert!(!Error::InvalidPath("a..b".to_string()).is_retryable());
    }

    #[test]
    fn shared_error_delegates_classification() {
        let shared = Error::Shared(Arc::new(Error::Network("reset".to_string())));
        assert!(shared.is_retryable());
        assert_eq!(shared.to_string(), "Network error: reset");
    }

    #[test]
    fn disk_full_maps_to_capacity_error() {
        let error = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            Some("database or disk is full".to_string()),
        );
        let converted = Error::from(error);
        assert!(matches!(converted, Error::StorageCapacity(_)));
        assert!(converted.is_retryable());
    }

    #[test]
    fn remote_error_display_includes_status() {
        let error = Error::Remote {
            status: Some(404),
            message: "missing".to_string(),
        };
        assert_eq!(error.to_string(), "Remote store error (404): missing");
    }
}
