use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] trialsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid field assignment `{0}`; expected path=json")]
    InvalidAssignment(String),
    #[error("Entity data must be a JSON object")]
    NotAnObject,
    #[error("No {entity_type} found with id {id}")]
    EntityNotFound { entity_type: String, id: String },
    #[error("Failed to resolve a data directory for the local store")]
    NoDataDir,
    #[error(
        "Remote store is not configured. Pass --remote-url or set TRIALSYNC_REMOTE_URL."
    )]
    RemoteNotConfigured,
    #[error("{failed} entities failed to sync and remain queued")]
    SyncIncomplete { failed: usize },
}
