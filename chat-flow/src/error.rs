use std::path::PathBuf;

use thiserror::Error;

/// Operational errors raised by the chat core.
///
/// User-recoverable problems (missing credential, missing file, unreadable
/// table, failed agent call) never surface here; the turn runner records them
/// on the session instead.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("A turn is already in progress for session {0}")]
    TurnInProgress(String),

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Failed to write upload to {path}: {source}")]
    UploadWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage error: {0}")]
    StorageError(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
