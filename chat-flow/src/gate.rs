use std::path::PathBuf;

use thiserror::Error;

use crate::session::Session;

/// Fail-fast checks run before any billed agent call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("enter your openai api key")]
    MissingCredential,

    #[error("ensure you upload a csv file")]
    MissingFile,
}

/// Credential first, then file existence; the order decides which message a
/// session missing both gets.
pub fn check(session: &Session) -> Result<PathBuf, PreconditionError> {
    if session.api_key.is_empty() {
        return Err(PreconditionError::MissingCredential);
    }

    match &session.uploaded_file_path {
        Some(path) if path.exists() => Ok(path.clone()),
        _ => Err(PreconditionError::MissingFile),
    }
}
