use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{error, info};

use crate::error::{ChatError, Result};
use crate::session::SessionHandle;

pub const UPLOAD_CONFIRMATION: &str =
    "csv file uploaded successfully, you can now interact with your data";

/// Persists uploaded files under `<upload_dir>/<session id>/<file name>`.
#[derive(Debug, Clone)]
pub struct UploadReceiver {
    upload_dir: PathBuf,
}

impl UploadReceiver {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
        }
    }

    /// Storage location for `file_name` in the given session.
    ///
    /// Only the final path component of the client-supplied name is used.
    pub fn target_path(&self, session_id: &str, file_name: &str) -> Result<PathBuf> {
        let name = Path::new(file_name)
            .file_name()
            .ok_or_else(|| ChatError::InvalidUpload(format!("unusable file name {file_name:?}")))?;
        Ok(self.upload_dir.join(session_id).join(name))
    }

    /// Read the whole stream, write it out and point the session at it.
    pub async fn receive<R>(
        &self,
        session: &SessionHandle,
        file_name: &str,
        mut reader: R,
    ) -> Result<PathBuf>
    where
        R: AsyncRead + Unpin,
    {
        let path = self.target_path(session.id(), file_name)?;

        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|source| ChatError::UploadWrite {
                path: path.clone(),
                source,
            })?;

        if let Err(source) = write_file(&path, &data).await {
            error!(session_id = %session.id(), path = %path.display(), error = %source, "upload write failed");
            return Err(ChatError::UploadWrite { path, source });
        }

        info!(
            session_id = %session.id(),
            path = %path.display(),
            bytes = data.len(),
            "stored uploaded file"
        );

        let stored = path.clone();
        session.update(|s| {
            s.uploaded_file_path = Some(stored);
            s.upload_confirmation = UPLOAD_CONFIRMATION.to_string();
        });
        Ok(path)
    }
}

async fn write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await
}
