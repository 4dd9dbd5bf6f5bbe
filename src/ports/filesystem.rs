use std::{io, path::PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use super::{BlobStore, PortError};

/// Blob store backed by a local (or mounted) directory
pub struct FsBlobStore {
    directory: PathBuf,
    public_url: Option<String>,
}

impl FsBlobStore {
    pub async fn create(directory: PathBuf, public_url: Option<String>) -> io::Result<Self> {
        tokio::fs::create_dir_all(&directory).await?;
        Ok(Self {
            directory,
            public_url,
        })
    }
}

fn classify(error: io::Error) -> PortError {
    match error.kind() {
        io::ErrorKind::PermissionDenied => PortError::Unauthorized(error.to_string()),
        io::ErrorKind::InvalidInput => PortError::Rejected(error.to_string()),
        _ => PortError::Transient(error.to_string()),
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, PortError> {
        if key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(PortError::Rejected(format!("Invalid blob key {:?}", key)));
        }
        let path = self.directory.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(classify)?;
        }
        // Write beside the target then rename, so readers never see a partial object
        let staging = path.with_extension(format!("{}.partial", Uuid::new_v4()));
        tokio::fs::write(&staging, bytes).await.map_err(classify)?;
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(classify(e));
        }
        Ok(match &self.public_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!("file://{}", path.display()),
        })
    }
}
