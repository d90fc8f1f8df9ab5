//! Access to rendered preview images.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::fs;

/// Object key of the preview rendered for a file.
pub fn preview_key(user_id: &str, file_id: &str) -> String {
    format!("{}/{}_preview.png", user_id, file_id)
}

#[async_trait]
pub trait PreviewStore: Send + Sync {
    /// Bytes of the preview for `file_id`, or `None` when it was never rendered.
    async fn fetch_preview(&self, user_id: &str, file_id: &str) -> Result<Option<Vec<u8>>>;
}

/// Previews laid out on disk under `root` using [`preview_key`].
#[derive(Debug, Clone)]
pub struct FsPreviewStore {
    root: PathBuf,
}

impl FsPreviewStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, user_id: &str, file_id: &str) -> Result<PathBuf> {
        for part in [user_id, file_id] {
            if part.is_empty() || part.contains('/') || part.contains('\\') || part.contains("..") {
                return Err(anyhow!("invalid storage path component {:?}", part));
            }
        }
        Ok(self.root.join(preview_key(user_id, file_id)))
    }
}

#[async_trait]
impl PreviewStore for FsPreviewStore {
    async fn fetch_preview(&self, user_id: &str, file_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(user_id, file_id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read preview {}", path.display()))
            }
        }
    }
}
