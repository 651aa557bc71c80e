//! Filesystem blob storage for cached bodies and attachments.
//!
//! Keys are forward-slash paths relative to a configured root. The cold
//! storage archiver deletes through the same interface.

use anyhow::Context as _;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create blob directory for '{key}'"))?;
        }

        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write blob '{key}'"))
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read blob '{key}'"))
    }

    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error).with_context(|| format!("failed to delete blob '{key}'")),
        }
    }

    /// Resolve a key under the root, rejecting absolute paths and `..`
    /// components so a stored reference can never escape the blob root.
    fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative.components().any(|component| {
            !matches!(component, Component::Normal(_) | Component::CurDir)
        });
        if key.is_empty() || escapes {
            anyhow::bail!("invalid blob key '{key}'");
        }

        Ok(self.root.join(relative))
    }
}
