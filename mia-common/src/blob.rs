//! Blob storage interface and the filesystem implementation.
//!
//! Media payloads live outside the relational store; records keep only the
//! blob key. Keys are namespaced `meetings/<meeting_id>/chunks/<seq>.bin`.

use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

/// Storage for binary media payloads.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    /// Cheap liveness probe for the storage health endpoint.
    async fn probe(&self) -> Result<()>;
}

/// Blob key for a meeting chunk.
pub fn chunk_key(meeting_id: &str, chunk_seq: i64) -> String {
    format!("meetings/{}/chunks/{}.bin", meeting_id, chunk_seq)
}

/// Filesystem-backed blob store. Used for both `local` and `shared_fs`
/// storage modes; the difference is what the root points at.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(Error::InvalidInput(format!("invalid blob key: {}", key)));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob not found: {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn probe(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let probe_path = self.root.join(".probe");
        tokio::fs::write(&probe_path, b"ok").await?;
        tokio::fs::remove_file(&probe_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        let key = chunk_key("m-1", 0);
        store.put(&key, b"audio bytes").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), b"audio bytes");
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(matches!(
            store.get("meetings/m-1/chunks/0.bin").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_traversal_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(matches!(
            store.put("../outside.bin", b"x").await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("nested/chunks"));
        store.probe().await.unwrap();
    }
}
