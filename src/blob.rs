//! Bucketed blob storage on the local filesystem.
//!
//! A bucket is a directory directly under the uploads root and a key is a
//! single file name inside it. Blobs are written once and removed only when
//! the owning video goes away.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tokio::fs;
use tracing::{debug, warn};

use crate::security::{is_plain_segment, join_segments};

pub const VIDEOS_BUCKET: &str = "videos";
pub const THUMBNAILS_BUCKET: &str = "thumbnails";
pub const BUCKETS: [&str; 2] = [VIDEOS_BUCKET, THUMBNAILS_BUCKET];

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the bucket directory if it does not exist yet.
    pub async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        let dir = join_segments(&self.root, [bucket])
            .ok_or_else(|| anyhow!("invalid bucket name {bucket:?}"))?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating bucket {}", dir.display()))
    }

    /// Stores `data` under `bucket/key`. The bytes land in a temporary file
    /// first so readers never observe a half-written blob.
    pub async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<u64> {
        let path = self.blob_path(bucket, key)?;
        let tmp = path.with_file_name(format!(".{key}.partial"));
        fs::write(&tmp, data)
            .await
            .with_context(|| format!("writing blob {bucket}/{key}"))?;
        if let Err(err) = fs::rename(&tmp, &path).await {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                warn!(bucket, key, error = %cleanup, "failed to remove partial blob");
            }
            return Err(err).with_context(|| format!("publishing blob {bucket}/{key}"));
        }
        debug!(bucket, key, bytes = data.len(), "blob stored");
        Ok(data.len() as u64)
    }

    /// Removes a blob. A blob that is already gone counts as removed.
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.blob_path(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(bucket, key, "blob already missing on delete");
                Ok(())
            }
            Err(err) => Err(err).with_context(|| format!("removing blob {bucket}/{key}")),
        }
    }

    pub async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let path = self.blob_path(bucket, key)?;
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking blob {bucket}/{key}"))
    }

    /// Keys stored in a bucket, sorted. Temporary upload files are skipped.
    pub async fn list(&self, bucket: &str) -> Result<Vec<String>> {
        let dir = join_segments(&self.root, [bucket])
            .ok_or_else(|| anyhow!("invalid bucket name {bucket:?}"))?;
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing bucket {}", dir.display()))?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') && name.ends_with(".partial") {
                continue;
            }
            keys.push(name);
        }
        keys.sort();
        Ok(keys)
    }

    /// Maps a request path such as `videos/abc-video.mp4` onto the filesystem.
    /// Only `<bucket>/<key>` with a known bucket and a plain key resolves, so
    /// nothing else under the root (the catalog file included) is reachable.
    pub fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let (bucket, key) = request_path.split_once('/')?;
        if !BUCKETS.contains(&bucket) {
            return None;
        }
        join_segments(&self.root, [bucket, key])
    }

    fn blob_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        if !is_plain_segment(key) {
            return Err(anyhow!("invalid blob key {key:?}"));
        }
        join_segments(&self.root, [bucket, key])
            .ok_or_else(|| anyhow!("invalid bucket name {bucket:?}"))
    }
}
