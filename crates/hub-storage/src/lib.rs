//! Raw payload archival, HTTP fetch utilities and sink implementations for the hub.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod cursor;
mod http;
mod postgres;
mod sinks;

pub use cursor::{CursorStore, FsCursorStore, MemoryCursorStore};
pub use http::{
    classify_reqwest_error, classify_status, retry_async, BackoffPolicy, Exhausted, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition, SimpleTokenBucket,
    TokenBucketConfig,
};
pub use postgres::PgRelationalSink;
pub use sinks::{
    DocumentSink, FsDocumentStore, MemoryDocumentSink, MemoryRelationalSink, RelationalSink,
    SinkError,
};

pub const CRATE_NAME: &str = "hub-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once archive of raw payloads as retrieved.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(source_id)
            .join(stamp)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably; identical payloads land on the same path and are written once.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.artifact_relative_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let exists = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;
        if !exists {
            write_atomically(&absolute_path, bytes).await?;
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: exists,
        })
    }
}

/// Write through a uniquely named temp file and rename over `path`.
pub(crate) async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_payloads_are_archived_once() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-10-18T09:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_bytes(fetched_at, "london-property", "html", b"<html>flat</html>")
            .await
            .expect("first store");
        let second = store
            .store_bytes(fetched_at, "london-property", "html", b"<html>flat</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first
            .relative_path
            .starts_with(PathBuf::from("london-property").join("20261018")));
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn atomic_write_replaces_existing_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("doc.json");
        write_atomically(&path, b"one").await.expect("first write");
        write_atomically(&path, b"two").await.expect("second write");
        assert_eq!(std::fs::read(&path).expect("read"), b"two");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);
    }
}
