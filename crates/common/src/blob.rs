//! Content-addressed blob store for snapshots and screenshots
//!
//! DOM snapshots and screenshot artifacts are stored out of row, keyed by
//! their SHA-256 digest. Identical snapshots across retries deduplicate to
//! one object; writes are atomic via a temp file rename.

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Content-addressed store for opaque artifacts
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Create a new store at the given root directory
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("objects")).await?;
        fs::create_dir_all(root.join("tmp")).await?;

        info!("Initialized blob store at {:?}", root);

        Ok(Self { root })
    }

    /// Get the root path of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute SHA-256 hash of data
    pub fn hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Get the path for an object by its digest
    pub fn object_path(&self, digest: &str) -> PathBuf {
        // First 2 chars as subdirectory for sharding
        let (prefix, _) = digest.split_at(2.min(digest.len()));
        self.root.join("objects").join(prefix).join(digest)
    }

    /// Check if an object exists
    pub async fn has(&self, digest: &str) -> bool {
        self.object_path(digest).exists()
    }

    /// Store data and return its digest
    pub async fn put(&self, data: &[u8]) -> Result<String> {
        let digest = Self::hash(data);

        if self.has(&digest).await {
            debug!("Object {} already exists", digest);
            return Ok(digest);
        }

        let path = self.object_path(&digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write atomically via temp file
        let tmp_path = self.root.join("tmp").join(format!("{}.tmp", digest));
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &path).await?;

        debug!("Stored object {} ({} bytes)", digest, data.len());
        Ok(digest)
    }

    /// Retrieve an object by digest. Data is re-hashed on the way out so
    /// on-disk corruption surfaces as an error instead of bad bytes.
    pub async fn get(&self, digest: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(digest);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path).await?;
        let actual = Self::hash(&data);
        if actual != digest {
            return Err(Error::Internal(format!(
                "blob {} corrupt: content hashes to {}",
                digest, actual
            )));
        }
        Ok(Some(data))
    }
}
