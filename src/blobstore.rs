//! Local content-verified blob store and the agent-side upload client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobstoreError {
    #[error("Writing blob {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Reading blob {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Blob {blob_id} not found")]
    NotFound { blob_id: String },

    #[error("Blob {blob_id} failed integrity check: expected sha1 {expected}, got {actual}")]
    Integrity {
        blob_id: String,
        expected: String,
        actual: String,
    },

    #[error("Uploading blob {blob_id}: {reason}")]
    Upload { blob_id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, BlobstoreError>;

/// Identifier and SHA-1 of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    pub blob_id: String,
    pub sha1: String,
}

pub trait Blobstore: Send + Sync {
    /// Copy `local_path` into the store and return its new reference.
    fn create(&self, local_path: &Path) -> Result<BlobRef>;

    /// Path of a stored blob, verified against its recorded SHA-1.
    fn get(&self, blob: &BlobRef) -> Result<PathBuf>;

    fn validate(&self, blob: &BlobRef) -> Result<()>;

    fn delete(&self, blob_id: &str) -> Result<()>;
}

pub struct LocalBlobstore {
    root: PathBuf,
}

impl LocalBlobstore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, blob_id: &str) -> PathBuf {
        self.root.join(blob_id)
    }
}

impl Blobstore for LocalBlobstore {
    fn create(&self, local_path: &Path) -> Result<BlobRef> {
        std::fs::create_dir_all(&self.root).map_err(|source| BlobstoreError::Write {
            path: self.root.clone(),
            source,
        })?;

        let blob_id = Uuid::new_v4().to_string();
        let dest = self.blob_path(&blob_id);
        std::fs::copy(local_path, &dest).map_err(|source| BlobstoreError::Write {
            path: dest.clone(),
            source,
        })?;
        let sha1 = sha1_file(&dest)?;

        debug!("Stored blob {} ({}) from {:?}", blob_id, sha1, local_path);
        Ok(BlobRef { blob_id, sha1 })
    }

    fn get(&self, blob: &BlobRef) -> Result<PathBuf> {
        self.validate(blob)?;
        Ok(self.blob_path(&blob.blob_id))
    }

    fn validate(&self, blob: &BlobRef) -> Result<()> {
        let path = self.blob_path(&blob.blob_id);
        if !path.exists() {
            return Err(BlobstoreError::NotFound {
                blob_id: blob.blob_id.clone(),
            });
        }
        let actual = sha1_file(&path)?;
        if !actual.eq_ignore_ascii_case(&blob.sha1) {
            return Err(BlobstoreError::Integrity {
                blob_id: blob.blob_id.clone(),
                expected: blob.sha1.clone(),
                actual,
            });
        }
        Ok(())
    }

    fn delete(&self, blob_id: &str) -> Result<()> {
        let path = self.blob_path(blob_id);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| BlobstoreError::Write { path, source })?;
        }
        Ok(())
    }
}

/// SHA-1 hex digest of a file's contents.
pub fn sha1_file(path: &Path) -> Result<String> {
    let read_err = |source| BlobstoreError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::File::open(path).map_err(read_err)?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0; 8192];
    loop {
        let bytes_read = file.read(&mut buffer).map_err(read_err)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Pushes blobs to the blob store the agent downloads from during `apply`.
#[async_trait]
pub trait BlobUploader: Send + Sync {
    async fn upload(&self, local_path: &Path, blob: &BlobRef) -> Result<()>;
}

/// WebDAV-style uploader: `PUT <endpoint>/<blob_id>`. Credentials embedded in
/// the endpoint URL are sent as basic auth.
pub struct DavBlobUploader {
    endpoint: String,
    client: reqwest::Client,
}

impl DavBlobUploader {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl BlobUploader for DavBlobUploader {
    async fn upload(&self, local_path: &Path, blob: &BlobRef) -> Result<()> {
        let body = tokio::fs::read(local_path)
            .await
            .map_err(|source| BlobstoreError::Read {
                path: local_path.to_path_buf(),
                source,
            })?;
        let url = format!("{}/{}", self.endpoint, blob.blob_id);
        info!("Uploading blob {} to agent blobstore", blob.blob_id);

        let upload_err = |reason: String| BlobstoreError::Upload {
            blob_id: blob.blob_id.clone(),
            reason,
        };
        let response = self
            .client
            .put(&url)
            .body(body)
            .send()
            .await
            .map_err(|e| upload_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(upload_err(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}
