//! Blob storage for relayed job artifacts.
//!
//! The orchestration engine only needs `put(key, bytes) -> url`; this crate
//! defines that capability as [`BlobStore`] and ships an S3 backend plus an
//! in-memory one used by tests and local runs.

pub mod memory;
pub mod s3;

use async_trait::async_trait;

pub use memory::MemoryBlobStore;
pub use s3::{S3BlobStore, S3Settings};

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Blob upload failed for {key}: {message}")]
    Upload { key: String, message: String },

    #[error("Invalid blob key: {0}")]
    InvalidKey(String),
}

/// Write-only object storage returning a public URL per object.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key` and return the object's public URL.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String, BlobError>;
}

/// Object key for a job artifact: `{prefix}/{job_id}/{filename}`.
///
/// Empty prefix segments are skipped and `filename` is reduced to its last
/// path component.
pub fn artifact_key(prefix: &str, job_id: &str, filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    [prefix.trim_matches('/'), job_id, name]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
