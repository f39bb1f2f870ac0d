//! S3 blob store on `aws-sdk-s3`.
//!
//! Credentials and region come from the standard AWS provider chain
//! (`AWS_ACCESS_KEY_ID`, `AWS_REGION`, profiles, instance metadata).

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::{BlobError, BlobStore};

/// Bucket and URL settings for [`S3BlobStore`].
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    /// Base URL objects are served from, e.g. a CDN in front of the bucket.
    /// Defaults to the bucket's virtual-hosted S3 endpoint.
    pub public_url: Option<String>,
}

impl S3Settings {
    /// Public URL for `key` under these settings.
    pub fn object_url(&self, key: &str) -> String {
        match &self.public_url {
            Some(base) => format!("{}/{key}", base.trim_end_matches('/')),
            None => format!("https://{}.s3.amazonaws.com/{key}", self.bucket),
        }
    }
}

pub struct S3BlobStore {
    client: Client,
    settings: S3Settings,
}

impl S3BlobStore {
    /// Load AWS configuration from the environment and build a client.
    pub async fn from_env(settings: S3Settings) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        tracing::info!(bucket = %settings.bucket, "S3 blob store initialized");
        Self::with_client(Client::new(&config), settings)
    }

    pub fn with_client(client: Client, settings: S3Settings) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String, BlobError> {
        if key.is_empty() {
            return Err(BlobError::InvalidKey(key.to_string()));
        }

        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| BlobError::Upload {
                key: key.to_string(),
                message: aws_sdk_s3::error::DisplayErrorContext(e).to_string(),
            })?;

        tracing::debug!(bucket = %self.settings.bucket, key = %key, size, "Uploaded object to S3");
        Ok(self.settings.object_url(key))
    }
}
