//! S3-compatible object-store adapter for the backup core.
//!
//! Works against AWS S3 as well as MinIO/LocalStack via a custom endpoint
//! with path-style addressing.

use std::path::Path;

use aws_config::BehaviorVersion;
use aws_sdk_s3::{config::Credentials, primitives::ByteStream, Client};

use bunker_core::{
    config::RemoteStorageConfig, errors::Error, ports::ObjectStore, Result,
};

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(remote: &RemoteStorageConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(remote.region.clone()));

        if let Some(endpoint) = &remote.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        // Explicit credentials when configured, otherwise the ambient chain
        // (environment, instance profile, ...).
        if let (Some(access_key), Some(secret_key)) = (&remote.access_key, &remote.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "bunker-config",
            ));
        }

        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if remote.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: remote.bucket.clone(),
        })
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| Error::Upload(format!("read {}: {e}", path.display())))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| Error::Upload(format!("put s3://{}/{key}: {e}", self.bucket)))?;

        Ok(())
    }
}
