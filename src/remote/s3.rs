// backuptool/src/remote/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_sdk_s3::error::DisplayErrorContext;
use chrono::DateTime;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use tracing::{debug, info, warn};

use super::{RemoteItem, RemoteTransfer};
use crate::config::S3Config;
use crate::errors::{BackupError, Result};

/// An S3-compatible object store (AWS, DigitalOcean Spaces, MinIO, ...).
#[derive(Debug, Clone)]
pub struct S3Transfer {
    client: s3::Client,
    bucket: String,
    endpoint: Option<String>,
}

impl S3Transfer {
    pub async fn connect(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();
        S3Transfer {
            client: s3::Client::from_conf(s3_config),
            bucket: config.bucket_name.clone(),
            endpoint: config.endpoint_url.clone(),
        }
    }

    /// HEAD on the bucket, so misconfiguration shows up before the upload stage.
    pub async fn check_connection(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| BackupError::transfer("head_bucket", &self.bucket, DisplayErrorContext(&e)))?;
        debug!(bucket = %self.bucket, "✓ target bucket is accessible");
        Ok(())
    }
}

#[async_trait]
impl RemoteTransfer for S3Transfer {
    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| BackupError::transfer("put", remote_path, e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(remote_path)
            .body(body)
            .send()
            .await
            .map_err(|e| BackupError::transfer("put", remote_path, DisplayErrorContext(&e)))?;

        info!(
            file = %local_path.display(),
            bucket = %self.bucket,
            key = remote_path,
            "✅ uploaded to S3"
        );
        Ok(())
    }

    async fn list(&self, remote_prefix: &str, recursive: bool) -> Result<Vec<RemoteItem>> {
        let mut items = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(remote_prefix);
            if !recursive {
                request = request.delimiter("/");
            }
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let page = request
                .send()
                .await
                .map_err(|e| BackupError::transfer("list", remote_prefix, DisplayErrorContext(&e)))?;

            for object in page.contents() {
                if let Some(key) = object.key() {
                    items.push(RemoteItem {
                        path: key.to_string(),
                        modified: object
                            .last_modified()
                            .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                    });
                }
            }
            for prefix in page.common_prefixes() {
                if let Some(p) = prefix.prefix() {
                    items.push(RemoteItem {
                        path: p.to_string(),
                        modified: None,
                    });
                }
            }

            continuation = match page.is_truncated() {
                Some(true) => page.next_continuation_token().map(str::to_string),
                _ => None,
            };
            if continuation.is_none() {
                break;
            }
        }
        Ok(items)
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        let key = remote_path.trim_end_matches('/');
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(key, error = %DisplayErrorContext(&e), "S3 delete failed");
                Err(BackupError::transfer("delete", remote_path, DisplayErrorContext(&e)))
            }
        }
    }

    fn describe(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("s3://{} at {}", self.bucket, endpoint),
            None => format!("s3://{}", self.bucket),
        }
    }
}
