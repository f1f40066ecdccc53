use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_channel::Sender;
use async_trait::async_trait;
use aws_smithy_types_convert::date_time::DateTimeExt;
use tracing::{debug, trace, warn};

use crate::config::S3Config;
use crate::storage::s3::{wrap_sdk_error, S3Storage};
use crate::storage::{strong_etag, StorageTrait};
use crate::types::error::SyncError;
use crate::types::token::PipelineCancellationToken;
use crate::types::Object;

/// S3 backend variant that enumerates every object version. One object is
/// emitted per version with its version id and latest flag; reads and
/// deletes honor the version id, writes always land as the latest version.
#[derive(Clone)]
pub struct S3VersionedStorage {
    inner: S3Storage,
    key_marker: Arc<Mutex<Option<String>>>,
    version_id_marker: Arc<Mutex<Option<String>>>,
}

impl S3VersionedStorage {
    pub async fn new(bucket: &str, prefix: &str, config: &S3Config) -> Self {
        Self {
            inner: S3Storage::new(bucket, prefix, config).await,
            key_marker: Arc::new(Mutex::new(None)),
            version_id_marker: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl StorageTrait for S3VersionedStorage {
    fn with_cancellation_token(&mut self, token: PipelineCancellationToken) {
        self.inner.with_cancellation_token(token);
    }

    fn with_rate_limit(&mut self, bytes_per_sec: u32) -> Result<()> {
        self.inner.with_rate_limit(bytes_per_sec)
    }

    async fn list(&self, sender: &Sender<Object>) -> Result<()> {
        let mut attempt: u32 = 0;

        loop {
            if self.inner.cancellation_token.is_cancelled() {
                trace!("version listing has been cancelled.");
                return Err(SyncError::Cancelled.into());
            }

            let key_marker = self.key_marker.lock().unwrap().clone();
            let version_id_marker = self.version_id_marker.lock().unwrap().clone();
            let request = self
                .inner
                .client
                .list_object_versions()
                .bucket(&self.inner.bucket)
                .prefix(&self.inner.prefix)
                .max_keys(self.inner.keys_per_request)
                .set_key_marker(key_marker)
                .set_version_id_marker(version_id_marker);

            let result = tokio::select! {
                result = request.send() => result,
                _ = self.inner.cancellation_token.cancelled() => {
                    return Err(SyncError::Cancelled.into())
                }
            };

            let output = match result {
                Ok(output) => output,
                Err(e)
                    if self.inner.retryer.should_retry(
                        &e,
                        attempt,
                        self.inner.cancellation_token.is_cancelled(),
                    ) =>
                {
                    attempt += 1;
                    warn!(error = %e, attempt = attempt, "version listing failed. retrying.");
                    self.inner.retryer.wait().await;
                    continue;
                }
                Err(e) => {
                    return Err(wrap_sdk_error(e).context("version listing aborted"));
                }
            };
            attempt = 0;

            for version in output.versions() {
                let Some(key) = version.key() else { continue };
                let key = self.inner.relative_key(key);
                if key.is_empty() {
                    continue;
                }

                let object = Object {
                    key: key.to_string(),
                    version_id: version.version_id().map(str::to_string),
                    is_latest: version.is_latest(),
                    e_tag: version.e_tag().map(strong_etag),
                    mtime: version.last_modified().and_then(|dt| dt.to_chrono_utc().ok()),
                    content_length: version.size(),
                    storage_class: version.storage_class().map(|sc| sc.as_str().to_string()),
                    ..Default::default()
                };

                if sender.send(object).await.is_err() {
                    trace!("the next stage has gone away. stop listing.");
                    return Ok(());
                }
            }

            if output.is_truncated() == Some(true) {
                *self.key_marker.lock().unwrap() =
                    output.next_key_marker().map(str::to_string);
                *self.version_id_marker.lock().unwrap() =
                    output.next_version_id_marker().map(str::to_string);
            } else {
                break;
            }
        }

        debug!(bucket = self.inner.bucket, "version listing finished.");
        Ok(())
    }

    async fn get_object_meta(&self, object: &mut Object) -> Result<()> {
        self.inner.get_object_meta(object).await
    }

    async fn get_object_acl(&self, object: &mut Object) -> Result<()> {
        self.inner.get_object_acl(object).await
    }

    async fn get_object_content(&self, object: &mut Object) -> Result<()> {
        self.inner.get_object_content(object).await
    }

    async fn put_object(&self, object: &mut Object) -> Result<()> {
        self.inner.put_object(object).await
    }

    async fn delete_object(&self, object: &Object) -> Result<()> {
        self.inner.delete_object(object).await
    }
}
