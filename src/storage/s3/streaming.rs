use anyhow::{anyhow, Result};
use async_channel::Sender;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, StorageClass};
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::{trace, warn};

use crate::config::S3Config;
use crate::storage::s3::{wrap_sdk_error, S3Storage};
use crate::storage::{acquire_rate_limit, strong_etag, StorageTrait};
use crate::types::error::SyncError;
use crate::types::token::PipelineCancellationToken;
use crate::types::Object;

/// 8 MiB parts keep us well under the part-count limit for anything the
/// multipart API accepts.
const MULTIPART_PART_SIZE: usize = 8 * 1024 * 1024;

/// S3 backend variant that never buffers whole objects: reads hand the
/// response body over as a stream, and streamed writes go through the
/// multipart uploader. Required for objects of unknown or very large size.
#[derive(Clone)]
pub struct S3StreamingStorage {
    inner: S3Storage,
    part_size: usize,
}

impl S3StreamingStorage {
    pub async fn new(bucket: &str, prefix: &str, config: &S3Config) -> Self {
        Self {
            inner: S3Storage::new(bucket, prefix, config).await,
            part_size: MULTIPART_PART_SIZE,
        }
    }

    async fn upload_multipart(&self, object: &mut Object, stream: ByteStream) -> Result<()> {
        let full_key = self.inner.full_key(&object.key);

        let create = self
            .inner
            .client
            .create_multipart_upload()
            .bucket(&self.inner.bucket)
            .key(&full_key)
            .set_content_type(object.content_type.clone())
            .set_content_disposition(object.content_disposition.clone())
            .set_content_encoding(object.content_encoding.clone())
            .set_content_language(object.content_language.clone())
            .set_cache_control(object.cache_control.clone())
            .set_metadata(object.metadata.clone())
            .set_storage_class(object.storage_class.as_deref().map(StorageClass::from))
            .send()
            .await
            .map_err(wrap_sdk_error)?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| anyhow!("no upload id returned for {}", object.key))?
            .to_string();

        match self.upload_parts(&full_key, &upload_id, stream).await {
            Ok(parts) => {
                self.inner
                    .client
                    .complete_multipart_upload()
                    .bucket(&self.inner.bucket)
                    .key(&full_key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder().set_parts(Some(parts)).build(),
                    )
                    .send()
                    .await
                    .map_err(wrap_sdk_error)?;
                Ok(())
            }
            Err(e) => {
                let abort_result = self
                    .inner
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.inner.bucket)
                    .key(&full_key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                if abort_result.is_err() {
                    warn!(key = object.key, "failed to abort the multipart upload.");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        full_key: &str,
        upload_id: &str,
        stream: ByteStream,
    ) -> Result<Vec<CompletedPart>> {
        let mut reader = stream.into_async_read();
        let mut parts = Vec::new();
        let mut part_number: i32 = 1;

        loop {
            if self.inner.cancellation_token.is_cancelled() {
                return Err(SyncError::Cancelled.into());
            }

            let buf = read_up_to(&mut reader, self.part_size).await?;
            let last_part = buf.len() < self.part_size;

            // an empty first part still has to be uploaded: a multipart
            // upload cannot complete with zero parts
            if buf.is_empty() && part_number > 1 {
                break;
            }

            if let Some(limiter) = &self.inner.rate_limiter {
                acquire_rate_limit(limiter, buf.len()).await;
            }

            let bytes = Bytes::from(buf);
            let mut attempt: u32 = 0;
            let output = loop {
                let request = self
                    .inner
                    .client
                    .upload_part()
                    .bucket(&self.inner.bucket)
                    .key(full_key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(bytes.clone()));

                let result = tokio::select! {
                    result = request.send() => result,
                    _ = self.inner.cancellation_token.cancelled() => {
                        return Err(SyncError::Cancelled.into())
                    }
                };

                match result {
                    Ok(output) => break output,
                    Err(e)
                        if self.inner.retryer.should_retry(
                            &e,
                            attempt,
                            self.inner.cancellation_token.is_cancelled(),
                        ) =>
                    {
                        attempt += 1;
                        warn!(key = full_key, part_number = part_number, error = %e, "upload part failed. retrying.");
                        self.inner.retryer.wait().await;
                    }
                    Err(e) => return Err(wrap_sdk_error(e)),
                }
            };

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .build(),
            );
            part_number += 1;

            if last_part {
                break;
            }
        }

        trace!(key = full_key, parts = parts.len(), "all parts uploaded.");
        Ok(parts)
    }
}

async fn read_up_to<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(limit);
    let mut take = reader.take(limit as u64);
    take.read_to_end(&mut buf).await?;

    Ok(buf)
}

#[async_trait]
impl StorageTrait for S3StreamingStorage {
    fn with_cancellation_token(&mut self, token: PipelineCancellationToken) {
        self.inner.with_cancellation_token(token);
    }

    fn with_rate_limit(&mut self, bytes_per_sec: u32) -> Result<()> {
        self.inner.with_rate_limit(bytes_per_sec)
    }

    async fn list(&self, sender: &Sender<Object>) -> Result<()> {
        self.inner.list(sender).await
    }

    async fn get_object_meta(&self, object: &mut Object) -> Result<()> {
        self.inner.get_object_meta(object).await
    }

    async fn get_object_acl(&self, object: &mut Object) -> Result<()> {
        self.inner.get_object_acl(object).await
    }

    /// Identical to the buffered variant except that the response body is
    /// left as a stream; the consumer owns it and must drain it.
    async fn get_object_content(&self, object: &mut Object) -> Result<()> {
        let output = self
            .inner
            .send_get(&object.key, object.version_id.clone())
            .await?;

        object.content_type = output.content_type().map(str::to_string);
        object.content_disposition = output.content_disposition().map(str::to_string);
        object.content_encoding = output.content_encoding().map(str::to_string);
        object.content_language = output.content_language().map(str::to_string);
        object.cache_control = output.cache_control().map(str::to_string);
        object.metadata = output.metadata().cloned();
        object.e_tag = output.e_tag().map(strong_etag);
        object.mtime = output
            .last_modified()
            .and_then(|dt| aws_smithy_types_convert::date_time::DateTimeExt::to_chrono_utc(dt).ok());
        object.content_length = output.content_length();
        object.storage_class = output.storage_class().map(|sc| sc.as_str().to_string());

        object.content = None;
        object.content_stream = Some(output.body);

        Ok(())
    }

    async fn put_object(&self, object: &mut Object) -> Result<()> {
        let Some(stream) = object.content_stream.take() else {
            // buffered bodies take the plain single-call path
            return self.inner.put_object(object).await;
        };

        self.upload_multipart(object, stream).await?;

        if let Some(policy) = object.access_control_policy.clone() {
            self.inner.put_acl(&object.key, &policy).await?;
        }

        Ok(())
    }

    async fn delete_object(&self, object: &Object) -> Result<()> {
        self.inner.delete_object(object).await
    }
}
