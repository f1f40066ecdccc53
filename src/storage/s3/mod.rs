use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_channel::Sender;
use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::operation::get_object::GetObjectOutput;
use aws_sdk_s3::operation::head_object::HeadObjectOutput;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ObjectCannedAcl, StorageClass};
use aws_sdk_s3::Client;
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_runtime_api::http::Response;
use aws_smithy_types_convert::date_time::DateTimeExt;
use leaky_bucket::RateLimiter;
use tracing::{debug, trace, warn};

use crate::config::S3Config;
use crate::storage::{acquire_rate_limit, strong_etag, StorageTrait};
use crate::types::error::{StorageErrorKind, SyncError};
use crate::types::token::PipelineCancellationToken;
use crate::types::{AccessControlPolicy, Grant, Grantee, Object, Owner, ACL_COPY_SENTINEL};

pub mod client_builder;
pub mod retry;
pub mod streaming;
pub mod versioned;

use retry::Retryer;

/// Buffered S3-compatible backend. Object bodies are materialized in memory;
/// the streaming variant exists for objects that do not fit.
#[derive(Clone)]
pub struct S3Storage {
    pub(crate) client: Client,
    pub(crate) bucket: String,
    pub(crate) prefix: String,
    pub(crate) keys_per_request: i32,
    pub(crate) retryer: Retryer,
    // survives whole-list retries so enumeration resumes at the last page
    list_cursor: Arc<Mutex<Option<String>>>,
    pub(crate) cancellation_token: PipelineCancellationToken,
    pub(crate) rate_limiter: Option<Arc<RateLimiter>>,
}

impl S3Storage {
    pub async fn new(bucket: &str, prefix: &str, config: &S3Config) -> Self {
        Self {
            client: client_builder::create_client(config).await,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            keys_per_request: config.keys_per_request,
            retryer: Retryer::new(config.retry_count, config.retry_delay),
            list_cursor: Arc::new(Mutex::new(None)),
            cancellation_token: crate::types::token::create_pipeline_cancellation_token(),
            rate_limiter: None,
        }
    }

    pub(crate) fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub(crate) fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.prefix)
            .unwrap_or(key)
            .trim_start_matches('/')
    }

    async fn send_head(
        &self,
        key: &str,
        version_id: Option<String>,
    ) -> Result<HeadObjectOutput> {
        let full_key = self.full_key(key);
        let mut attempt: u32 = 0;

        loop {
            let request = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .set_version_id(version_id.clone());

            let result = tokio::select! {
                result = request.send() => result,
                _ = self.cancellation_token.cancelled() => return Err(SyncError::Cancelled.into()),
            };

            match result {
                Ok(output) => return Ok(output),
                Err(e)
                    if self
                        .retryer
                        .should_retry(&e, attempt, self.cancellation_token.is_cancelled()) =>
                {
                    attempt += 1;
                    warn!(key = key, error = %e, attempt = attempt, "head object failed. retrying.");
                    self.retryer.wait().await;
                }
                Err(e) => return Err(wrap_sdk_error(e)),
            }
        }
    }

    pub(crate) async fn send_get(
        &self,
        key: &str,
        version_id: Option<String>,
    ) -> Result<GetObjectOutput> {
        let full_key = self.full_key(key);
        let mut attempt: u32 = 0;

        loop {
            let request = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .set_version_id(version_id.clone());

            let result = tokio::select! {
                result = request.send() => result,
                _ = self.cancellation_token.cancelled() => return Err(SyncError::Cancelled.into()),
            };

            match result {
                Ok(output) => return Ok(output),
                Err(e)
                    if self
                        .retryer
                        .should_retry(&e, attempt, self.cancellation_token.is_cancelled()) =>
                {
                    attempt += 1;
                    warn!(key = key, error = %e, attempt = attempt, "get object failed. retrying.");
                    self.retryer.wait().await;
                }
                Err(e) => return Err(wrap_sdk_error(e)),
            }
        }
    }

    pub(crate) async fn put_acl(&self, key: &str, policy: &AccessControlPolicy) -> Result<()> {
        let full_key = self.full_key(key);
        let acp = to_sdk_access_control_policy(policy)?;
        let mut attempt: u32 = 0;

        loop {
            let request = self
                .client
                .put_object_acl()
                .bucket(&self.bucket)
                .key(&full_key)
                .access_control_policy(acp.clone());

            let result = tokio::select! {
                result = request.send() => result,
                _ = self.cancellation_token.cancelled() => return Err(SyncError::Cancelled.into()),
            };

            match result {
                Ok(_) => return Ok(()),
                Err(e)
                    if self
                        .retryer
                        .should_retry(&e, attempt, self.cancellation_token.is_cancelled()) =>
                {
                    attempt += 1;
                    warn!(key = key, error = %e, attempt = attempt, "put object acl failed. retrying.");
                    self.retryer.wait().await;
                }
                Err(e) => return Err(wrap_sdk_error(e)),
            }
        }
    }
}

#[async_trait]
impl StorageTrait for S3Storage {
    fn with_cancellation_token(&mut self, token: PipelineCancellationToken) {
        self.cancellation_token = token;
    }

    fn with_rate_limit(&mut self, bytes_per_sec: u32) -> Result<()> {
        self.rate_limiter = Some(crate::storage::build_rate_limiter(bytes_per_sec)?);
        Ok(())
    }

    async fn list(&self, sender: &Sender<Object>) -> Result<()> {
        let mut attempt: u32 = 0;

        loop {
            if self.cancellation_token.is_cancelled() {
                trace!("bucket listing has been cancelled.");
                return Err(SyncError::Cancelled.into());
            }

            let continuation_token = self.list_cursor.lock().unwrap().clone();
            let request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .max_keys(self.keys_per_request)
                .set_continuation_token(continuation_token);

            let result = tokio::select! {
                result = request.send() => result,
                _ = self.cancellation_token.cancelled() => return Err(SyncError::Cancelled.into()),
            };

            let output = match result {
                Ok(output) => output,
                Err(e)
                    if self
                        .retryer
                        .should_retry(&e, attempt, self.cancellation_token.is_cancelled()) =>
                {
                    attempt += 1;
                    warn!(error = %e, attempt = attempt, "bucket listing failed. retrying.");
                    self.retryer.wait().await;
                    continue;
                }
                Err(e) => {
                    return Err(wrap_sdk_error(e).context("bucket listing aborted"));
                }
            };
            attempt = 0;

            for entry in output.contents() {
                let Some(key) = entry.key() else { continue };
                let key = self.relative_key(key);
                if key.is_empty() {
                    continue;
                }

                let object = Object {
                    key: key.to_string(),
                    e_tag: entry.e_tag().map(strong_etag),
                    mtime: entry.last_modified().and_then(|dt| dt.to_chrono_utc().ok()),
                    content_length: entry.size(),
                    storage_class: entry.storage_class().map(|sc| sc.as_str().to_string()),
                    is_latest: Some(true),
                    ..Default::default()
                };

                if sender.send(object).await.is_err() {
                    trace!("the next stage has gone away. stop listing.");
                    return Ok(());
                }
            }

            if output.is_truncated() == Some(true) {
                *self.list_cursor.lock().unwrap() = output
                    .next_continuation_token()
                    .map(|token| token.to_string());
            } else {
                break;
            }
        }

        debug!(bucket = self.bucket, "bucket listing finished.");
        Ok(())
    }

    async fn get_object_meta(&self, object: &mut Object) -> Result<()> {
        let output = self
            .send_head(&object.key, object.version_id.clone())
            .await?;

        object.content_type = output.content_type().map(str::to_string);
        object.content_disposition = output.content_disposition().map(str::to_string);
        object.content_encoding = output.content_encoding().map(str::to_string);
        object.content_language = output.content_language().map(str::to_string);
        object.cache_control = output.cache_control().map(str::to_string);
        object.metadata = output.metadata().cloned();
        object.e_tag = output.e_tag().map(strong_etag);
        object.mtime = output.last_modified().and_then(|dt| dt.to_chrono_utc().ok());
        object.content_length = output.content_length();
        object.storage_class = output.storage_class().map(|sc| sc.as_str().to_string());

        Ok(())
    }

    async fn get_object_acl(&self, object: &mut Object) -> Result<()> {
        let full_key = self.full_key(&object.key);
        let mut attempt: u32 = 0;

        let output = loop {
            let request = self
                .client
                .get_object_acl()
                .bucket(&self.bucket)
                .key(&full_key)
                .set_version_id(object.version_id.clone());

            let result = tokio::select! {
                result = request.send() => result,
                _ = self.cancellation_token.cancelled() => return Err(SyncError::Cancelled.into()),
            };

            match result {
                Ok(output) => break output,
                Err(e)
                    if self
                        .retryer
                        .should_retry(&e, attempt, self.cancellation_token.is_cancelled()) =>
                {
                    attempt += 1;
                    warn!(key = object.key, error = %e, attempt = attempt, "get object acl failed. retrying.");
                    self.retryer.wait().await;
                }
                Err(e) => return Err(wrap_sdk_error(e)),
            }
        };

        object.access_control_policy = Some(AccessControlPolicy {
            owner: output.owner().map(|owner| Owner {
                id: owner.id().map(str::to_string),
                display_name: owner.display_name().map(str::to_string),
            }),
            grants: output
                .grants()
                .iter()
                .filter_map(|grant| {
                    let grantee = grant.grantee()?;
                    Some(Grant {
                        grantee: Grantee {
                            grantee_type: grantee.r#type().as_str().to_string(),
                            id: grantee.id().map(str::to_string),
                            uri: grantee.uri().map(str::to_string),
                            email_address: grantee.email_address().map(str::to_string),
                            display_name: grantee.display_name().map(str::to_string),
                        },
                        permission: grant.permission()?.as_str().to_string(),
                    })
                })
                .collect(),
        });

        Ok(())
    }

    async fn get_object_content(&self, object: &mut Object) -> Result<()> {
        let output = self
            .send_get(&object.key, object.version_id.clone())
            .await?;

        object.content_type = output.content_type().map(str::to_string);
        object.content_disposition = output.content_disposition().map(str::to_string);
        object.content_encoding = output.content_encoding().map(str::to_string);
        object.content_language = output.content_language().map(str::to_string);
        object.cache_control = output.cache_control().map(str::to_string);
        object.metadata = output.metadata().cloned();
        object.e_tag = output.e_tag().map(strong_etag);
        object.mtime = output.last_modified().and_then(|dt| dt.to_chrono_utc().ok());
        object.storage_class = output.storage_class().map(|sc| sc.as_str().to_string());

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| anyhow!(e).context("failed to read the object body"))?
            .into_bytes();

        if let Some(limiter) = &self.rate_limiter {
            acquire_rate_limit(limiter, data.len()).await;
        }

        object.content_length = Some(data.len() as i64);
        object.content = Some(data.to_vec());
        object.content_stream = None;

        Ok(())
    }

    async fn put_object(&self, object: &mut Object) -> Result<()> {
        let full_key = self.full_key(&object.key);

        let bytes = if let Some(stream) = object.content_stream.take() {
            stream
                .collect()
                .await
                .map_err(|e| anyhow!(e).context("failed to drain the content stream"))?
                .into_bytes()
        } else if let Some(content) = object.content.take() {
            bytes::Bytes::from(content)
        } else {
            return Err(anyhow!("object {} has no content", object.key));
        };

        if let Some(limiter) = &self.rate_limiter {
            acquire_rate_limit(limiter, bytes.len()).await;
        }

        let mut attempt: u32 = 0;
        loop {
            let request = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .body(ByteStream::from(bytes.clone()))
                .set_content_type(object.content_type.clone())
                .set_content_disposition(object.content_disposition.clone())
                .set_content_encoding(object.content_encoding.clone())
                .set_content_language(object.content_language.clone())
                .set_cache_control(object.cache_control.clone())
                .set_metadata(object.metadata.clone())
                .set_acl(canned_acl(object.acl.as_deref()))
                .set_storage_class(object.storage_class.as_deref().map(StorageClass::from));

            let result = tokio::select! {
                result = request.send() => result,
                _ = self.cancellation_token.cancelled() => return Err(SyncError::Cancelled.into()),
            };

            match result {
                Ok(_) => break,
                Err(e)
                    if self
                        .retryer
                        .should_retry(&e, attempt, self.cancellation_token.is_cancelled()) =>
                {
                    attempt += 1;
                    warn!(key = object.key, error = %e, attempt = attempt, "put object failed. retrying.");
                    self.retryer.wait().await;
                }
                Err(e) => return Err(wrap_sdk_error(e)),
            }
        }

        if let Some(policy) = object.access_control_policy.clone() {
            self.put_acl(&object.key, &policy).await?;
        }

        Ok(())
    }

    async fn delete_object(&self, object: &Object) -> Result<()> {
        let full_key = self.full_key(&object.key);
        let mut attempt: u32 = 0;

        loop {
            let request = self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .set_version_id(object.version_id.clone());

            let result = tokio::select! {
                result = request.send() => result,
                _ = self.cancellation_token.cancelled() => return Err(SyncError::Cancelled.into()),
            };

            match result {
                Ok(_) => return Ok(()),
                Err(e)
                    if self
                        .retryer
                        .should_retry(&e, attempt, self.cancellation_token.is_cancelled()) =>
                {
                    attempt += 1;
                    warn!(key = object.key, error = %e, attempt = attempt, "delete object failed. retrying.");
                    self.retryer.wait().await;
                }
                Err(e) => return Err(wrap_sdk_error(e)),
            }
        }
    }
}

/// Canned ACL to send on a put. The empty string leaves the backend default,
/// and the copy sentinel never reaches the wire (it is resolved by the
/// driver into an explicit policy).
fn canned_acl(acl: Option<&str>) -> Option<ObjectCannedAcl> {
    acl.filter(|acl| !acl.is_empty() && *acl != ACL_COPY_SENTINEL)
        .map(ObjectCannedAcl::from)
}

pub(crate) fn classify_sdk_error<E>(e: &SdkError<E, Response>) -> StorageErrorKind
where
    E: ProvideErrorMetadata,
{
    if let SdkError::ServiceError(context) = e {
        match context.raw().status().as_u16() {
            404 => return StorageErrorKind::NotFound,
            401 | 403 => return StorageErrorKind::PermissionDenied,
            _ => {}
        }
    }

    match e.code() {
        Some("NoSuchKey") | Some("NotFound") | Some("NoSuchVersion") => StorageErrorKind::NotFound,
        Some("AccessDenied") => StorageErrorKind::PermissionDenied,
        _ => StorageErrorKind::Other,
    }
}

pub(crate) fn wrap_sdk_error<E>(e: SdkError<E, Response>) -> anyhow::Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let kind = classify_sdk_error(&e);
    anyhow::Error::new(e).context(kind)
}

fn to_sdk_access_control_policy(
    policy: &AccessControlPolicy,
) -> Result<aws_sdk_s3::types::AccessControlPolicy> {
    let mut builder = aws_sdk_s3::types::AccessControlPolicy::builder();

    if let Some(owner) = &policy.owner {
        builder = builder.owner(
            aws_sdk_s3::types::Owner::builder()
                .set_id(owner.id.clone())
                .set_display_name(owner.display_name.clone())
                .build(),
        );
    }

    for grant in &policy.grants {
        let grantee = aws_sdk_s3::types::Grantee::builder()
            .r#type(aws_sdk_s3::types::Type::from(
                grant.grantee.grantee_type.as_str(),
            ))
            .set_id(grant.grantee.id.clone())
            .set_uri(grant.grantee.uri.clone())
            .set_email_address(grant.grantee.email_address.clone())
            .set_display_name(grant.grantee.display_name.clone())
            .build()
            .context("invalid grantee in the access control policy")?;

        builder = builder.grants(
            aws_sdk_s3::types::Grant::builder()
                .grantee(grantee)
                .permission(aws_sdk_s3::types::Permission::from(
                    grant.permission.as_str(),
                ))
                .build(),
        );
    }

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_acl_mapping() {
        assert_eq!(canned_acl(None), None);
        assert_eq!(canned_acl(Some("")), None);
        assert_eq!(canned_acl(Some("copy")), None);
        assert_eq!(
            canned_acl(Some("public-read")),
            Some(ObjectCannedAcl::PublicRead)
        );
    }

    #[test]
    fn access_control_policy_conversion() {
        let policy = AccessControlPolicy {
            owner: Some(Owner {
                id: Some("owner-id".to_string()),
                display_name: Some("owner".to_string()),
            }),
            grants: vec![Grant {
                grantee: Grantee {
                    grantee_type: "CanonicalUser".to_string(),
                    id: Some("grantee-id".to_string()),
                    uri: None,
                    email_address: None,
                    display_name: None,
                },
                permission: "FULL_CONTROL".to_string(),
            }],
        };

        let converted = to_sdk_access_control_policy(&policy).unwrap();
        assert_eq!(converted.owner().unwrap().id(), Some("owner-id"));
        assert_eq!(converted.grants().len(), 1);
        assert_eq!(
            converted.grants()[0].permission(),
            Some(&aws_sdk_s3::types::Permission::FullControl)
        );
    }

    #[test]
    fn relative_key_strips_prefix() {
        let storage_prefix = "pre/";
        let key = "pre/a/b";
        let stripped = key.strip_prefix(storage_prefix).unwrap_or(key);
        assert_eq!(stripped.trim_start_matches('/'), "a/b");
    }
}
