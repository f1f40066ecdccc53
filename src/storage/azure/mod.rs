use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_channel::Sender;
use async_trait::async_trait;
use futures_util::StreamExt;
use leaky_bucket::RateLimiter;
use object_store::azure::{MicrosoftAzure, MicrosoftAzureBuilder};
use object_store::path::Path as StorePath;
use object_store::{Attribute, Attributes, GetOptions, ObjectStore, PutPayload};
use tracing::{debug, trace};

use crate::config::AzureConfig;
use crate::storage::{acquire_rate_limit, strong_etag, StorageTrait};
use crate::types::error::{StorageErrorKind, SyncError};
use crate::types::token::PipelineCancellationToken;
use crate::types::Object;

/// Azure Blob container backend. Blobs carry no per-object ACL (access
/// control is container-level), so the ACL read is a no-op.
#[derive(Clone)]
pub struct AzureStorage {
    store: Arc<MicrosoftAzure>,
    prefix: String,
    cancellation_token: PipelineCancellationToken,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl AzureStorage {
    pub fn new(container: &str, prefix: &str, config: &AzureConfig) -> Result<Self> {
        let mut builder = MicrosoftAzureBuilder::from_env().with_container_name(container);

        if let Some(account) = &config.account {
            builder = builder.with_account(account.clone());
        }
        if let Some(access_key) = &config.access_key {
            builder = builder.with_access_key(access_key.clone());
        }

        Ok(Self {
            store: Arc::new(
                builder
                    .build()
                    .context("failed to configure the azure client")?,
            ),
            prefix: prefix.to_string(),
            cancellation_token: crate::types::token::create_pipeline_cancellation_token(),
            rate_limiter: None,
        })
    }

    fn location(&self, key: &str) -> StorePath {
        StorePath::from(format!("{}{}", self.prefix, key))
    }

    fn relative_key<'a>(&self, location: &'a str) -> &'a str {
        location
            .strip_prefix(&self.prefix)
            .unwrap_or(location)
            .trim_start_matches('/')
    }

    fn apply_attributes(object: &mut Object, attributes: &Attributes) {
        let mut metadata = std::collections::HashMap::new();

        for (attribute, value) in attributes.iter() {
            match attribute {
                Attribute::ContentType => object.content_type = Some(value.to_string()),
                Attribute::ContentDisposition => {
                    object.content_disposition = Some(value.to_string())
                }
                Attribute::ContentEncoding => object.content_encoding = Some(value.to_string()),
                Attribute::ContentLanguage => object.content_language = Some(value.to_string()),
                Attribute::CacheControl => object.cache_control = Some(value.to_string()),
                Attribute::Metadata(name) => {
                    metadata.insert(name.to_string(), value.to_string());
                }
                _ => {}
            }
        }

        if !metadata.is_empty() {
            object.metadata = Some(metadata);
        }
    }

    fn build_attributes(object: &Object) -> Attributes {
        let mut attributes = Attributes::new();

        if let Some(content_type) = &object.content_type {
            attributes.insert(Attribute::ContentType, content_type.clone().into());
        }
        if let Some(content_disposition) = &object.content_disposition {
            attributes.insert(
                Attribute::ContentDisposition,
                content_disposition.clone().into(),
            );
        }
        if let Some(content_encoding) = &object.content_encoding {
            attributes.insert(Attribute::ContentEncoding, content_encoding.clone().into());
        }
        if let Some(content_language) = &object.content_language {
            attributes.insert(Attribute::ContentLanguage, content_language.clone().into());
        }
        if let Some(cache_control) = &object.cache_control {
            attributes.insert(Attribute::CacheControl, cache_control.clone().into());
        }
        if let Some(metadata) = &object.metadata {
            for (name, value) in metadata {
                attributes.insert(
                    Attribute::Metadata(Cow::Owned(name.clone())),
                    value.clone().into(),
                );
            }
        }

        attributes
    }
}

#[async_trait]
impl StorageTrait for AzureStorage {
    fn with_cancellation_token(&mut self, token: PipelineCancellationToken) {
        self.cancellation_token = token;
    }

    fn with_rate_limit(&mut self, bytes_per_sec: u32) -> Result<()> {
        self.rate_limiter = Some(crate::storage::build_rate_limiter(bytes_per_sec)?);
        Ok(())
    }

    async fn list(&self, sender: &Sender<Object>) -> Result<()> {
        let list_prefix = if self.prefix.is_empty() {
            None
        } else {
            Some(StorePath::from(self.prefix.trim_end_matches('/')))
        };

        let mut entries = self.store.list(list_prefix.as_ref());

        loop {
            let next = tokio::select! {
                next = entries.next() => next,
                _ = self.cancellation_token.cancelled() => {
                    trace!("container listing has been cancelled.");
                    return Err(SyncError::Cancelled.into());
                }
            };

            let Some(entry) = next else { break };
            let meta = entry.map_err(|e| wrap_store_error(e).context("container listing aborted"))?;

            let key = self.relative_key(meta.location.as_ref());
            if key.is_empty() {
                continue;
            }

            let object = Object {
                key: key.to_string(),
                e_tag: meta.e_tag.as_deref().map(strong_etag),
                mtime: Some(meta.last_modified),
                content_length: Some(meta.size as i64),
                is_latest: Some(true),
                ..Default::default()
            };

            if sender.send(object).await.is_err() {
                trace!("the next stage has gone away. stop listing.");
                return Ok(());
            }
        }

        debug!("container listing finished.");
        Ok(())
    }

    async fn get_object_meta(&self, object: &mut Object) -> Result<()> {
        let mut options = GetOptions::default();
        options.head = true;

        let location = self.location(&object.key);
        let result = tokio::select! {
            result = self.store.get_opts(&location, options) => result.map_err(wrap_store_error)?,
            _ = self.cancellation_token.cancelled() => return Err(SyncError::Cancelled.into()),
        };

        object.e_tag = result.meta.e_tag.as_deref().map(strong_etag);
        object.mtime = Some(result.meta.last_modified);
        object.content_length = Some(result.meta.size as i64);
        Self::apply_attributes(object, &result.attributes);

        Ok(())
    }

    async fn get_object_acl(&self, _object: &mut Object) -> Result<()> {
        Ok(())
    }

    async fn get_object_content(&self, object: &mut Object) -> Result<()> {
        let location = self.location(&object.key);
        let result = tokio::select! {
            result = self.store.get(&location) => result.map_err(wrap_store_error)?,
            _ = self.cancellation_token.cancelled() => return Err(SyncError::Cancelled.into()),
        };

        object.e_tag = result.meta.e_tag.as_deref().map(strong_etag);
        object.mtime = Some(result.meta.last_modified);
        Self::apply_attributes(object, &result.attributes);

        let data = tokio::select! {
            data = result.bytes() => data.map_err(wrap_store_error)?,
            _ = self.cancellation_token.cancelled() => return Err(SyncError::Cancelled.into()),
        };

        if let Some(limiter) = &self.rate_limiter {
            acquire_rate_limit(limiter, data.len()).await;
        }

        object.content_length = Some(data.len() as i64);
        object.content = Some(data.to_vec());
        object.content_stream = None;

        Ok(())
    }

    async fn put_object(&self, object: &mut Object) -> Result<()> {
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

        let mut options = object_store::PutOptions::default();
        options.attributes = Self::build_attributes(object);

        let location = self.location(&object.key);
        tokio::select! {
            result = self.store.put_opts(&location, PutPayload::from(bytes), options) => {
                result.map_err(wrap_store_error)?;
            }
            _ = self.cancellation_token.cancelled() => return Err(SyncError::Cancelled.into()),
        }

        Ok(())
    }

    async fn delete_object(&self, object: &Object) -> Result<()> {
        let location = self.location(&object.key);
        tokio::select! {
            result = self.store.delete(&location) => {
                result.map_err(wrap_store_error)?;
            }
            _ = self.cancellation_token.cancelled() => return Err(SyncError::Cancelled.into()),
        }

        Ok(())
    }
}

fn classify_store_error(e: &object_store::Error) -> StorageErrorKind {
    match e {
        object_store::Error::NotFound { .. } => StorageErrorKind::NotFound,
        object_store::Error::PermissionDenied { .. }
        | object_store::Error::Unauthenticated { .. } => StorageErrorKind::PermissionDenied,
        _ => StorageErrorKind::Other,
    }
}

fn wrap_store_error(e: object_store::Error) -> anyhow::Error {
    let kind = classify_store_error(&e);
    anyhow::Error::new(e).context(kind)
}
