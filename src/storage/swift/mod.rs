use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_channel::Sender;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use leaky_bucket::RateLimiter;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};

use crate::config::SwiftConfig;
use crate::storage::{acquire_rate_limit, strong_etag, StorageTrait};
use crate::types::error::{StorageErrorKind, SyncError};
use crate::types::token::PipelineCancellationToken;
use crate::types::Object;

const USER_METADATA_HEADER_PREFIX: &str = "x-object-meta-";

/// OpenStack Swift container backend over plain HTTP: v1 token auth, JSON
/// listings with marker pagination. Swift has no per-object ACLs, so the
/// ACL read is a no-op.
#[derive(Clone)]
pub struct SwiftStorage {
    http: reqwest::Client,
    auth_url: String,
    user: String,
    key: String,
    container: String,
    prefix: String,
    endpoint: Arc<OnceCell<SwiftEndpoint>>,
    cancellation_token: PipelineCancellationToken,
    rate_limiter: Option<Arc<RateLimiter>>,
}

#[derive(Debug, Clone)]
struct SwiftEndpoint {
    storage_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct SwiftListEntry {
    name: String,
    hash: String,
    bytes: i64,
    content_type: String,
    last_modified: String,
}

impl SwiftStorage {
    pub fn new(container: &str, prefix: &str, config: &SwiftConfig) -> Result<Self> {
        let auth_url = config
            .auth_url
            .clone()
            .ok_or_else(|| anyhow!("swift auth url is not configured"))?;

        Ok(Self {
            http: reqwest::Client::new(),
            auth_url,
            user: config.user.clone().unwrap_or_default(),
            key: config.key.clone().unwrap_or_default(),
            container: container.to_string(),
            prefix: prefix.to_string(),
            endpoint: Arc::new(OnceCell::new()),
            cancellation_token: crate::types::token::create_pipeline_cancellation_token(),
            rate_limiter: None,
        })
    }

    /// Authenticate once per backend; every clone shares the result.
    async fn endpoint(&self) -> Result<&SwiftEndpoint> {
        self.endpoint
            .get_or_try_init(|| async {
                debug!(auth_url = self.auth_url, "authenticating against swift.");

                let response = self
                    .http
                    .get(&self.auth_url)
                    .header("X-Auth-User", &self.user)
                    .header("X-Auth-Key", &self.key)
                    .send()
                    .await
                    .map_err(|e| anyhow!(e).context(StorageErrorKind::Other))?;

                if !response.status().is_success() {
                    return Err(status_error(response.status(), "swift authentication failed"));
                }

                let storage_url = header_string(response.headers(), "X-Storage-Url")
                    .ok_or_else(|| anyhow!("no storage url in the auth response"))?;
                let token = header_string(response.headers(), "X-Auth-Token")
                    .ok_or_else(|| anyhow!("no token in the auth response"))?;

                Ok(SwiftEndpoint { storage_url, token })
            })
            .await
    }

    fn object_url(&self, endpoint: &SwiftEndpoint, key: &str) -> String {
        format!(
            "{}/{}/{}{}",
            endpoint.storage_url, self.container, self.prefix, key
        )
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = tokio::select! {
            result = request.send() => {
                result.map_err(|e| anyhow!(e).context(StorageErrorKind::Other))?
            }
            _ = self.cancellation_token.cancelled() => return Err(SyncError::Cancelled.into()),
        };

        if !response.status().is_success() {
            return Err(status_error(response.status(), "swift request failed"));
        }

        Ok(response)
    }
}

#[async_trait]
impl StorageTrait for SwiftStorage {
    fn with_cancellation_token(&mut self, token: PipelineCancellationToken) {
        self.cancellation_token = token;
    }

    fn with_rate_limit(&mut self, bytes_per_sec: u32) -> Result<()> {
        self.rate_limiter = Some(crate::storage::build_rate_limiter(bytes_per_sec)?);
        Ok(())
    }

    async fn list(&self, sender: &Sender<Object>) -> Result<()> {
        let endpoint = self.endpoint().await.context("container listing aborted")?;
        let container_url = format!("{}/{}", endpoint.storage_url, self.container);
        let mut marker = String::new();

        loop {
            if self.cancellation_token.is_cancelled() {
                trace!("container listing has been cancelled.");
                return Err(SyncError::Cancelled.into());
            }

            let request = self
                .http
                .get(&container_url)
                .header("X-Auth-Token", &endpoint.token)
                .query(&[
                    ("format", "json"),
                    ("prefix", self.prefix.as_str()),
                    ("marker", marker.as_str()),
                ]);

            let response = self
                .execute(request)
                .await
                .context("container listing aborted")?;
            let entries: Vec<SwiftListEntry> = response
                .json()
                .await
                .map_err(|e| anyhow!(e).context("container listing aborted"))?;

            let Some(last) = entries.last() else { break };
            marker = last.name.clone();

            for entry in entries {
                let key = entry
                    .name
                    .strip_prefix(&self.prefix)
                    .unwrap_or(&entry.name)
                    .trim_start_matches('/');
                if key.is_empty() {
                    continue;
                }

                let object = Object {
                    key: key.to_string(),
                    e_tag: Some(strong_etag(&entry.hash)),
                    content_type: Some(entry.content_type.clone()),
                    content_length: Some(entry.bytes),
                    mtime: parse_swift_timestamp(&entry.last_modified),
                    is_latest: Some(true),
                    ..Default::default()
                };

                if sender.send(object).await.is_err() {
                    trace!("the next stage has gone away. stop listing.");
                    return Ok(());
                }
            }
        }

        debug!(container = self.container, "container listing finished.");
        Ok(())
    }

    async fn get_object_meta(&self, object: &mut Object) -> Result<()> {
        let endpoint = self.endpoint().await?;
        let request = self
            .http
            .head(self.object_url(endpoint, &object.key))
            .header("X-Auth-Token", &endpoint.token);

        let response = self.execute(request).await?;
        apply_response_headers(object, response.headers());

        Ok(())
    }

    async fn get_object_acl(&self, _object: &mut Object) -> Result<()> {
        // swift has container-level access control only
        Ok(())
    }

    async fn get_object_content(&self, object: &mut Object) -> Result<()> {
        let endpoint = self.endpoint().await?;
        let request = self
            .http
            .get(self.object_url(endpoint, &object.key))
            .header("X-Auth-Token", &endpoint.token);

        let response = self.execute(request).await?;
        apply_response_headers(object, response.headers());

        let data = response
            .bytes()
            .await
            .map_err(|e| anyhow!(e).context("failed to read the object body"))?;

        if let Some(limiter) = &self.rate_limiter {
            acquire_rate_limit(limiter, data.len()).await;
        }

        object.content_length = Some(data.len() as i64);
        object.content = Some(data.to_vec());
        object.content_stream = None;

        Ok(())
    }

    async fn put_object(&self, object: &mut Object) -> Result<()> {
        let endpoint = self.endpoint().await?;

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

        let mut request = self
            .http
            .put(self.object_url(endpoint, &object.key))
            .header("X-Auth-Token", &endpoint.token);

        if let Some(content_type) = &object.content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if let Some(content_disposition) = &object.content_disposition {
            request = request.header(reqwest::header::CONTENT_DISPOSITION, content_disposition);
        }
        if let Some(content_encoding) = &object.content_encoding {
            request = request.header(reqwest::header::CONTENT_ENCODING, content_encoding);
        }
        if let Some(cache_control) = &object.cache_control {
            request = request.header(reqwest::header::CACHE_CONTROL, cache_control);
        }
        if let Some(metadata) = &object.metadata {
            for (name, value) in metadata {
                request = request.header(
                    format!("{USER_METADATA_HEADER_PREFIX}{name}"),
                    value.as_str(),
                );
            }
        }

        self.execute(request.body(bytes)).await?;
        Ok(())
    }

    async fn delete_object(&self, object: &Object) -> Result<()> {
        let endpoint = self.endpoint().await?;
        let request = self
            .http
            .delete(self.object_url(endpoint, &object.key))
            .header("X-Auth-Token", &endpoint.token);

        self.execute(request).await?;
        Ok(())
    }
}

fn status_error(status: StatusCode, message: &str) -> anyhow::Error {
    let kind = match status.as_u16() {
        404 => StorageErrorKind::NotFound,
        401 | 403 => StorageErrorKind::PermissionDenied,
        _ => StorageErrorKind::Other,
    };

    anyhow!("{}: status {}", message, status).context(kind)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn apply_response_headers(object: &mut Object, headers: &HeaderMap) {
    object.content_type = header_string(headers, "content-type");
    object.content_disposition = header_string(headers, "content-disposition");
    object.content_encoding = header_string(headers, "content-encoding");
    object.cache_control = header_string(headers, "cache-control");
    object.e_tag = header_string(headers, "etag").map(|etag| strong_etag(&etag));
    object.content_length = header_string(headers, "content-length")
        .and_then(|length| length.parse::<i64>().ok());
    object.mtime = header_string(headers, "last-modified")
        .and_then(|value| DateTime::parse_from_rfc2822(&value).ok())
        .map(|value| value.with_timezone(&Utc));

    let mut metadata = HashMap::new();
    for (name, value) in headers {
        if let Some(meta_key) = name.as_str().strip_prefix(USER_METADATA_HEADER_PREFIX) {
            if let Ok(value) = value.to_str() {
                metadata.insert(meta_key.to_string(), value.to_string());
            }
        }
    }
    object.metadata = if metadata.is_empty() {
        None
    } else {
        Some(metadata)
    };
}

/// Listing timestamps come back without a zone designator and are UTC.
fn parse_swift_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(parsed.and_utc());
    }

    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .inspect_err(|e| warn!(value = value, error = %e, "unparsable listing timestamp."))
        .ok()
}
