use std::sync::Arc;

use anyhow::Result;
use async_channel::Sender;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dyn_clone::DynClone;
use leaky_bucket::RateLimiter;

use crate::types::Object;

pub mod azure;
pub mod factory;
pub mod local;
pub mod s3;
pub mod swift;

pub type Storage = Box<dyn StorageTrait + Send + Sync>;

pub struct StoragePair {
    pub source: Storage,
    pub target: Storage,
}

/// Uniform view over the supported backends. The pipeline never branches on
/// the backend type.
///
/// A backend is configured once (`with_cancellation_token`,
/// `with_rate_limit`) and then shared immutably by every worker of its side.
/// Clones share the rate limiter and the underlying client.
#[async_trait]
pub trait StorageTrait: DynClone {
    /// Bind the cancellation scope. All subsequent I/O observes it.
    fn with_cancellation_token(&mut self, token: crate::types::token::PipelineCancellationToken);

    /// Install a backend-wide bytes/sec token bucket shared by all
    /// concurrent I/O through this backend.
    fn with_rate_limit(&mut self, bytes_per_sec: u32) -> Result<()>;

    /// Enumerate every object under the configured prefix, one object per
    /// entry, in no particular order. Pagination is internal. Blocks until
    /// enumeration completes or the scope is cancelled.
    async fn list(&self, sender: &Sender<Object>) -> Result<()>;

    /// Populate metadata-only fields from the backend's head/stat call.
    async fn get_object_meta(&self, object: &mut Object) -> Result<()>;

    /// Populate the explicit access control policy. No-op on backends
    /// without object ACLs.
    async fn get_object_acl(&self, object: &mut Object) -> Result<()>;

    /// Populate content (buffered or streamed, the backend's choice) and all
    /// metadata fields.
    async fn get_object_content(&self, object: &mut Object) -> Result<()>;

    /// Write content and metadata. A stream is uploaded as-is when present;
    /// otherwise the buffered content is used. The version id is ignored,
    /// the write always lands as the latest version. An explicit access
    /// control policy is applied as a second call after the put.
    async fn put_object(&self, object: &mut Object) -> Result<()>;

    /// Remove the object; versioned backends honor the version id.
    async fn delete_object(&self, object: &Object) -> Result<()>;
}

/// Remove the weak-indicator prefix from an ETag.
///
/// Some stores return `W/"…"` which only differs in strength. All
/// comparisons in the pipeline run on the normalized form.
pub fn strong_etag(etag: &str) -> String {
    etag.strip_prefix("W/").unwrap_or(etag).to_string()
}

/// Derive a deterministic ETag from filesystem attributes, for local objects
/// that carry no stored metadata record.
pub fn etag_from_metadata(mtime: DateTime<Utc>, size: i64) -> String {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&mtime.timestamp().to_le_bytes());
    buf[8..].copy_from_slice(&size.to_le_bytes());

    format!("{:x}", md5::compute(buf))
}

// default refill interval is 100ms
const REFILL_PER_INTERVAL_DIVIDER: usize = 10;

pub fn build_rate_limiter(rate: u32) -> Result<Arc<RateLimiter>> {
    if rate == 0 {
        return Err(crate::types::error::SyncError::InvalidRateLimit.into());
    }

    let refill = if rate <= REFILL_PER_INTERVAL_DIVIDER as u32 {
        1
    } else {
        rate as usize / REFILL_PER_INTERVAL_DIVIDER
    };

    Ok(Arc::new(
        RateLimiter::builder()
            .max(rate as usize)
            .initial(rate as usize)
            .refill(refill)
            .fair(true)
            .build(),
    ))
}

/// Acquire permits for a transfer of `amount` bytes. A single acquisition is
/// capped at the bucket's capacity, so large bodies drain in slices.
pub(crate) async fn acquire_rate_limit(limiter: &RateLimiter, mut amount: usize) {
    while amount > 0 {
        let chunk = amount.min(limiter.max());
        limiter.acquire(chunk).await;
        amount -= chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_etag_strips_weak_prefix() {
        assert_eq!(strong_etag("W/\"abc\""), "\"abc\"");
        assert_eq!(strong_etag("\"abc\""), "\"abc\"");
    }

    #[test]
    fn strong_etag_is_idempotent() {
        for etag in ["W/\"abc\"", "\"abc\"", "", "W/", "plain"] {
            assert_eq!(strong_etag(&strong_etag(etag)), strong_etag(etag));
        }
    }

    #[test]
    fn etag_from_metadata_is_deterministic() {
        let mtime = DateTime::from_timestamp(1674000000, 0).unwrap();

        assert_eq!(
            etag_from_metadata(mtime, 4096),
            etag_from_metadata(mtime, 4096)
        );
        assert_ne!(
            etag_from_metadata(mtime, 4096),
            etag_from_metadata(mtime, 4097)
        );

        let other_mtime = DateTime::from_timestamp(1674000001, 0).unwrap();
        assert_ne!(
            etag_from_metadata(mtime, 4096),
            etag_from_metadata(other_mtime, 4096)
        );
    }

    #[test]
    fn etag_from_metadata_uses_full_width_fields() {
        // values that collide when truncated to a single byte must not collide
        let mtime_a = DateTime::from_timestamp(0x0101, 0).unwrap();
        let mtime_b = DateTime::from_timestamp(0x0201, 0).unwrap();

        assert_ne!(
            etag_from_metadata(mtime_a, 0x0102),
            etag_from_metadata(mtime_b, 0x0202)
        );
    }

    #[test]
    fn build_rate_limiter_rejects_zero() {
        assert!(build_rate_limiter(0).is_err());
        assert!(build_rate_limiter(1).is_ok());
        assert!(build_rate_limiter(1024 * 1024).is_ok());
    }
}
