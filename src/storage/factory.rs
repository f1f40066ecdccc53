use anyhow::Result;

use crate::config::{ClientConfig, SyncConfig};
use crate::storage::azure::AzureStorage;
use crate::storage::local::FsStorage;
use crate::storage::s3::streaming::S3StreamingStorage;
use crate::storage::s3::versioned::S3VersionedStorage;
use crate::storage::s3::S3Storage;
use crate::storage::swift::SwiftStorage;
use crate::storage::{Storage, StoragePair};
use crate::types::token::PipelineCancellationToken;
use crate::types::StoragePath;

/// Build one configured backend: bind the cancellation scope and install the
/// bandwidth limit before the instance is shared.
pub async fn create_storage(
    config: &SyncConfig,
    path: &StoragePath,
    client_config: &ClientConfig,
    cancellation_token: PipelineCancellationToken,
) -> Result<Storage> {
    let mut storage: Storage = match path {
        StoragePath::Local(dir) => Box::new(FsStorage::new(dir, &config.fs)),
        StoragePath::S3 { bucket, prefix } => {
            Box::new(S3Storage::new(bucket, prefix, &client_config.s3).await)
        }
        StoragePath::S3Streaming { bucket, prefix } => {
            Box::new(S3StreamingStorage::new(bucket, prefix, &client_config.s3).await)
        }
        StoragePath::S3Versioned { bucket, prefix } => {
            Box::new(S3VersionedStorage::new(bucket, prefix, &client_config.s3).await)
        }
        StoragePath::Swift { container, prefix } => {
            Box::new(SwiftStorage::new(container, prefix, &client_config.swift)?)
        }
        StoragePath::Azure { container, prefix } => {
            Box::new(AzureStorage::new(container, prefix, &client_config.azure)?)
        }
    };

    storage.with_cancellation_token(cancellation_token);

    if let Some(bytes_per_sec) = config.rate_limit_bandwidth {
        storage.with_rate_limit(bytes_per_sec)?;
    }

    Ok(storage)
}

pub async fn create_storage_pair(
    config: &SyncConfig,
    cancellation_token: PipelineCancellationToken,
) -> Result<StoragePair> {
    let source = create_storage(
        config,
        &config.source,
        &config.source_client,
        cancellation_token.clone(),
    )
    .await?;
    let target = create_storage(
        config,
        &config.target,
        &config.target_client,
        cancellation_token,
    )
    .await?;

    Ok(StoragePair { source, target })
}
