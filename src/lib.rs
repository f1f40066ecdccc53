/*!
# Overview
blobsync is a high-throughput bulk object synchronizer between two blob
stores. Source and target are each one of: an S3-compatible store (buffered,
streaming, or versioned variant), an OpenStack Swift container, an Azure Blob
container, or a local filesystem tree.

The tool enumerates every object at the source, optionally filters and
transforms it, and writes it to the target preserving content, content
metadata (MIME type, encoding, language, disposition, cache-control), user
metadata, ACL and storage class where the backend supports them.

## How it works
The sync runs as a staged pipeline ([`pipeline::Group`]): an ordered list of
stages, each with its own worker pool and bounded queues. The first stage
lists the source; filter stages drop objects; loader stages fetch metadata
and content; the upload stage writes to the target; a terminator drains the
tail. Errors flow through an aggregate stream that ends with a single `None`
sentinel when the pipeline reaches a terminal state.

Backends implement one uniform contract ([`storage::StorageTrait`]); the
pipeline never branches on the backend type.

## As a library

```no_run
use blobsync::config::{parse_storage_url, SyncConfig};
use blobsync::driver::SyncDriver;
use blobsync::types::token::create_pipeline_cancellation_token;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = SyncConfig::new(
        parse_storage_url("/var/data")?,
        parse_storage_url("s3://backup-bucket/data/")?,
    );
    config.filters.include_exts = vec!["png".to_string(), "jpg".to_string()];

    let cancellation_token = create_pipeline_cancellation_token();
    let status = SyncDriver::new(config, cancellation_token).run().await?;

    std::process::exit(status.exit_code());
}
```
*/

pub mod config;
pub mod driver;
pub mod pipeline;
pub mod storage;
pub mod types;
