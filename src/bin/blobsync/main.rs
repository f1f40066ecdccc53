use anyhow::Result;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use blobsync::config::{
    parse_error_mask, parse_file_permission, parse_storage_url, S3Credentials, SyncConfig,
};
use blobsync::driver::SyncDriver;
use blobsync::types::token::create_pipeline_cancellation_token;

/// Really fast bulk sync between blob stores.
#[derive(Parser, Debug)]
#[command(name = "blobsync", version, about)]
struct Cli {
    /// Source endpoint: s3://, s3s://, s3v://, swift://, az:// or a local path
    source: String,
    /// Target endpoint, same forms as the source
    target: String,

    /// Source S3 access key
    #[arg(long = "sk")]
    source_access_key: Option<String>,
    /// Source S3 secret key
    #[arg(long = "ss")]
    source_secret_key: Option<String>,
    /// Source S3 region
    #[arg(long = "sr")]
    source_region: Option<String>,
    /// Source S3 endpoint
    #[arg(long = "se")]
    source_endpoint: Option<String>,

    /// Target S3 access key
    #[arg(long = "tk")]
    target_access_key: Option<String>,
    /// Target S3 secret key
    #[arg(long = "ts")]
    target_secret_key: Option<String>,
    /// Target S3 region
    #[arg(long = "tr")]
    target_region: Option<String>,
    /// Target S3 endpoint
    #[arg(long = "te")]
    target_endpoint: Option<String>,

    /// Swift auth endpoint (v1 token auth)
    #[arg(long, env = "SWIFT_AUTH_URL")]
    swift_auth_url: Option<String>,
    /// Swift user
    #[arg(long, env = "SWIFT_USER")]
    swift_user: Option<String>,
    /// Swift key
    #[arg(long, env = "SWIFT_KEY")]
    swift_key: Option<String>,

    /// Azure storage account
    #[arg(long, env = "AZURE_STORAGE_ACCOUNT")]
    azure_account: Option<String>,
    /// Azure storage access key
    #[arg(long, env = "AZURE_STORAGE_ACCESS_KEY")]
    azure_access_key: Option<String>,

    /// Max retries for a failed S3 request
    #[arg(long, default_value_t = 0)]
    s3_retry: u32,
    /// Sleep interval (sec) between retries
    #[arg(long, default_value_t = 0)]
    s3_retry_sleep: u64,
    /// Canned ACL for uploaded objects, or "copy" to replicate the source ACL
    #[arg(long)]
    s3_acl: Option<String>,
    /// Storage class for uploaded objects
    #[arg(long)]
    s3_storage_class: Option<String>,
    /// Cache-Control header for uploaded objects
    #[arg(long)]
    cache_control: Option<String>,
    /// Max keys per listing request
    #[arg(long, default_value_t = 1000)]
    s3_keys_per_req: i32,

    /// File permissions for filesystem writes (octal)
    #[arg(long, default_value = "0644")]
    fs_file_perm: String,
    /// Directory permissions for filesystem writes (octal)
    #[arg(long, default_value = "0755")]
    fs_dir_perm: String,
    /// Disable extended-attribute metadata storage
    #[arg(long)]
    fs_disable_xattr: bool,
    /// Write through a temp file and rename into place
    #[arg(long)]
    fs_atomic_write: bool,

    /// Sync only objects with the given extensions
    #[arg(long = "filter-ext")]
    filter_ext: Vec<String>,
    /// Skip objects with the given extensions
    #[arg(long = "filter-not-ext")]
    filter_not_ext: Vec<String>,
    /// Sync only objects with the given Content-Type
    #[arg(long = "filter-ct")]
    filter_ct: Vec<String>,
    /// Skip objects with the given Content-Type
    #[arg(long = "filter-not-ct")]
    filter_not_ct: Vec<String>,
    /// Sync only objects modified at or after the given unix timestamp
    #[arg(long)]
    filter_after_mtime: Option<i64>,
    /// Sync only objects modified before the given unix timestamp
    #[arg(long)]
    filter_before_mtime: Option<i64>,
    /// Skip objects whose ETag matches the target
    #[arg(long)]
    filter_modified: bool,
    /// Sync only objects that already exist on the target
    #[arg(long)]
    filter_exist: bool,
    /// Sync only objects missing from the target
    #[arg(long)]
    filter_not_exist: bool,
    /// Skip directory markers (keys ending with /)
    #[arg(long)]
    filter_dirs_not: bool,

    /// Workers per transfer stage
    #[arg(short = 'w', long, default_value_t = 16)]
    workers: u16,
    /// Size of the listing buffer
    #[arg(long, default_value_t = 1000)]
    list_buffer: usize,
    /// Bandwidth limit, bytes per second
    #[arg(long)]
    rate_limit_bandwidth: Option<u32>,
    /// Pipeline limit, objects per second
    #[arg(long)]
    rate_limit_obj_per_sec: Option<u32>,
    /// Error categories to tolerate: 1 not-found, 2 permission, 64 other, 255 all
    #[arg(long, default_value_t = 0)]
    on_fail_mask: u8,
    /// Log every synced object
    #[arg(long)]
    sync_log: bool,
    /// Show debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

fn build_config(cli: &Cli) -> Result<SyncConfig> {
    let source = parse_storage_url(&cli.source)?;
    let target = parse_storage_url(&cli.target)?;
    let mut config = SyncConfig::new(source, target);

    config.worker_size = cli.workers;
    config.list_buffer_size = cli.list_buffer;
    config.rate_limit_bandwidth = cli.rate_limit_bandwidth;
    config.rate_limit_objects = cli.rate_limit_obj_per_sec;
    config.error_mask = parse_error_mask(cli.on_fail_mask);
    config.sync_log = cli.sync_log;
    config.acl = cli.s3_acl.clone();
    config.storage_class = cli.s3_storage_class.clone();
    config.cache_control = cli.cache_control.clone();

    config.filters.include_exts = cli.filter_ext.clone();
    config.filters.exclude_exts = cli.filter_not_ext.clone();
    config.filters.include_content_types = cli.filter_ct.clone();
    config.filters.exclude_content_types = cli.filter_not_ct.clone();
    config.filters.mtime_after = cli.filter_after_mtime;
    config.filters.mtime_before = cli.filter_before_mtime;
    config.filters.modified_only = cli.filter_modified;
    config.filters.exist_only = cli.filter_exist;
    config.filters.missing_only = cli.filter_not_exist;
    config.filters.skip_dirs = cli.filter_dirs_not;

    config.fs.file_perm = parse_file_permission(&cli.fs_file_perm)?;
    config.fs.dir_perm = parse_file_permission(&cli.fs_dir_perm)?;
    config.fs.use_xattr = !cli.fs_disable_xattr;
    config.fs.atomic_write = cli.fs_atomic_write;
    config.fs.list_error_mask = parse_error_mask(cli.on_fail_mask);

    for (client, access_key, secret_key, region, endpoint) in [
        (
            &mut config.source_client,
            &cli.source_access_key,
            &cli.source_secret_key,
            &cli.source_region,
            &cli.source_endpoint,
        ),
        (
            &mut config.target_client,
            &cli.target_access_key,
            &cli.target_secret_key,
            &cli.target_region,
            &cli.target_endpoint,
        ),
    ] {
        if let (Some(access_key), Some(secret_key)) = (access_key, secret_key) {
            client.s3.credentials = S3Credentials::Static {
                access_key: access_key.clone(),
                secret_access_key: secret_key.clone(),
                session_token: None,
            };
        }
        client.s3.region = region.clone();
        client.s3.endpoint_url = endpoint.clone();
        client.s3.retry_count = cli.s3_retry;
        client.s3.retry_delay = std::time::Duration::from_secs(cli.s3_retry_sleep);
        client.s3.keys_per_request = cli.s3_keys_per_req;

        client.swift.auth_url = cli.swift_auth_url.clone();
        client.swift.user = cli.swift_user.clone();
        client.swift.key = cli.swift_key.clone();

        client.azure.account = cli.azure_account.clone();
        client.azure.access_key = cli.azure_access_key.clone();
    }

    Ok(config)
}

fn init_tracing(debug: bool) {
    let default_directive = if debug { "blobsync=debug" } else { "blobsync=info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = build_config(&cli)?;
    let cancellation_token = create_pipeline_cancellation_token();

    let ctrl_c_token = cancellation_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received. terminating.");
            ctrl_c_token.cancel();
        }
    });

    let status = SyncDriver::new(config, cancellation_token).run().await?;

    std::process::exit(status.exit_code());
}
