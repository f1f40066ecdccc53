use std::fmt;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use url::Url;

use crate::types::error::{ErrorHandlingMask, SyncError};
use crate::types::StoragePath;

pub const DEFAULT_WORKER_SIZE: u16 = 16;
pub const DEFAULT_LIST_BUFFER_SIZE: usize = 1000;
pub const DEFAULT_KEYS_PER_REQUEST: i32 = 1000;
pub const DEFAULT_FS_FILE_PERM: u32 = 0o644;
pub const DEFAULT_FS_DIR_PERM: u32 = 0o755;
pub const DEFAULT_FS_BUF_SIZE: usize = 1024 * 1024;

/// The configuration record the driver consumes. The CLI (or any embedding
/// program) builds one of these and hands it over.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source: StoragePath,
    pub target: StoragePath,
    pub worker_size: u16,
    pub list_buffer_size: usize,
    pub rate_limit_bandwidth: Option<u32>,
    pub rate_limit_objects: Option<u32>,
    pub error_mask: ErrorHandlingMask,
    pub sync_log: bool,
    pub acl: Option<String>,
    pub storage_class: Option<String>,
    pub cache_control: Option<String>,
    pub filters: FilterConfig,
    pub fs: FsConfig,
    pub source_client: ClientConfig,
    pub target_client: ClientConfig,
}

impl SyncConfig {
    pub fn new(source: StoragePath, target: StoragePath) -> Self {
        Self {
            source,
            target,
            worker_size: DEFAULT_WORKER_SIZE,
            list_buffer_size: DEFAULT_LIST_BUFFER_SIZE,
            rate_limit_bandwidth: None,
            rate_limit_objects: None,
            error_mask: ErrorHandlingMask::empty(),
            sync_log: false,
            acl: None,
            storage_class: None,
            cache_control: None,
            filters: FilterConfig::default(),
            fs: FsConfig::default(),
            source_client: ClientConfig::default(),
            target_client: ClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    pub include_exts: Vec<String>,
    pub exclude_exts: Vec<String>,
    pub include_content_types: Vec<String>,
    pub exclude_content_types: Vec<String>,
    pub mtime_after: Option<i64>,
    pub mtime_before: Option<i64>,
    pub dirs_only: bool,
    pub skip_dirs: bool,
    pub exist_only: bool,
    pub missing_only: bool,
    pub modified_only: bool,
}

impl FilterConfig {
    /// Content-type filters compare loaded metadata, and local sources list
    /// bare keys, so some combinations need a metadata load up front.
    pub fn needs_source_meta(&self, source_is_local: bool) -> bool {
        if !self.include_content_types.is_empty() || !self.exclude_content_types.is_empty() {
            return true;
        }

        source_is_local
            && (self.mtime_after.is_some() || self.mtime_before.is_some() || self.modified_only)
    }
}

#[derive(Debug, Clone)]
pub struct FsConfig {
    pub file_perm: u32,
    pub dir_perm: u32,
    pub buf_size: usize,
    pub use_xattr: bool,
    pub atomic_write: bool,
    pub list_error_mask: ErrorHandlingMask,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            file_perm: DEFAULT_FS_FILE_PERM,
            dir_perm: DEFAULT_FS_DIR_PERM,
            buf_size: DEFAULT_FS_BUF_SIZE,
            use_xattr: true,
            atomic_write: false,
            list_error_mask: ErrorHandlingMask::empty(),
        }
    }
}

/// Per-side remote credentials and tuning. Only the section matching the
/// side's storage path is read.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub s3: S3Config,
    pub swift: SwiftConfig,
    pub azure: AzureConfig,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub credentials: S3Credentials,
    pub force_path_style: bool,
    pub keys_per_request: i32,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: None,
            endpoint_url: None,
            credentials: S3Credentials::FromEnvironment,
            force_path_style: true,
            keys_per_request: DEFAULT_KEYS_PER_REQUEST,
            retry_count: 0,
            retry_delay: Duration::from_secs(0),
        }
    }
}

#[derive(Clone, Default)]
pub enum S3Credentials {
    #[default]
    FromEnvironment,
    Static {
        access_key: String,
        secret_access_key: String,
        session_token: Option<String>,
    },
}

impl Debug for S3Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::FromEnvironment => f.write_str("FromEnvironment"),
            Self::Static { access_key, .. } => f
                .debug_struct("Static")
                .field("access_key", access_key)
                .field("secret_access_key", &"** redacted **")
                .field("session_token", &"** redacted **")
                .finish(),
        }
    }
}

#[derive(Clone, Default)]
pub struct SwiftConfig {
    pub auth_url: Option<String>,
    pub user: Option<String>,
    pub key: Option<String>,
}

impl Debug for SwiftConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let key = self.key.as_ref().map_or("None", |_| "** redacted **");
        f.debug_struct("SwiftConfig")
            .field("auth_url", &self.auth_url)
            .field("user", &self.user)
            .field("key", &key)
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct AzureConfig {
    pub account: Option<String>,
    pub access_key: Option<String>,
}

impl Debug for AzureConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let access_key = self.access_key.as_ref().map_or("None", |_| "** redacted **");
        f.debug_struct("AzureConfig")
            .field("account", &self.account)
            .field("access_key", &access_key)
            .finish()
    }
}

/// Parse an endpoint URI into a storage path. Anything without a recognized
/// scheme is a literal filesystem path.
pub fn parse_storage_url(value: &str) -> Result<StoragePath> {
    let Ok(url) = Url::parse(value) else {
        return Ok(StoragePath::Local(PathBuf::from(value)));
    };

    let bucket = url.host_str().unwrap_or("").to_string();
    let prefix = url.path().trim_start_matches('/').to_string();

    let require_bucket = |bucket: String| -> Result<String> {
        if bucket.is_empty() {
            return Err(SyncError::InvalidStorageUrl(value.to_string()).into());
        }
        Ok(bucket)
    };

    match url.scheme() {
        "s3" => Ok(StoragePath::S3 {
            bucket: require_bucket(bucket)?,
            prefix,
        }),
        "s3s" => Ok(StoragePath::S3Streaming {
            bucket: require_bucket(bucket)?,
            prefix,
        }),
        "s3v" => Ok(StoragePath::S3Versioned {
            bucket: require_bucket(bucket)?,
            prefix,
        }),
        "swift" => Ok(StoragePath::Swift {
            container: require_bucket(bucket)?,
            prefix,
        }),
        "az" => Ok(StoragePath::Azure {
            container: require_bucket(bucket)?,
            prefix,
        }),
        "fs" => Ok(StoragePath::Local(PathBuf::from(format!(
            "{}{}",
            bucket,
            url.path()
        )))),
        _ => Ok(StoragePath::Local(PathBuf::from(value))),
    }
}

/// Parse an octal permission string such as `0644`.
pub fn parse_file_permission(value: &str) -> Result<u32> {
    u32::from_str_radix(value, 8)
        .map_err(|e| anyhow::anyhow!("invalid permission {}: {}", value, e))
}

pub fn parse_error_mask(value: u8) -> ErrorHandlingMask {
    ErrorHandlingMask::from_bits_retain(value)
}
