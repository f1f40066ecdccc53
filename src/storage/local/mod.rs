use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use async_channel::Sender;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leaky_bucket::RateLimiter;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::config::FsConfig;
use crate::storage::{acquire_rate_limit, etag_from_metadata, StorageTrait};
use crate::types::error::{ErrorHandlingMask, StorageErrorKind, SyncError};
use crate::types::token::PipelineCancellationToken;
use crate::types::{Object, ObjectMetaRecord};

/// Extended attribute holding the JSON metadata record of a local object.
pub const METADATA_XATTR_NAME: &str = "user.s3sync.meta";

const TEMP_FILE_SUFFIX_LEN: usize = 8;

/// Smallest I/O buffer the backend will work with.
pub const MIN_BUFFER_SIZE: usize = 16 * 1024;

/// Local filesystem tree rooted at a directory.
///
/// Keys map to paths relative to the root. Listing emits regular files and
/// symlinks whose final target is a file; directories and symlinks to
/// directories are skipped.
#[derive(Clone)]
pub struct FsStorage {
    dir: PathBuf,
    file_perm: u32,
    dir_perm: u32,
    buf_size: usize,
    use_xattr: bool,
    atomic_write: bool,
    list_error_mask: ErrorHandlingMask,
    cancellation_token: PipelineCancellationToken,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl FsStorage {
    pub fn new(dir: &Path, config: &FsConfig) -> Self {
        Self {
            dir: dir.to_path_buf(),
            file_perm: config.file_perm,
            dir_perm: config.dir_perm,
            buf_size: config.buf_size.max(MIN_BUFFER_SIZE),
            use_xattr: config.use_xattr && is_xattr_supported(),
            atomic_write: config.atomic_write,
            list_error_mask: config.list_error_mask,
            cancellation_token: crate::types::token::create_pipeline_cancellation_token(),
            rate_limiter: None,
        }
    }

    fn real_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(anyhow!("object key {} references a parent directory", key));
        }

        Ok(self.dir.join(relative))
    }

    fn key_from_path(&self, path: &Path) -> String {
        let key = path
            .strip_prefix(&self.dir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();

        if cfg!(windows) {
            key.replace('\\', "/")
        } else {
            key
        }
    }

    /// Whether a listing error at this node is skipped or aborts the walk.
    fn is_tolerated_list_error(&self, e: &walkdir::Error) -> bool {
        let kind = match e.io_error() {
            Some(io_error) => match io_error.kind() {
                std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
                _ => StorageErrorKind::Other,
            },
            None => StorageErrorKind::Other,
        };

        self.list_error_mask.tolerates(kind)
    }

    async fn load_meta_record(&self, path: &Path) -> Result<Option<ObjectMetaRecord>> {
        if !self.use_xattr {
            return Ok(None);
        }

        let path = path.to_path_buf();
        let data = tokio::task::spawn_blocking(move || read_meta_xattr(&path)).await??;

        match data {
            Some(data) => Ok(Some(serde_json::from_slice(&data).with_context(|| {
                "failed to decode the object metadata record"
            })?)),
            None => Ok(None),
        }
    }

    async fn store_meta_record(&self, path: &Path, object: &Object) -> Result<()> {
        if !self.use_xattr {
            return Ok(());
        }

        let record = ObjectMetaRecord::from_object(object);
        let data = serde_json::to_vec(&record)?;
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || write_meta_xattr(&path, &data)).await??;

        Ok(())
    }

    async fn populate_meta_from_fs(&self, object: &mut Object, path: &Path) -> Result<()> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;

        let mtime: DateTime<Utc> = metadata
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .into();

        object.content_type = mime_guess::from_path(path).first().map(|m| m.to_string());
        object.mtime = Some(mtime);
        object.content_length = Some(metadata.len() as i64);
        object.e_tag = Some(etag_from_metadata(mtime, metadata.len() as i64));

        Ok(())
    }

    async fn write_body<R>(&self, reader: &mut R, file: &mut tokio::fs::File) -> Result<u64>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.buf_size];
        let mut written = 0u64;

        loop {
            if self.cancellation_token.is_cancelled() {
                return Err(SyncError::Cancelled.into());
            }

            let read = reader.read(&mut buf).await?;
            if read == 0 {
                break;
            }

            if let Some(limiter) = &self.rate_limiter {
                acquire_rate_limit(limiter, read).await;
            }

            file.write_all(&buf[..read]).await?;
            written += read as u64;
        }

        Ok(written)
    }

    async fn create_parent_dirs(&self, path: &Path) -> Result<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };

        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(self.dir_perm);
        #[cfg(not(unix))]
        let _ = self.dir_perm;

        builder
            .create(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;

        Ok(())
    }

    async fn open_for_write(&self, path: &Path) -> Result<tokio::fs::File> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(self.file_perm);
        #[cfg(not(unix))]
        let _ = self.file_perm;

        options
            .open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))
    }
}

#[async_trait]
impl StorageTrait for FsStorage {
    fn with_cancellation_token(&mut self, token: PipelineCancellationToken) {
        self.cancellation_token = token;
    }

    fn with_rate_limit(&mut self, bytes_per_sec: u32) -> Result<()> {
        self.rate_limiter = Some(crate::storage::build_rate_limiter(bytes_per_sec)?);
        Ok(())
    }

    async fn list(&self, sender: &Sender<Object>) -> Result<()> {
        for entry in WalkDir::new(&self.dir).follow_links(true) {
            if self.cancellation_token.is_cancelled() {
                trace!("local listing has been cancelled.");
                return Err(SyncError::Cancelled.into());
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .unwrap_or_else(|| Path::new(""))
                        .display()
                        .to_string();

                    if self.is_tolerated_list_error(&e) {
                        warn!(path = path, error = %e, "failed to list node. skipping.");
                        continue;
                    }

                    return Err(anyhow::Error::new(e)
                        .context(format!("local listing aborted at {path}")));
                }
            };

            // with follow_links() a symlink whose final target is a file
            // shows up as a file; directories and dangling links do not.
            if !entry.file_type().is_file() {
                continue;
            }

            let key = self.key_from_path(entry.path());
            if key.is_empty() {
                continue;
            }

            if sender.send(Object::with_key(&key)).await.is_err() {
                trace!("the next stage has gone away. stop listing.");
                return Ok(());
            }
        }

        debug!("local listing finished.");
        Ok(())
    }

    async fn get_object_meta(&self, object: &mut Object) -> Result<()> {
        let path = self.real_path(&object.key)?;

        match self.load_meta_record(&path).await? {
            Some(record) => {
                let metadata = tokio::fs::metadata(&path)
                    .await
                    .with_context(|| format!("failed to stat {}", path.display()))?;

                record.apply_to(object);
                object.content_length = Some(metadata.len() as i64);
            }
            None => {
                self.populate_meta_from_fs(object, &path).await?;
            }
        }

        Ok(())
    }

    async fn get_object_acl(&self, object: &mut Object) -> Result<()> {
        // the metadata record is the only ACL source a filesystem has
        self.get_object_meta(object).await
    }

    async fn get_object_content(&self, object: &mut Object) -> Result<()> {
        let path = self.real_path(&object.key)?;

        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;

        if let Some(limiter) = &self.rate_limiter {
            acquire_rate_limit(limiter, data.len()).await;
        }

        object.content_length = Some(data.len() as i64);
        object.content = Some(data);
        object.content_stream = None;

        self.get_object_meta(object).await?;

        Ok(())
    }

    async fn put_object(&self, object: &mut Object) -> Result<()> {
        let final_path = self.real_path(&object.key)?;
        let write_path = if self.atomic_write {
            temp_write_path(&final_path)
        } else {
            final_path.clone()
        };

        self.create_parent_dirs(&final_path).await?;

        let mut file = self.open_for_write(&write_path).await?;

        if let Some(stream) = object.content_stream.take() {
            let mut reader = stream.into_async_read();
            self.write_body(&mut reader, &mut file).await?;
        } else {
            let content = object
                .content
                .as_deref()
                .ok_or_else(|| anyhow!("object {} has no content", object.key))?;
            let mut reader = content;
            self.write_body(&mut reader, &mut file).await?;
        }

        file.flush().await?;
        drop(file);

        self.store_meta_record(&write_path, object).await?;

        if self.atomic_write {
            tokio::fs::rename(&write_path, &final_path)
                .await
                .with_context(|| format!("failed to rename onto {}", final_path.display()))?;
        }

        Ok(())
    }

    async fn delete_object(&self, object: &Object) -> Result<()> {
        let path = self.real_path(&object.key)?;

        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("failed to remove {}", path.display()))?;

        Ok(())
    }
}

/// `<dest>.temp.<8 random chars from [a-z0-9]>`, the marker of an in-flight
/// atomic write.
fn temp_write_path(final_path: &Path) -> PathBuf {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let mut name = final_path.as_os_str().to_os_string();
    name.push(format!(".temp.{}", &suffix[..TEMP_FILE_SUFFIX_LEN]));

    PathBuf::from(name)
}

#[cfg(unix)]
fn is_xattr_supported() -> bool {
    true
}

#[cfg(not(unix))]
fn is_xattr_supported() -> bool {
    false
}

#[cfg(unix)]
fn read_meta_xattr(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    // absence of the attribute is not an error, it means "no record stored"
    match xattr::get(path, METADATA_XATTR_NAME) {
        Ok(data) => Ok(data),
        Err(e) if is_xattr_unsupported_error(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn write_meta_xattr(path: &Path, data: &[u8]) -> std::io::Result<()> {
    match xattr::set(path, METADATA_XATTR_NAME, data) {
        Ok(()) => Ok(()),
        Err(e) if is_xattr_unsupported_error(&e) => {
            warn!(
                path = %path.display(),
                "the filesystem does not support extended attributes. metadata record skipped."
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn is_xattr_unsupported_error(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc_enotsup()) || e.kind() == std::io::ErrorKind::Unsupported
}

#[cfg(unix)]
const fn libc_enotsup() -> i32 {
    #[cfg(target_os = "linux")]
    {
        95
    }
    #[cfg(not(target_os = "linux"))]
    {
        45
    }
}

#[cfg(not(unix))]
fn read_meta_xattr(_path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    Ok(None)
}

#[cfg(not(unix))]
fn write_meta_xattr(_path: &Path, _data: &[u8]) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::EnvFilter;

    fn test_fs_config() -> FsConfig {
        FsConfig {
            file_perm: 0o644,
            dir_perm: 0o755,
            buf_size: MIN_BUFFER_SIZE,
            use_xattr: true,
            atomic_write: false,
            list_error_mask: ErrorHandlingMask::empty(),
        }
    }

    async fn collect_keys(storage: &FsStorage) -> Vec<String> {
        let (sender, receiver) = async_channel::unbounded();
        storage.list(&sender).await.unwrap();
        sender.close();

        let mut keys = vec![];
        while let Ok(object) = receiver.recv().await {
            keys.push(object.key);
        }
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn list_regular_files_and_skips_directories() {
        init_dummy_tracing_subscriber();

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("d/e")).unwrap();
        std::fs::write(dir.path().join("a"), b"A").unwrap();
        std::fs::write(dir.path().join("d/b"), b"BB").unwrap();
        std::fs::write(dir.path().join("d/e/c"), b"CCC").unwrap();

        let storage = FsStorage::new(dir.path(), &test_fs_config());

        assert_eq!(collect_keys(&storage).await, vec!["a", "d/b", "d/e/c"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn list_follows_symlinks_to_files_only() {
        init_dummy_tracing_subscriber();

        let target_dir = tempfile::tempdir().unwrap();
        std::fs::write(target_dir.path().join("real"), b"DATA").unwrap();
        std::fs::create_dir(target_dir.path().join("realdir")).unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(target_dir.path().join("real"), dir.path().join("link"))
            .unwrap();
        std::fs::write(dir.path().join("plain"), b"P").unwrap();

        let storage = FsStorage::new(dir.path(), &test_fs_config());

        assert_eq!(collect_keys(&storage).await, vec!["link", "plain"]);
    }

    #[tokio::test]
    async fn put_and_get_round_trip() {
        init_dummy_tracing_subscriber();

        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path(), &test_fs_config());

        let mut object = Object::with_key("nested/data1.txt");
        object.content = Some(b"hello world".to_vec());
        object.content_type = Some("text/plain".to_string());
        object.e_tag = Some("\"0123\"".to_string());
        object.mtime = Some(DateTime::from_timestamp(1674000000, 0).unwrap());

        storage.put_object(&mut object).await.unwrap();

        let mut read_back = Object::with_key("nested/data1.txt");
        storage.get_object_content(&mut read_back).await.unwrap();

        assert_eq!(read_back.content.as_deref(), Some(b"hello world".as_ref()));
        assert_eq!(read_back.content_length, Some(11));
        assert_eq!(read_back.content_type.as_deref(), Some("text/plain"));

        // the recorded fields survive wherever extended attributes exist
        let has_record = read_meta_xattr(&dir.path().join("nested/data1.txt"))
            .ok()
            .flatten()
            .is_some();
        if has_record {
            assert_eq!(read_back.e_tag.as_deref(), Some("\"0123\""));
            assert_eq!(
                read_back.mtime,
                Some(DateTime::from_timestamp(1674000000, 0).unwrap())
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn meta_falls_back_to_fs_attributes_without_record() {
        init_dummy_tracing_subscriber();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("photo.png"), b"not a real png").unwrap();

        let storage = FsStorage::new(dir.path(), &test_fs_config());

        let mut object = Object::with_key("photo.png");
        storage.get_object_meta(&mut object).await.unwrap();

        assert_eq!(object.content_type.as_deref(), Some("image/png"));
        assert!(object.mtime.is_some());
        assert_eq!(object.content_length, Some(14));
        assert_eq!(
            object.e_tag.as_deref(),
            Some(etag_from_metadata(object.mtime.unwrap(), 14).as_str())
        );
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        init_dummy_tracing_subscriber();

        let dir = tempfile::tempdir().unwrap();
        let mut config = test_fs_config();
        config.atomic_write = true;
        let storage = FsStorage::new(dir.path(), &config);

        let mut object = Object::with_key("data1");
        object.content = Some(b"atomic".to_vec());
        storage.put_object(&mut object).await.unwrap();

        let entries: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();

        assert_eq!(entries, vec!["data1"]);
        assert_eq!(std::fs::read(dir.path().join("data1")).unwrap(), b"atomic");
    }

    #[test]
    fn temp_write_path_shape() {
        let path = temp_write_path(Path::new("/tmp/dest/file.bin"));
        let name = path.file_name().unwrap().to_str().unwrap();

        let suffix = name.strip_prefix("file.bin.temp.").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn rejects_parent_directory_traversal() {
        init_dummy_tracing_subscriber();

        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path(), &test_fs_config());

        let mut object = Object::with_key("../escape");
        object.content = Some(b"nope".to_vec());

        assert!(storage.put_object(&mut object).await.is_err());
        assert!(storage.get_object_meta(&mut object).await.is_err());
    }

    #[tokio::test]
    async fn delete_object_removes_file() {
        init_dummy_tracing_subscriber();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gone"), b"x").unwrap();

        let storage = FsStorage::new(dir.path(), &test_fs_config());
        storage.delete_object(&Object::with_key("gone")).await.unwrap();

        assert!(!dir.path().join("gone").exists());
    }

    #[tokio::test]
    async fn missing_object_is_classified_not_found() {
        init_dummy_tracing_subscriber();

        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path(), &test_fs_config());

        let mut object = Object::with_key("absent");
        let err = storage.get_object_meta(&mut object).await.unwrap_err();

        assert_eq!(
            crate::types::error::classify_error(&err),
            StorageErrorKind::NotFound
        );
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .or_else(|_| EnvFilter::try_new("dummy=trace"))
                    .unwrap(),
            )
            .try_init();
    }
}
