use std::fmt;

use anyhow::Error;
use bitflags::bitflags;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug, PartialEq, Eq)]
pub enum SyncError {
    #[error("cancelled")]
    Cancelled,
    #[error("rate must be a positive number")]
    InvalidRateLimit,
    #[error("invalid storage url: {0}")]
    InvalidStorageUrl(String),
}

/// Per-object I/O failure raised by a load/upload/delete stage. The object
/// itself is dropped when this is emitted; only its identity travels on.
#[derive(ThisError, Debug)]
#[error("object {key} failed: {cause}")]
pub struct ObjectError {
    pub key: String,
    pub version_id: Option<String>,
    pub cause: Error,
}

impl ObjectError {
    pub fn new(key: &str, version_id: Option<String>, cause: Error) -> Self {
        Self {
            key: key.to_string(),
            version_id,
            cause,
        }
    }
}

/// A stage received a configuration value of an unexpected shape, or the
/// value could not be turned into a working configuration. Always fatal.
#[derive(Debug)]
pub struct StepConfigurationError {
    pub stage_name: String,
    pub stage_index: usize,
    pub cause: Option<Error>,
}

impl StepConfigurationError {
    pub fn new(stage_name: &str, stage_index: usize) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            stage_index,
            cause: None,
        }
    }

    pub fn with_cause(stage_name: &str, stage_index: usize, cause: Error) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            stage_index,
            cause: Some(cause),
        }
    }
}

impl fmt::Display for StepConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(
                f,
                "pipeline stage: {} has an invalid configuration: {}",
                self.stage_name, cause
            ),
            None => write!(
                f,
                "pipeline stage: {} has an invalid configuration",
                self.stage_name
            ),
        }
    }
}

impl std::error::Error for StepConfigurationError {}

/// The engine's outer wrapper: every error a stage emits reaches the
/// aggregate stream in this form.
#[derive(ThisError, Debug)]
#[error("pipeline stage: {stage_name} failed with error: {cause}")]
pub struct PipelineError {
    pub stage_name: String,
    pub stage_index: usize,
    pub cause: Error,
}

/// Classifier categories applied to any backend failure. Backends attach the
/// category as context at the failure site; [`classify_error`] recovers it.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    #[error("object not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("storage operation failed")]
    Other,
}

pub fn classify_error(e: &Error) -> StorageErrorKind {
    if let Some(kind) = e.downcast_ref::<StorageErrorKind>() {
        return *kind;
    }

    for cause in e.chain() {
        if let Some(io_error) = cause.downcast_ref::<std::io::Error>() {
            return match io_error.kind() {
                std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
                _ => StorageErrorKind::Other,
            };
        }
    }

    StorageErrorKind::Other
}

pub fn is_cancelled_error(e: &Error) -> bool {
    if let Some(err) = e.downcast_ref::<SyncError>() {
        return *err == SyncError::Cancelled;
    }

    false
}

bitflags! {
    /// Which classified error categories are downgraded from fatal to
    /// warn-and-skip by the driver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ErrorHandlingMask: u8 {
        const NOT_FOUND = 1;
        const PERMISSION_DENIED = 2;
        const OTHER = 64;
        const ALL = 255;
    }
}

impl ErrorHandlingMask {
    pub fn tolerates(&self, kind: StorageErrorKind) -> bool {
        match kind {
            StorageErrorKind::NotFound => self.contains(ErrorHandlingMask::NOT_FOUND),
            StorageErrorKind::PermissionDenied => {
                self.contains(ErrorHandlingMask::PERMISSION_DENIED)
            }
            StorageErrorKind::Other => self.contains(ErrorHandlingMask::OTHER),
        }
    }
}

impl Default for ErrorHandlingMask {
    fn default() -> Self {
        ErrorHandlingMask::empty()
    }
}
