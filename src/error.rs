//! Typed error types for the download queue.
//!
//! Per-job failures never escape as Rust errors: the runner folds them into a
//! `Finished` event. These types cover the operations that can fail
//! synchronously (enqueueing, dispatch preparation, config loading).
//!
//! Error codes are stable identifiers for programmatic handling:
//! - `E_VAL_*`: Validation errors (caller can fix input)
//! - `E_IO_*`: File system errors
//! - `E_CFG_*`: Backend configuration errors
//! - `E_DL_*`: Download errors (may be retryable)
//! - `E_Q_*`: Queue errors
//! - `E_INT_*`: Internal errors (should be reported)

use serde::Serialize;
use thiserror::Error;

use crate::download_queue::JobId;

/// Error codes for programmatic handling.
/// These provide stable identifiers that don't change with message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (E_VAL_*)
    EValInvalidUrl,
    EValInvalidMedia,
    EValInvalidQuality,

    // IO errors (E_IO_*)
    EIoFailed,
    EIoNotFound,
    EIoPermissionDenied,

    // Config errors (E_CFG_*)
    ECfgParseFailed,

    // Download errors (E_DL_*)
    EDlSpawnFailed,
    EDlProcessFailed,

    // Queue errors (E_Q_*)
    EQueueDuplicate,

    // Internal errors (E_INT_*)
    EInternal,
    EIntNoRuntime,
}

impl ErrorCode {
    /// Returns whether this error is typically retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::EDlProcessFailed | Self::EDlSpawnFailed)
    }

    /// Returns the error code as a string (e.g., "E_VAL_INVALID_URL").
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EValInvalidUrl => "E_VAL_INVALID_URL",
            Self::EValInvalidMedia => "E_VAL_INVALID_MEDIA",
            Self::EValInvalidQuality => "E_VAL_INVALID_QUALITY",
            Self::EIoFailed => "E_IO_FAILED",
            Self::EIoNotFound => "E_IO_NOT_FOUND",
            Self::EIoPermissionDenied => "E_IO_PERMISSION_DENIED",
            Self::ECfgParseFailed => "E_CFG_PARSE_FAILED",
            Self::EDlSpawnFailed => "E_DL_SPAWN_FAILED",
            Self::EDlProcessFailed => "E_DL_PROCESS_FAILED",
            Self::EQueueDuplicate => "E_Q_DUPLICATE",
            Self::EInternal => "E_INTERNAL",
            Self::EIntNoRuntime => "E_INT_NO_RUNTIME",
        }
    }
}

/// Categories of validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValidationKind {
    InvalidUrl,
    InvalidMedia,
    InvalidQuality,
}

/// Kinds of queue errors. Use this to classify queue failures
/// in a stable, machine-readable way instead of probing message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueueErrorKind {
    Duplicate,
}

/// Unified error type for the download queue.
#[derive(Debug, Error)]
pub enum DownloaderError {
    #[error("validation error ({kind:?}): {message}")]
    Validation { kind: ValidationKind, message: String },

    #[error("io error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid backend config {path}: {source}")]
    Config {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("download failed for job {job_id}: {reason}")]
    Job { job_id: JobId, reason: String },

    #[error("queue error ({kind:?}): {message}")]
    Queue { kind: QueueErrorKind, message: String },

    #[error("internal error: {message}")]
    Internal { message: String, code: ErrorCode },
}

impl DownloaderError {
    /// Stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { kind, .. } => match kind {
                ValidationKind::InvalidUrl => ErrorCode::EValInvalidUrl,
                ValidationKind::InvalidMedia => ErrorCode::EValInvalidMedia,
                ValidationKind::InvalidQuality => ErrorCode::EValInvalidQuality,
            },
            Self::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::EIoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::EIoPermissionDenied,
                _ => ErrorCode::EIoFailed,
            },
            Self::Config { .. } => ErrorCode::ECfgParseFailed,
            Self::Spawn { .. } => ErrorCode::EDlSpawnFailed,
            Self::Job { .. } => ErrorCode::EDlProcessFailed,
            Self::Queue { kind, .. } => match kind {
                QueueErrorKind::Duplicate => ErrorCode::EQueueDuplicate,
            },
            Self::Internal { code, .. } => *code,
        }
    }

    /// Whether the operation that produced this error can be retried as-is.
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

// Convenience constructors
impl DownloaderError {
    /// Create a URL validation error.
    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::Validation {
            kind: ValidationKind::InvalidUrl,
            message: message.into(),
        }
    }

    /// Create a media metadata validation error.
    pub fn invalid_media(message: impl Into<String>) -> Self {
        Self::Validation {
            kind: ValidationKind::InvalidMedia,
            message: message.into(),
        }
    }

    /// Create a quality validation error.
    pub fn invalid_quality(message: impl Into<String>) -> Self {
        Self::Validation {
            kind: ValidationKind::InvalidQuality,
            message: message.into(),
        }
    }

    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a backend config parse error.
    pub fn config(path: impl Into<String>, source: serde_yaml::Error) -> Self {
        Self::Config {
            path: path.into(),
            source,
        }
    }

    /// Create a process spawn error.
    pub fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    /// Create a job error.
    pub fn job(job_id: JobId, reason: impl Into<String>) -> Self {
        Self::Job {
            job_id,
            reason: reason.into(),
        }
    }

    /// Create a queue duplicate error.
    pub fn queue_duplicate(message: impl Into<String>) -> Self {
        Self::Queue {
            kind: QueueErrorKind::Duplicate,
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            code: ErrorCode::EInternal,
        }
    }

    /// The worker was constructed outside a tokio runtime.
    pub fn no_runtime(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            code: ErrorCode::EIntNoRuntime,
        }
    }
}

pub type Result<T, E = DownloaderError> = std::result::Result<T, E>;
