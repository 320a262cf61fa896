//! Error types for the media pipeline.
//!
//! One enum covers the whole taxonomy; the worker decides retry behavior
//! from the structured `process_asset` outcome, not from the error kind,
//! so every failure inside a processing cycle follows the same discipline.

use thiserror::Error;

/// Result type for media pipeline operations
pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    /// Bad URL, blocked host, bad MIME, oversized input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Caller named a profile that is not configured. Never retried.
    #[error("unknown media profile: {0}")]
    ProfileUnknown(String),

    /// Remote fetch failed (non-2xx status, transport error, empty body)
    #[error("download failed: {message}")]
    DownloadFailed {
        status: Option<u16>,
        message: String,
    },

    /// Remote body crossed the configured size cap mid-transfer
    #[error("download exceeded the {max_bytes} byte limit")]
    DownloadTooLarge { max_bytes: u64 },

    /// Source bytes could not be decoded as an image
    #[error("image decode failed: {0}")]
    ImageDecode(String),

    /// Decoding the source would exceed the process memory budget
    #[error("insufficient memory: {required} bytes required, {available} available")]
    InsufficientMemory { required: u64, available: u64 },

    /// Batched upload aborted; completed members were rolled back
    #[error("batch upload failed at file {index}: {source}")]
    ObjectStoreBatch {
        index: usize,
        #[source]
        source: Box<AppError>,
    },

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("message bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("temp spool error: {0}")]
    Spool(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<lapin::Error> for AppError {
    fn from(err: lapin::Error) -> Self {
        AppError::BusUnavailable(err.to_string())
    }
}

impl From<image::ImageError> for AppError {
    fn from(err: image::ImageError) -> Self {
        AppError::ImageDecode(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Spool(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::DownloadFailed {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}
