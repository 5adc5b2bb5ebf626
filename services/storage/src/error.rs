//! Error types for the image store

use thiserror::Error;

/// Failures raised by a [`ChunkedBlobStore`](crate::blob_store::ChunkedBlobStore)
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("failed to write {filename}: {reason}")]
    Write { filename: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Why an upload or a serve request was refused on media-type grounds
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaRejection {
    /// Upload filename extension is not in the image allow-list
    #[error("Please select an image with .png, .jpeg or .jpg extensions")]
    Extension { filename: String },

    /// Stored record is not an image
    #[error("Not an image")]
    ContentType { content_type: String },
}

/// Client-facing error taxonomy
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    UnsupportedMediaType(#[from] MediaRejection),

    #[error("No files exist")]
    NotFound,

    #[error("{0}")]
    StorageWrite(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Upload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },

    #[error("{0}")]
    DeleteFailed(String),

    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ServiceError::NotFound,
            StoreError::Write { .. } => ServiceError::StorageWrite(err.to_string()),
            StoreError::Database(e) => ServiceError::Internal(e.to_string()),
        }
    }
}
