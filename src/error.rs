//! Error types for gallerydex

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// The file vanished between the event and its processing.
    #[error("File not found: {0}")]
    NotFound(String),

    /// A persisted metadata blob could not be decoded.
    #[error("Corrupt state: {0}")]
    CorruptState(String),

    #[error("Task queue saturated")]
    QueueSaturated,

    #[error("Extraction error: {0}")]
    Extraction(#[from] crate::services::ExtractionError),

    /// The path resolves outside the watched root.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GalleryError>;

impl GalleryError {
    /// Shorthand used wherever a `std::sync` lock turns out poisoned.
    pub(crate) fn poisoned() -> Self {
        GalleryError::State("Poisoned lock".into())
    }
}
