//! Collaborators the indexing core talks to but does not implement:
//! the format-specific metadata extractor, the thumbnail renderer and the
//! notification broadcaster.

use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Decoded metadata for one file. Always a JSON object.
pub type Metadata = serde_json::Map<String, Value>;

/// Event name used for every notification the core emits.
pub const FILE_CHANGE_EVENT: &str = "file_change";

#[derive(Error, Debug)]
#[error("metadata extraction failed for {path}: {reason}")]
pub struct ExtractionError {
    pub path: PathBuf,
    pub reason: String,
}

impl ExtractionError {
    pub fn new(path: &Path, reason: impl Into<String>) -> Self {
        Self { path: path.to_path_buf(), reason: reason.into() }
    }
}

pub trait MetadataExtractor: Send + Sync {
    /// Reads embedded metadata. Fails on malformed or unreadable input.
    fn extract(&self, path: &Path) -> std::result::Result<Metadata, ExtractionError>;
}

pub trait ThumbnailProvider: Send + Sync {
    /// Returns a served URL, generating the thumbnail if needed.
    fn ensure(&self, path: &Path, relative_path: &str) -> Option<String>;
    fn remove(&self, path: &Path, relative_path: &str);
    /// Returns a URL only if an up-to-date thumbnail already exists.
    fn existing(&self, path: &Path, relative_path: &str) -> Option<String>;
}

pub trait Broadcaster: Send + Sync {
    fn notify(&self, event: &str, payload: Value);
}

/// Extractor that finds nothing. Files still get indexed with empty metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExtractor;

impl MetadataExtractor for NoopExtractor {
    fn extract(&self, _path: &Path) -> std::result::Result<Metadata, ExtractionError> {
        Ok(Metadata::new())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoThumbnails;

impl ThumbnailProvider for NoThumbnails {
    fn ensure(&self, _path: &Path, _relative_path: &str) -> Option<String> {
        None
    }

    fn remove(&self, _path: &Path, _relative_path: &str) {}

    fn existing(&self, _path: &Path, _relative_path: &str) -> Option<String> {
        None
    }
}

/// Writes every notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogBroadcaster;

impl Broadcaster for LogBroadcaster {
    fn notify(&self, event: &str, payload: Value) {
        tracing::info!("[Broadcast] {} {}", event, payload);
    }
}
