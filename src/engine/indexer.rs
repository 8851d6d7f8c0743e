// FILE: src/engine/indexer.rs
use crate::engine::{MetadataResult, MetadataTask, TaskAction};
use crate::error::{GalleryError, Result};
use crate::services::{Metadata, MetadataExtractor, ThumbnailProvider};
use crate::storage::{MetadataCache, SearchIndex, Signature};
use std::sync::Arc;

/// Executes a single metadata task against the cache, the search index and
/// the thumbnail provider. Shared by every pipeline worker.
#[derive(Clone)]
pub struct Indexer {
    pub cache: Arc<MetadataCache>,
    pub index: Arc<SearchIndex>,
    pub extractor: Arc<dyn MetadataExtractor>,
    pub thumbnails: Arc<dyn ThumbnailProvider>,
}

impl Indexer {
    pub fn new(
        cache: Arc<MetadataCache>,
        index: Arc<SearchIndex>,
        extractor: Arc<dyn MetadataExtractor>,
        thumbnails: Arc<dyn ThumbnailProvider>,
    ) -> Self {
        Self { cache, index, extractor, thumbnails }
    }

    /// Never fails: errors come back as an unsuccessful result.
    pub fn process(&self, task: &MetadataTask) -> MetadataResult {
        let outcome = match task.action {
            TaskAction::Delete => self.forget(task).map(|_| MetadataResult::succeeded(task, None, None)),
            TaskAction::Index => self.index_file(task),
        };
        match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("[Indexer] {} failed for {}: {}", task.action.as_str(), task.full_path.display(), e);
                MetadataResult::failed(task, e.to_string())
            }
        }
    }

    fn cache_key(task: &MetadataTask) -> String {
        task.full_path.to_string_lossy().into_owned()
    }

    /// Cache, search index and thumbnail cleanup for a path that is gone.
    fn forget(&self, task: &MetadataTask) -> Result<()> {
        self.cache.invalidate(&Self::cache_key(task))?;
        self.index.remove(&task.relative_path)?;
        self.thumbnails.remove(&task.full_path, &task.relative_path);
        Ok(())
    }

    fn index_file(&self, task: &MetadataTask) -> Result<MetadataResult> {
        let signature = match Signature::read(&task.full_path) {
            Ok(sig) => sig,
            Err(GalleryError::NotFound(_)) => {
                tracing::debug!("[Indexer] {} vanished before indexing", task.full_path.display());
                self.forget(task)?;
                return Ok(MetadataResult::failed(task, "File not found."));
            }
            Err(e) => return Err(e),
        };
        let key = Self::cache_key(task);

        let cached = if task.force { None } else { self.cache.get(&key, signature)? };
        let metadata = match cached {
            Some(metadata) => metadata,
            None => match self.extractor.extract(&task.full_path) {
                Ok(metadata) => {
                    self.cache.set(&key, signature, &metadata)?;
                    metadata
                }
                Err(e) => {
                    // Not cached, so the next attempt extracts again.
                    tracing::warn!("[Indexer] {}", GalleryError::from(e));
                    Metadata::new()
                }
            },
        };

        let thumbnail_url = self.thumbnails.ensure(&task.full_path, &task.relative_path);

        if metadata.is_empty() {
            self.index.remove(&task.relative_path)?;
        } else {
            self.index.index_file(&task.relative_path, &metadata, signature.mtime, signature.size)?;
        }

        tracing::debug!("[Indexer] Indexed {}", task.full_path.display());
        Ok(MetadataResult::succeeded(task, Some(metadata), thumbnail_url))
    }
}
