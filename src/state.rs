// FILE: src/state.rs
//! Process-wide context: one cache, one search index, one pipeline.
//! Built once at start-up and handed to every component as [`SharedState`].

use crate::config::GalleryConfig;
use crate::engine::{Indexer, MetadataPipeline, MetadataResult, TaskAction};
use crate::error::Result;
use crate::services::{
    Broadcaster, LogBroadcaster, MetadataExtractor, NoThumbnails, NoopExtractor, ThumbnailProvider, FILE_CHANGE_EVENT,
};
use crate::storage::{MetadataCache, SearchIndex};
use serde_json::json;
use std::sync::Arc;

/// The external services the core delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn MetadataExtractor>,
    pub thumbnails: Arc<dyn ThumbnailProvider>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            extractor: Arc::new(NoopExtractor),
            thumbnails: Arc::new(NoThumbnails),
            broadcaster: Arc::new(LogBroadcaster),
        }
    }
}

pub struct GalleryState {
    pub config: GalleryConfig,
    pub cache: Arc<MetadataCache>,
    pub index: Arc<SearchIndex>,
    pub pipeline: MetadataPipeline,
    pub extractor: Arc<dyn MetadataExtractor>,
    pub thumbnails: Arc<dyn ThumbnailProvider>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

/// Shared state wrapper for easy cloning and sharing
pub type SharedState = Arc<GalleryState>;

impl GalleryState {
    /// Opens both stores. Failing here is the only fatal error the core has.
    pub fn open(config: GalleryConfig, collaborators: Collaborators) -> Result<SharedState> {
        std::fs::create_dir_all(&config.data_dir)?;

        let log_path = config.recovery_log_path();
        let cache = MetadataCache::open(
            &config.cache_db_path(),
            config.cache.recovery_log.then_some(log_path.as_path()),
            config.cache.effective_capacity(),
        )?;
        let index = Arc::new(SearchIndex::open(&config.search_db_path())?);

        let indexer = Indexer::new(
            Arc::clone(&cache),
            Arc::clone(&index),
            Arc::clone(&collaborators.extractor),
            Arc::clone(&collaborators.thumbnails),
        );
        let pipeline = MetadataPipeline::new(indexer, config.pipeline.clone());

        let broadcaster = Arc::clone(&collaborators.broadcaster);
        pipeline.add_listener(move |result| broadcast_metadata(broadcaster.as_ref(), result))?;

        tracing::info!("[State] Data directory: {}", config.data_dir.display());
        Ok(Arc::new(Self {
            config,
            cache,
            index,
            pipeline,
            extractor: collaborators.extractor,
            thumbnails: collaborators.thumbnails,
            broadcaster: collaborators.broadcaster,
        }))
    }

    /// Stops the workers and the cache warm-up. Bounded.
    pub fn shutdown(&self) {
        self.pipeline.shutdown();
        self.cache.close();
    }
}

/// Pushes freshly extracted metadata to subscribers as a `metadata` change.
fn broadcast_metadata(broadcaster: &dyn Broadcaster, result: &MetadataResult) {
    if result.action != TaskAction::Index || !result.success {
        return;
    }
    let payload = json!({
        "changes": [{
            "action": "metadata",
            "folder": result.folder_key,
            "file": result.file_name(),
            "data": {
                "metadata": result.metadata,
                "metadata_pending": false,
                "thumbnail_url": result.thumbnail_url,
                "thumbnail_pending": result.thumbnail_url.is_none(),
            },
        }],
    });
    broadcaster.notify(FILE_CHANGE_EVENT, payload);
}
