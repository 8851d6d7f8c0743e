//! Runtime configuration
//!
//! Every tunable of the indexing pipeline lives here with its default. The
//! binary fills this in from command-line flags; library callers build it
//! directly.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Image extensions. Only these get metadata extraction and thumbnails.
pub const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".webp"];
pub const MEDIA_EXTENSIONS: &[&str] = &[".mp4", ".gif", ".webm", ".mov"];
pub const AUDIO_EXTENSIONS: &[&str] = &[".wav", ".mp3", ".m4a", ".flac"];

const MIN_HOT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceConfig {
    /// Floor of the adaptive debounce interval.
    pub base: Duration,
    /// Ceiling of the adaptive debounce interval.
    pub max: Duration,
    pub multiplier: f64,
    /// Pending-event count that forces an immediate flush.
    pub batch_ceiling: usize,
}

impl DebounceConfig {
    /// Batches at or below this size shrink the interval back toward `base`.
    pub fn quiet_threshold(&self) -> usize {
        (self.batch_ceiling / 4).max(5)
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(8),
            multiplier: 2.0,
            batch_ceiling: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// How long a worker blocks on the queue before re-checking the stop flag.
    pub poll_interval: Duration,
    /// Upper bound on joining each thread during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 1024,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub hot_capacity: usize,
    /// Append-only warm-up log. Only safe with a single writing process.
    pub recovery_log: bool,
}

impl CacheConfig {
    pub fn effective_capacity(&self) -> usize {
        self.hot_capacity.max(MIN_HOT_CAPACITY)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 1024,
            recovery_log: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryConfig {
    /// Where the cache database, recovery log and search index live.
    pub data_dir: PathBuf,
    /// Allowed file extensions; empty means everything.
    pub extensions: Vec<String>,
    pub recursive: bool,
    /// Queue non-forced index tasks for every image found by the start-up scan.
    pub backfill: bool,
    pub debounce: DebounceConfig,
    pub pipeline: PipelineConfig,
    pub cache: CacheConfig,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            extensions: default_extensions(),
            recursive: true,
            backfill: true,
            debounce: DebounceConfig::default(),
            pipeline: PipelineConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl GalleryConfig {
    pub fn cache_db_path(&self) -> PathBuf {
        self.data_dir.join("metadata_cache.db")
    }

    pub fn recovery_log_path(&self) -> PathBuf {
        self.data_dir.join("metadata_cache.log")
    }

    pub fn search_db_path(&self) -> PathBuf {
        self.data_dir.join("search_index.db")
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("gallerydex")
}

pub fn default_extensions() -> Vec<String> {
    IMAGE_EXTENSIONS
        .iter()
        .chain(MEDIA_EXTENSIONS)
        .chain(AUDIO_EXTENSIONS)
        .map(|ext| ext.to_string())
        .collect()
}

/// Lowercases and dot-prefixes user supplied extensions ("PNG" -> ".png").
pub fn normalize_extensions<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    raw.iter()
        .map(|ext| ext.as_ref().trim().to_lowercase())
        .filter(|ext| !ext.is_empty())
        .map(|ext| if ext.starts_with('.') { ext } else { format!(".{}", ext) })
        .collect()
}
