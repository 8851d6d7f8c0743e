//! Oracle: the read side.
//!
//! On-demand queries that sit next to the watcher: full-text search,
//! single-file metadata lookups, folder summaries and paginated listings.
//! Everything here is synchronous and may touch the disk; async callers
//! should go through `spawn_blocking`.

use crate::engine::MetadataTask;
use crate::error::{GalleryError, Result};
use crate::scanner::{collect_entries, scan_tree, FileEntry, FileKind, ScanRoot};
use crate::services::Metadata;
use crate::state::SharedState;
use crate::storage::SearchHit;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    #[default]
    Timestamp,
    Name,
}

/// Whether a listing includes sub-folders. `Auto` means only for the root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recursion {
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Folder key; `None` means the root.
    pub folder: Option<String>,
    pub sort: SortField,
    pub descending: bool,
    pub recursion: Recursion,
    pub page: usize,
    pub limit: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            folder: None,
            sort: SortField::Timestamp,
            descending: true,
            recursion: Recursion::Auto,
            page: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub folder: String,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
    pub items: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderSummary {
    pub root: String,
    pub folders: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataView {
    pub path: String,
    pub metadata: Option<Metadata>,
    pub metadata_pending: bool,
    pub thumbnail_url: Option<String>,
    pub thumbnail_pending: bool,
}

pub struct Oracle {
    state: SharedState,
    root: ScanRoot,
}

impl Oracle {
    pub fn new(state: SharedState, root: &Path) -> Result<Self> {
        let root = ScanRoot::new(root, &state.config.extensions)?;
        Ok(Self { state, root })
    }

    pub fn root(&self) -> &ScanRoot {
        &self.root
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let hits = self.state.index.search(query, limit.max(1))?;
        tracing::info!("[Oracle] Search '{}' returned {} hits", query, hits.len());
        Ok(hits)
    }

    /// Resolves a root-relative path, refusing anything that escapes the root.
    fn resolve_relative(&self, relative_path: &str) -> Result<PathBuf> {
        let normalized = relative_path.replace('\\', "/");
        let mut full = self.root.path.clone();
        for component in Path::new(normalized.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => full.push(part),
                Component::CurDir => {}
                _ => return Err(GalleryError::AccessDenied(relative_path.to_string())),
            }
        }
        if let Ok(real) = std::fs::canonicalize(&full) {
            if !real.starts_with(&self.root.path) {
                return Err(GalleryError::AccessDenied(relative_path.to_string()));
            }
        }
        Ok(full)
    }

    /// Metadata for one file, served from the cache unless `force` is set.
    /// Images run the same code path as a pipeline worker, inline. Other
    /// files report no metadata and are never extracted or indexed.
    pub fn metadata_for(&self, relative_path: &str, force: bool) -> Result<MetadataView> {
        if relative_path.trim().is_empty() {
            return Err(GalleryError::InvalidPath("File path is required.".into()));
        }
        let full = self.resolve_relative(relative_path)?;
        if !full.is_file() {
            return Err(GalleryError::NotFound(relative_path.to_string()));
        }
        let relative = self
            .root
            .relative_path(&full)
            .unwrap_or_else(|| relative_path.to_string());

        // Only images carry prompt metadata and thumbnails.
        if FileKind::of(&full) != FileKind::Image {
            return Ok(MetadataView {
                path: relative,
                metadata: None,
                metadata_pending: false,
                thumbnail_url: None,
                thumbnail_pending: true,
            });
        }

        let (folder, _) = self.root.folder_and_name(&full);
        let task = MetadataTask::index(full.clone(), relative.clone(), folder, force);
        let result = self.state.pipeline.indexer().process(&task);
        if !result.success {
            return Err(GalleryError::NotFound(result.error.unwrap_or_else(|| relative.clone())));
        }

        Ok(MetadataView {
            path: relative,
            metadata: result.metadata,
            metadata_pending: false,
            thumbnail_pending: result.thumbnail_url.is_none(),
            thumbnail_url: result.thumbnail_url,
        })
    }

    /// File count per folder key. The root always appears, even when empty.
    pub fn folder_summary(&self) -> FolderSummary {
        let snapshot = scan_tree(&self.root, true, self.state.thumbnails.as_ref());
        let mut folders: BTreeMap<String, usize> = snapshot.iter().map(|(k, v)| (k.clone(), v.len())).collect();
        folders.entry(self.root.key.clone()).or_insert(0);
        FolderSummary { root: self.root.key.clone(), folders }
    }

    pub fn list_page(&self, request: &PageRequest) -> Result<Page> {
        let folder = request.folder.clone().unwrap_or_else(|| self.root.key.clone());
        let target = self.root.folder_path(&folder)?;
        if !target.is_dir() {
            return Err(GalleryError::NotFound(format!("Folder not found: {}", folder)));
        }

        let is_root = target == self.root.path;
        let recursive = match request.recursion {
            Recursion::Always => true,
            Recursion::Never => false,
            Recursion::Auto => is_root,
        };

        let mut items: Vec<FileEntry> = collect_entries(&self.root, &target, recursive, self.state.thumbnails.as_ref())
            .into_iter()
            .map(|scanned| scanned.entry)
            .collect();

        match request.sort {
            SortField::Name => items.sort_by_key(|e| e.name.to_lowercase()),
            SortField::Timestamp => items.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp)),
        }
        if request.descending {
            items.reverse();
        }

        let limit = request.limit.clamp(1, MAX_PAGE_LIMIT);
        let total = items.len();
        let start = request.page.saturating_mul(limit);
        let end = start.saturating_add(limit);
        let page_items = if start < total { items[start..end.min(total)].to_vec() } else { Vec::new() };

        Ok(Page {
            folder,
            page: request.page,
            limit,
            total,
            has_more: end < total,
            items: page_items,
        })
    }
}
