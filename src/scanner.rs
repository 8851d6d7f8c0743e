//! Scan Engine
//!
//! Stateless helpers that turn filesystem stat data into [`FileEntry`]
//! records. Used for the start-up baseline, for every per-path update the
//! Librarian applies, and by on-demand listings.

use crate::bouncer::{extension_of, AllowList};
use crate::config::{AUDIO_EXTENSIONS, IMAGE_EXTENSIONS, MEDIA_EXTENSIONS};
use crate::error::{GalleryError, Result};
use crate::services::{Metadata, ThumbnailProvider};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

const URL_PREFIX: &str = "/static_gallery";
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Media,
    Audio,
    Unknown,
}

impl FileKind {
    pub fn from_extension(ext: &str) -> Self {
        if IMAGE_EXTENSIONS.contains(&ext) {
            FileKind::Image
        } else if MEDIA_EXTENSIONS.contains(&ext) {
            FileKind::Media
        } else if AUDIO_EXTENSIONS.contains(&ext) {
            FileKind::Audio
        } else {
            FileKind::Unknown
        }
    }

    pub fn of(path: &Path) -> Self {
        extension_of(path)
            .map(|ext| Self::from_extension(&ext))
            .unwrap_or(FileKind::Unknown)
    }
}

/// Immutable snapshot of one file as clients see it. Replaced wholesale on re-scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub url: String,
    pub timestamp: f64,
    pub date: String,
    pub metadata: Option<Metadata>,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub metadata_pending: bool,
    pub folder: String,
    pub thumbnail_url: Option<String>,
    pub thumbnail_pending: bool,
}

/// filename -> entry
pub type FolderContents = BTreeMap<String, FileEntry>;
/// folder key -> contents
pub type FolderSnapshot = BTreeMap<String, FolderContents>;

/// Result of [`build_file_entry`]: where the entry belongs plus the entry itself.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub folder: String,
    pub name: String,
    pub entry: FileEntry,
}

/// A resolved root directory together with its folder key and allow-list.
#[derive(Debug, Clone)]
pub struct ScanRoot {
    pub path: PathBuf,
    pub key: String,
    pub allow: AllowList,
}

impl ScanRoot {
    /// Canonicalizes `path`; the root key is the directory's base name.
    pub fn new<S: AsRef<str>>(path: &Path, extensions: &[S]) -> Result<Self> {
        let real = std::fs::canonicalize(path)?;
        if !real.is_dir() {
            return Err(GalleryError::InvalidPath(format!("{} is not a directory", real.display())));
        }
        let key = real
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| real.to_string_lossy().into_owned());
        Ok(Self { path: real, key, allow: AllowList::new(extensions) })
    }

    /// `/`-separated path of `path` relative to the root.
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.path).ok().map(slash_join)
    }

    /// Folder key and file name for any path under the root, existing or not.
    pub fn folder_and_name(&self, path: &Path) -> (String, String) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sub = path
            .parent()
            .and_then(|parent| parent.strip_prefix(&self.path).ok())
            .map(slash_join)
            .unwrap_or_default();
        (self.folder_key(&sub), name)
    }

    fn folder_key(&self, subfolder: &str) -> String {
        if subfolder.is_empty() {
            self.key.clone()
        } else {
            format!("{}/{}", self.key, subfolder)
        }
    }

    /// Inverse of the folder key mapping. Rejects keys that would escape the root.
    pub fn folder_path(&self, folder_key: &str) -> Result<PathBuf> {
        let normalized = folder_key.replace('\\', "/");
        let suffix = match normalized.strip_prefix(&self.key) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
            _ => normalized.trim_start_matches('/'),
        };

        let mut candidate = self.path.clone();
        for component in Path::new(suffix).components() {
            match component {
                Component::Normal(part) => candidate.push(part),
                Component::CurDir => {}
                _ => return Err(GalleryError::AccessDenied(folder_key.to_string())),
            }
        }

        // Symlinked sub-directories may still point elsewhere.
        if let Ok(real) = std::fs::canonicalize(&candidate) {
            if !real.starts_with(&self.path) {
                return Err(GalleryError::AccessDenied(folder_key.to_string()));
            }
        }
        Ok(candidate)
    }
}

fn slash_join(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn format_url(subfolder: &str, filename: &str) -> String {
    if subfolder.is_empty() {
        format!("{}/{}", URL_PREFIX, filename)
    } else {
        format!("{}/{}/{}", URL_PREFIX, subfolder, filename)
    }
}

/// Builds the entry for one file. Returns `None` for non-files, disallowed
/// extensions and paths outside the root. Images get their existing thumbnail
/// attached; nothing is generated here.
pub fn build_file_entry(root: &ScanRoot, path: &Path, thumbnails: &dyn ThumbnailProvider) -> Option<ScannedFile> {
    let stat = std::fs::metadata(path).ok()?;
    if !stat.is_file() || !root.allow.allows(path) {
        return None;
    }

    let relative = root.relative_path(path)?;
    let modified = match stat.modified() {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!("[Scanner] Error preparing file entry for {}: {}", path.display(), e);
            return None;
        }
    };
    let timestamp = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let date = chrono::DateTime::<chrono::Local>::from(modified)
        .format(DATE_FORMAT)
        .to_string();

    let (folder, name) = root.folder_and_name(path);
    let subfolder = relative
        .rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .unwrap_or_default();
    let kind = FileKind::of(path);

    let (thumbnail_url, thumbnail_pending) = if kind == FileKind::Image {
        let url = thumbnails.existing(path, &relative);
        let pending = url.is_none();
        (url, pending)
    } else {
        (None, false)
    };

    let entry = FileEntry {
        url: format_url(&subfolder, &name),
        name: name.clone(),
        timestamp,
        date,
        metadata: None,
        kind,
        metadata_pending: kind == FileKind::Image,
        folder: folder.clone(),
        thumbnail_url,
        thumbnail_pending,
    };
    Some(ScannedFile { folder, name, entry })
}

fn is_hidden_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir() && entry.file_name().to_string_lossy().starts_with('.')
}

/// Entries for every matching file under `dir` (a directory inside the root).
/// Hidden directories are not descended into.
pub fn collect_entries(
    root: &ScanRoot,
    dir: &Path,
    recursive: bool,
    thumbnails: &dyn ThumbnailProvider,
) -> Vec<ScannedFile> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let walker = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden_dir(e));

    let mut found = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("[Scanner] Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        if let Some(scanned) = build_file_entry(root, entry.path(), thumbnails) {
            found.push(scanned);
        }
    }
    found
}

/// Walks the root and groups every matching file by folder key.
pub fn scan_tree(root: &ScanRoot, recursive: bool, thumbnails: &dyn ThumbnailProvider) -> FolderSnapshot {
    let mut folders = FolderSnapshot::new();
    for scanned in collect_entries(root, &root.path, recursive, thumbnails) {
        folders
            .entry(scanned.folder)
            .or_default()
            .insert(scanned.name, scanned.entry);
    }
    tracing::debug!("[Scanner] Scanned {} ({} folders)", root.path.display(), folders.len());
    folders
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_extensions;
    use crate::services::NoThumbnails;
    use std::fs;

    struct FixedThumbs;

    impl ThumbnailProvider for FixedThumbs {
        fn ensure(&self, _: &Path, rel: &str) -> Option<String> {
            Some(format!("/thumbs/{}", rel))
        }
        fn remove(&self, _: &Path, _: &str) {}
        fn existing(&self, _: &Path, rel: &str) -> Option<String> {
            Some(format!("/thumbs/{}", rel))
        }
    }

    fn fixture() -> (tempfile::TempDir, ScanRoot) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("output");
        fs::create_dir_all(base.join("sub/deep")).unwrap();
        fs::create_dir_all(base.join(".hidden")).unwrap();
        fs::write(base.join("a.png"), b"png").unwrap();
        fs::write(base.join("clip.mp4"), b"mp4").unwrap();
        fs::write(base.join("notes.txt"), b"txt").unwrap();
        fs::write(base.join("sub/b.jpg"), b"jpg").unwrap();
        fs::write(base.join("sub/deep/c.wav"), b"wav").unwrap();
        fs::write(base.join(".hidden/secret.png"), b"png").unwrap();
        let root = ScanRoot::new(&base, &default_extensions()).unwrap();
        (dir, root)
    }

    #[test]
    fn entry_for_root_level_image() {
        let (_dir, root) = fixture();
        let scanned = build_file_entry(&root, &root.path.join("a.png"), &NoThumbnails).unwrap();

        assert_eq!(scanned.folder, "output");
        assert_eq!(scanned.name, "a.png");
        assert_eq!(scanned.entry.url, "/static_gallery/a.png");
        assert_eq!(scanned.entry.kind, FileKind::Image);
        assert!(scanned.entry.metadata_pending);
        assert!(scanned.entry.thumbnail_pending);
        assert!(scanned.entry.timestamp > 0.0);
        assert_eq!(scanned.entry.date.len(), 19);
    }

    #[test]
    fn entry_for_nested_media_has_no_thumbnail_state() {
        let (_dir, root) = fixture();
        let scanned = build_file_entry(&root, &root.path.join("sub/deep/c.wav"), &FixedThumbs).unwrap();

        assert_eq!(scanned.folder, "output/sub/deep");
        assert_eq!(scanned.entry.url, "/static_gallery/sub/deep/c.wav");
        assert_eq!(scanned.entry.kind, FileKind::Audio);
        assert!(!scanned.entry.metadata_pending);
        assert_eq!(scanned.entry.thumbnail_url, None);
        assert!(!scanned.entry.thumbnail_pending);
    }

    #[test]
    fn existing_thumbnail_is_attached_to_images() {
        let (_dir, root) = fixture();
        let scanned = build_file_entry(&root, &root.path.join("sub/b.jpg"), &FixedThumbs).unwrap();
        assert_eq!(scanned.entry.thumbnail_url.as_deref(), Some("/thumbs/sub/b.jpg"));
        assert!(!scanned.entry.thumbnail_pending);
    }

    #[test]
    fn rejects_disallowed_missing_and_directories() {
        let (_dir, root) = fixture();
        assert!(build_file_entry(&root, &root.path.join("notes.txt"), &NoThumbnails).is_none());
        assert!(build_file_entry(&root, &root.path.join("missing.png"), &NoThumbnails).is_none());
        assert!(build_file_entry(&root, &root.path.join("sub"), &NoThumbnails).is_none());
    }

    #[test]
    fn scan_groups_by_folder_and_skips_hidden_dirs() {
        let (_dir, root) = fixture();
        let snapshot = scan_tree(&root, true, &NoThumbnails);

        let keys: Vec<_> = snapshot.keys().cloned().collect();
        assert_eq!(keys, vec!["output", "output/sub", "output/sub/deep"]);
        assert_eq!(snapshot["output"].len(), 2);
        assert!(snapshot["output"].contains_key("clip.mp4"));
        assert!(!snapshot.values().any(|f| f.contains_key("secret.png")));
    }

    #[test]
    fn non_recursive_scan_stays_at_top_level() {
        let (_dir, root) = fixture();
        let snapshot = scan_tree(&root, false, &NoThumbnails);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["output"].len(), 2);
    }

    #[test]
    fn folder_path_round_trips_and_refuses_escapes() {
        let (_dir, root) = fixture();
        assert_eq!(root.folder_path("output").unwrap(), root.path);
        assert_eq!(root.folder_path("output/sub/deep").unwrap(), root.path.join("sub/deep"));
        assert_eq!(root.folder_path("sub").unwrap(), root.path.join("sub"));
        assert!(matches!(root.folder_path("output/../.."), Err(GalleryError::AccessDenied(_))));
    }
}
