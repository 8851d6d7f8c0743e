//! gallerydex: incremental media-folder indexer
//!
//! A single-process library with three cooperating parts:
//! - Librarian (watches a root, coalesces events, keeps the folder snapshot)
//! - Engine (bounded worker pool that extracts, caches and indexes metadata)
//! - Oracle (read side: search, metadata lookups, listings)
//!
//! All of them share one [`GalleryState`] built at start-up.

pub mod bouncer;
pub mod config;
pub mod engine;
pub mod error;
pub mod librarian;
pub mod oracle;
pub mod scanner;
pub mod services;
pub mod state;
pub mod storage;

pub use config::GalleryConfig;
pub use error::{GalleryError, Result};
pub use librarian::Librarian;
pub use oracle::Oracle;
pub use scanner::{FileEntry, FileKind, FolderSnapshot};
pub use services::{Broadcaster, Metadata, MetadataExtractor, ThumbnailProvider};
pub use state::{Collaborators, GalleryState, SharedState};
