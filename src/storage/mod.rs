// FILE: src/storage/mod.rs
pub mod connection;
pub mod metadata_cache;
pub mod recovery_log;
pub mod search_index;

// Common exports
pub use connection::open_database;
pub use metadata_cache::{MetadataCache, Signature};
pub use recovery_log::RecoveryLog;
pub use search_index::{extract_prompts, PromptFields, SearchHit, SearchIndex};
