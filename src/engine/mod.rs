// FILE: src/engine/mod.rs
//! Metadata work items and the worker pool that executes them.

pub mod indexer;
pub mod pipeline;

pub use indexer::Indexer;
pub use pipeline::{Enqueue, MetadataPipeline, ResultListener};

use crate::services::Metadata;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Index,
    Delete,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::Index => "index",
            TaskAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataTask {
    pub action: TaskAction,
    pub full_path: PathBuf,
    pub relative_path: String,
    pub folder_key: String,
    #[serde(default)]
    pub force: bool,
}

impl MetadataTask {
    pub fn index(full_path: PathBuf, relative_path: String, folder_key: String, force: bool) -> Self {
        Self { action: TaskAction::Index, full_path, relative_path, folder_key, force }
    }

    pub fn delete(full_path: PathBuf, relative_path: String, folder_key: String) -> Self {
        Self { action: TaskAction::Delete, full_path, relative_path, folder_key, force: false }
    }

    /// In-flight key: one pending task per (action, full path).
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.action.as_str(), self.full_path.display())
    }
}

/// Outcome of one accepted task. Exactly one is produced per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataResult {
    pub action: TaskAction,
    pub full_path: PathBuf,
    pub relative_path: String,
    pub folder_key: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MetadataResult {
    pub fn succeeded(task: &MetadataTask, metadata: Option<Metadata>, thumbnail_url: Option<String>) -> Self {
        Self {
            action: task.action,
            full_path: task.full_path.clone(),
            relative_path: task.relative_path.clone(),
            folder_key: task.folder_key.clone(),
            success: true,
            metadata,
            thumbnail_url,
            error: None,
        }
    }

    pub fn failed(task: &MetadataTask, error: impl Into<String>) -> Self {
        Self {
            action: task.action,
            full_path: task.full_path.clone(),
            relative_path: task.relative_path.clone(),
            folder_key: task.folder_key.clone(),
            success: false,
            metadata: None,
            thumbnail_url: None,
            error: Some(error.into()),
        }
    }

    /// File name component, as used in change notifications.
    pub fn file_name(&self) -> String {
        self.full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_separates_actions() {
        let idx = MetadataTask::index("/g/a.png".into(), "a.png".into(), "g".into(), false);
        let del = MetadataTask::delete("/g/a.png".into(), "a.png".into(), "g".into());
        assert_eq!(idx.dedup_key(), "index:/g/a.png");
        assert_ne!(idx.dedup_key(), del.dedup_key());
    }

    #[test]
    fn result_serializes_without_empty_fields() {
        let task = MetadataTask::delete("/g/a.png".into(), "a.png".into(), "g".into());
        let value = serde_json::to_value(MetadataResult::succeeded(&task, None, None)).unwrap();
        assert_eq!(value["action"], "delete");
        assert_eq!(value["success"], true);
        assert!(value.get("metadata").is_none());
        assert!(value.get("error").is_none());
    }
}
