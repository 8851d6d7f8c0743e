// FILE: src/librarian/coalesce.rs
//! Pure parts of the Event Coalescer: the raw event model, the per-batch
//! fold that collapses bursts into net actions, and the adaptive debounce.

use crate::config::DebounceConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawEventKind {
    Created,
    Deleted,
    Modified,
    Moved,
}

/// One notification from the directory watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub path: PathBuf,
    pub dest_path: Option<PathBuf>,
    pub is_directory: bool,
}

impl RawEvent {
    pub fn new(kind: RawEventKind, path: impl Into<PathBuf>) -> Self {
        Self { kind, path: path.into(), dest_path: None, is_directory: false }
    }

    pub fn moved(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self { kind: RawEventKind::Moved, path: from.into(), dest_path: Some(to.into()), is_directory: false }
    }

    pub fn directory(mut self) -> Self {
        self.is_directory = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Remove,
}

/// Left-to-right fold of a batch into one net action per path.
/// `allow` filters move destinations.
pub fn coalesce<F>(events: &[RawEvent], allow: F) -> BTreeMap<PathBuf, ChangeAction>
where
    F: Fn(&Path) -> bool,
{
    let mut actions: BTreeMap<PathBuf, ChangeAction> = BTreeMap::new();

    for event in events {
        match event.kind {
            RawEventKind::Moved => {
                actions.insert(event.path.clone(), ChangeAction::Remove);
                if let Some(dest) = &event.dest_path {
                    if allow(dest) {
                        actions.insert(dest.clone(), ChangeAction::Create);
                    }
                }
            }
            RawEventKind::Deleted => {
                actions.insert(event.path.clone(), ChangeAction::Remove);
            }
            RawEventKind::Created => {
                let next = match actions.get(&event.path) {
                    Some(ChangeAction::Remove) => ChangeAction::Update,
                    _ => ChangeAction::Create,
                };
                actions.insert(event.path.clone(), next);
            }
            RawEventKind::Modified => {
                if actions.get(&event.path) != Some(&ChangeAction::Create) {
                    actions.insert(event.path.clone(), ChangeAction::Update);
                }
            }
        }
    }
    actions
}

/// Adaptive debounce interval, moved after every batch.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: DebounceConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: DebounceConfig) -> Self {
        let current = config.base;
        Self { config, current }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Grows on a full batch, shrinks on a quiet one, otherwise holds.
    pub fn adjust(&mut self, event_count: usize) -> Duration {
        if event_count >= self.config.batch_ceiling {
            self.current = self.current.mul_f64(self.config.multiplier).min(self.config.max);
        } else if event_count <= self.config.quiet_threshold() {
            self.current = self.current.div_f64(self.config.multiplier).max(self.config.base);
        }
        self.current
    }
}
