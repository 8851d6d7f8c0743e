// FILE: src/librarian/watcher.rs
//! Adapter between `notify` and the coalescer's [`RawEvent`] model.
//! The callback runs on notify's thread and only forwards events.

use crate::error::Result;
use crate::librarian::coalesce::{RawEvent, RawEventKind};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;

pub struct FolderWatcher {
    watcher: RecommendedWatcher,
}

impl FolderWatcher {
    pub fn start<F>(root: &Path, recursive: bool, sink: F) -> Result<Self>
    where
        F: Fn(RawEvent) + Send + 'static,
    {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => translate(&event).into_iter().for_each(&sink),
            Err(e) => tracing::warn!("[Watcher] Watch error: {}", e),
        })?;
        let mode = if recursive { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };
        watcher.watch(root, mode)?;
        tracing::info!("[Watcher] Watching {} (recursive: {})", root.display(), recursive);
        Ok(Self { watcher })
    }

    pub fn stop(mut self, root: &Path) {
        if let Err(e) = self.watcher.unwatch(root) {
            tracing::debug!("[Watcher] Unwatch failed for {}: {}", root.display(), e);
        }
    }
}

/// Maps one notify event onto zero or more raw events.
pub fn translate(event: &Event) -> Vec<RawEvent> {
    let paths = &event.paths;
    let each = |kind: RawEventKind, dir: &dyn Fn(&Path) -> bool| -> Vec<RawEvent> {
        paths
            .iter()
            .map(|p| RawEvent { kind, path: p.clone(), dest_path: None, is_directory: dir(p.as_path()) })
            .collect()
    };

    match &event.kind {
        EventKind::Create(kind) => {
            let folder = *kind == CreateKind::Folder;
            each(RawEventKind::Created, &|p: &Path| folder || p.is_dir())
        }
        EventKind::Remove(kind) => {
            let folder = *kind == RemoveKind::Folder;
            each(RawEventKind::Deleted, &|_: &Path| folder)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            let mut raw = RawEvent::moved(paths[0].clone(), paths[1].clone());
            raw.is_directory = paths[1].is_dir();
            vec![raw]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(RawEventKind::Deleted, &|_: &Path| false),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(RawEventKind::Created, &|p: &Path| p.is_dir()),
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .iter()
            .map(|p| {
                let kind = if p.exists() { RawEventKind::Created } else { RawEventKind::Deleted };
                RawEvent { kind, path: p.clone(), dest_path: None, is_directory: p.is_dir() }
            })
            .collect(),
        // Permission and timestamp changes don't alter content.
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => each(RawEventKind::Modified, &|p: &Path| p.is_dir()),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, DataChange, MetadataKind};
    use std::path::PathBuf;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut e = Event::new(kind);
        for p in paths {
            e = e.add_path(PathBuf::from(p));
        }
        e
    }

    #[test]
    fn basic_kinds_map_directly() {
        let created = translate(&event(EventKind::Create(CreateKind::File), &["/r/a.png"]));
        assert_eq!(created, vec![RawEvent::new(RawEventKind::Created, "/r/a.png")]);

        let removed = translate(&event(EventKind::Remove(RemoveKind::Folder), &["/r/sub"]));
        assert_eq!(removed, vec![RawEvent::new(RawEventKind::Deleted, "/r/sub").directory()]);

        let modified = translate(&event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &["/r/a.png"]));
        assert_eq!(modified[0].kind, RawEventKind::Modified);
    }

    #[test]
    fn paired_rename_becomes_move() {
        let moved = translate(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/r/old.png", "/r/new.png"],
        ));
        assert_eq!(moved, vec![RawEvent::moved("/r/old.png", "/r/new.png")]);
    }

    #[test]
    fn half_renames_become_delete_and_create() {
        let from = translate(&event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/r/x.png"]));
        assert_eq!(from[0].kind, RawEventKind::Deleted);
        let to = translate(&event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &["/r/y.png"]));
        assert_eq!(to[0].kind, RawEventKind::Created);
    }

    #[test]
    fn noise_is_dropped() {
        assert!(translate(&event(EventKind::Access(AccessKind::Any), &["/r/a.png"])).is_empty());
        assert!(translate(&event(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)), &["/r/a.png"])).is_empty());
    }
}
