// FILE: src/librarian/mod.rs
//! The Librarian: keeps one watched root's folder snapshot current.
//!
//! Raw events are filtered on ingestion, collected into a pending batch and
//! drained after an adaptive debounce (or at once when the batch is full).
//! A drain coalesces the batch, applies it to the snapshot, queues metadata
//! work and broadcasts the resulting change events.
//!
//! At most one drain runs per root. Events that arrive during a drain wait
//! in the pending list and trigger a follow-up drain when it finishes.

pub mod coalesce;
pub mod watcher;

pub use coalesce::{coalesce, Backoff, ChangeAction, RawEvent, RawEventKind};
pub use watcher::FolderWatcher;

use crate::bouncer::Bouncer;
use crate::error::{GalleryError, Result};
use crate::scanner::{build_file_entry, scan_tree, FileEntry, FileKind, FolderSnapshot, ScanRoot};
use crate::services::FILE_CHANGE_EVENT;
use crate::state::SharedState;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

const SEEN_PRUNE_THRESHOLD: usize = 1024;

/// One applied change, as sent to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    pub folder: String,
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<FileEntry>,
}

/// What a single drain produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub changes: Vec<ChangeEvent>,
    pub totals: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LibrarianStats {
    pub batches: usize,
    pub raw_events: usize,
    pub changes: usize,
    /// Highest number of drains ever observed running at once.
    pub peak_drains: usize,
}

#[derive(Default)]
struct Pending {
    events: Vec<RawEvent>,
    running: bool,
    timer: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Default)]
struct Counters {
    batches: AtomicUsize,
    raw_events: AtomicUsize,
    changes: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct RootMonitor {
    root: ScanRoot,
    recursive: bool,
    batch_ceiling: usize,
    base_interval: Duration,
    state: SharedState,
    runtime: Handle,
    cancel: CancellationToken,
    pending: Mutex<Pending>,
    seen: Mutex<HashMap<SeenKey, Instant>>,
    backoff: Mutex<Backoff>,
    snapshot: Mutex<FolderSnapshot>,
    counters: Counters,
}

/// Resets the drain flag when a drain ends, however it ends, and kicks off
/// a follow-up drain if events piled up meanwhile.
struct DrainGuard<'a> {
    monitor: &'a Arc<RootMonitor>,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.monitor.counters.active.fetch_sub(1, Ordering::SeqCst);
        let has_more = match self.monitor.pending.lock() {
            Ok(mut pending) => {
                pending.running = false;
                !pending.events.is_empty()
            }
            Err(_) => false,
        };
        if has_more && !self.monitor.cancel.is_cancelled() {
            self.monitor.schedule_flush(true);
        }
    }
}

impl RootMonitor {
    fn interval(&self) -> Duration {
        self.backoff.lock().map(|b| b.current()).unwrap_or(self.base_interval)
    }

    /// Same rules the baseline scan applies, so live events never list a
    /// file a fresh scan would skip.
    fn accepts(&self, path: &Path) -> bool {
        !Bouncer::is_temp_file(path)
            && !Bouncer::in_hidden_dir(&self.root.path, path)
            && self.root.allow.allows(path)
    }

    fn ingest(self: &Arc<Self>, event: RawEvent) {
        if event.is_directory || self.cancel.is_cancelled() {
            return;
        }
        let real = Bouncer::resolve(&event.path);
        if !Bouncer::is_within(&self.root.path, &real) {
            tracing::debug!("[Librarian] Ignoring event outside root: {}", real.display());
            return;
        }
        if Bouncer::is_temp_file(&real) {
            return;
        }

        let now = Instant::now();
        let interval = self.interval();
        {
            let Ok(mut seen) = self.seen.lock() else { return };
            if !remember(&mut seen, (event.kind, real.clone()), now, interval) {
                return;
            }
        }

        let dest_path = event.dest_path.as_deref().map(Bouncer::resolve);
        tracing::debug!("[Librarian] Detected {:?}: {}", event.kind, real.display());

        let queued = {
            let Ok(mut pending) = self.pending.lock() else { return };
            pending.events.push(RawEvent { kind: event.kind, path: real, dest_path, is_directory: false });
            pending.events.len()
        };

        if queued >= self.batch_ceiling {
            tracing::debug!("[Librarian] Max batch size reached, flushing immediately");
            self.schedule_flush(true);
        } else {
            self.schedule_flush(false);
        }
    }

    fn schedule_flush(self: &Arc<Self>, immediate: bool) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Ok(mut pending) = self.pending.lock() else { return };
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }

        if immediate {
            drop(pending);
            self.start_processing();
            return;
        }
        // The running drain schedules its own follow-up.
        if pending.running {
            return;
        }

        let interval = self.interval();
        let monitor = Arc::clone(self);
        let token = self.cancel.clone();
        pending.timer = Some(self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(interval) => monitor.start_processing(),
            }
        }));
    }

    /// Claims the drain flag, or returns false if a drain is already running.
    fn claim(&self) -> bool {
        let Ok(mut pending) = self.pending.lock() else { return false };
        if pending.running {
            return false;
        }
        pending.running = true;
        // Detach rather than abort: this may be the timer task itself.
        pending.timer = None;
        true
    }

    fn start_processing(self: &Arc<Self>) {
        if self.cancel.is_cancelled() || !self.claim() {
            return;
        }
        let monitor = Arc::clone(self);
        self.runtime.spawn_blocking(move || {
            monitor.process_pending();
        });
    }

    /// Runs one drain. The caller must hold the drain flag.
    fn process_pending(self: &Arc<Self>) -> BatchOutcome {
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);
        let _guard = DrainGuard { monitor: self };

        let events = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut pending.events),
            Err(_) => return BatchOutcome::default(),
        };
        if events.is_empty() {
            return BatchOutcome::default();
        }
        self.handle_batch(events)
    }

    fn handle_batch(&self, events: Vec<RawEvent>) -> BatchOutcome {
        let count = events.len();
        tracing::info!("[Librarian] Processing {} filesystem events", count);
        self.counters.batches.fetch_add(1, Ordering::SeqCst);
        self.counters.raw_events.fetch_add(count, Ordering::SeqCst);

        let actions = coalesce(&events, |p| self.accepts(p));
        let mut outcome = BatchOutcome::default();

        if let Ok(mut snapshot) = self.snapshot.lock() {
            for (path, action) in actions {
                if !Bouncer::is_within(&self.root.path, &path) {
                    continue;
                }
                let change = match action {
                    ChangeAction::Remove => self.apply_remove(&mut snapshot, &path),
                    _ if !self.accepts(&path) => None,
                    upsert => self.apply_upsert(&mut snapshot, &path, upsert),
                };
                if let Some(change) = change {
                    let total = snapshot.get(&change.folder).map(|f| f.len()).unwrap_or(0);
                    outcome.totals.insert(change.folder.clone(), total);
                    outcome.changes.push(change);
                }
            }
        }

        if outcome.changes.is_empty() {
            tracing::debug!("[Librarian] No actionable changes after coalescing");
        } else {
            tracing::info!("[Librarian] Sending {} incremental change events", outcome.changes.len());
            self.counters.changes.fetch_add(outcome.changes.len(), Ordering::SeqCst);
            match serde_json::to_value(&outcome) {
                Ok(payload) => self.state.broadcaster.notify(FILE_CHANGE_EVENT, payload),
                Err(e) => tracing::error!("[Librarian] Failed to encode change events: {}", e),
            }
        }

        if let Ok(mut backoff) = self.backoff.lock() {
            let before = backoff.current();
            let after = backoff.adjust(count);
            if before != after {
                tracing::debug!("[Librarian] Debounce interval {:?} -> {:?}", before, after);
            }
        }
        outcome
    }

    fn apply_upsert(&self, snapshot: &mut FolderSnapshot, path: &Path, action: ChangeAction) -> Option<ChangeEvent> {
        let scanned = build_file_entry(&self.root, path, self.state.thumbnails.as_ref())?;

        if action == ChangeAction::Update {
            if let Err(e) = self.state.cache.invalidate(&path.to_string_lossy()) {
                tracing::warn!("[Librarian] Cache invalidation failed for {}: {}", path.display(), e);
            }
        }
        if scanned.entry.kind == FileKind::Image {
            if let Some(relative) = self.root.relative_path(path) {
                self.state.pipeline.queue_index(
                    path.to_path_buf(),
                    relative,
                    scanned.folder.clone(),
                    action == ChangeAction::Update,
                );
            }
        }

        snapshot
            .entry(scanned.folder.clone())
            .or_default()
            .insert(scanned.name.clone(), scanned.entry.clone());
        Some(ChangeEvent { action, folder: scanned.folder, file: scanned.name, data: Some(scanned.entry) })
    }

    /// Always cleans up, even for extensions the allow-list rejects. Only
    /// reports a change if the path was listable or actually known.
    fn apply_remove(&self, snapshot: &mut FolderSnapshot, path: &Path) -> Option<ChangeEvent> {
        let (folder, name) = self.root.folder_and_name(path);
        let mut existed = false;
        if let Some(contents) = snapshot.get_mut(&folder) {
            existed = contents.remove(&name).is_some();
            if contents.is_empty() {
                snapshot.remove(&folder);
            }
        }

        if let Err(e) = self.state.cache.invalidate(&path.to_string_lossy()) {
            tracing::warn!("[Librarian] Cache invalidation failed for {}: {}", path.display(), e);
        }
        if !existed && !self.accepts(path) {
            return None;
        }

        if FileKind::of(path) == FileKind::Image {
            let relative = self.root.relative_path(path).unwrap_or_else(|| name.clone());
            self.state.pipeline.queue_delete(path.to_path_buf(), relative, folder.clone());
        }
        Some(ChangeEvent { action: ChangeAction::Remove, folder, file: name, data: None })
    }
}

type SeenKey = (RawEventKind, PathBuf);

/// Records an event in the repeat-suppression table. Returns false for an
/// exact repeat inside `interval`. Past the prune threshold, entries older
/// than four intervals are dropped.
fn remember(seen: &mut HashMap<SeenKey, Instant>, key: SeenKey, now: Instant, interval: Duration) -> bool {
    if let Some(last) = seen.get(&key) {
        if now.saturating_duration_since(*last) < interval {
            return false;
        }
    }
    seen.insert(key, now);
    if seen.len() > SEEN_PRUNE_THRESHOLD {
        let horizon = interval * 4;
        seen.retain(|_, t| now.saturating_duration_since(*t) <= horizon);
    }
    true
}

pub struct Librarian {
    monitor: Arc<RootMonitor>,
    watcher: Option<FolderWatcher>,
}

impl Librarian {
    /// Timers and drains run on `runtime`; the watcher may call in from any thread.
    pub fn new(state: SharedState, root: &Path, runtime: Handle) -> Result<Self> {
        let root = ScanRoot::new(root, &state.config.extensions)?;
        let debounce = state.config.debounce.clone();
        let monitor = Arc::new(RootMonitor {
            root,
            recursive: state.config.recursive,
            batch_ceiling: debounce.batch_ceiling.max(1),
            base_interval: debounce.base,
            runtime,
            cancel: CancellationToken::new(),
            pending: Mutex::new(Pending::default()),
            seen: Mutex::new(HashMap::new()),
            backoff: Mutex::new(Backoff::new(debounce)),
            snapshot: Mutex::new(FolderSnapshot::new()),
            counters: Counters::default(),
            state,
        });
        Ok(Self { monitor, watcher: None })
    }

    pub fn root(&self) -> &ScanRoot {
        &self.monitor.root
    }

    /// Seeds the snapshot, queues backfill work and starts watching.
    pub fn start(&mut self) -> Result<usize> {
        let files = self.scan_baseline()?;
        let monitor = Arc::clone(&self.monitor);
        let watcher = FolderWatcher::start(&self.monitor.root.path, self.monitor.recursive, move |event| {
            monitor.ingest(event);
        })?;
        self.watcher = Some(watcher);
        tracing::info!("[Librarian] Monitoring {} ({} files)", self.monitor.root.path.display(), files);
        Ok(files)
    }

    /// Full scan that replaces the snapshot. Returns the number of files.
    pub fn scan_baseline(&self) -> Result<usize> {
        let monitor = &self.monitor;
        let fresh = scan_tree(&monitor.root, monitor.recursive, monitor.state.thumbnails.as_ref());
        let files = fresh.values().map(|f| f.len()).sum();

        if monitor.state.config.backfill {
            let mut queued = 0usize;
            for (folder, contents) in &fresh {
                let Ok(dir) = monitor.root.folder_path(folder) else { continue };
                for (name, entry) in contents {
                    if entry.kind != FileKind::Image {
                        continue;
                    }
                    let full = dir.join(name);
                    let Some(relative) = monitor.root.relative_path(&full) else { continue };
                    monitor.state.pipeline.queue_index(full, relative, folder.clone(), false);
                    queued += 1;
                }
            }
            tracing::info!("[Librarian] Queued {} images for metadata backfill", queued);
        }

        *monitor.snapshot.lock().map_err(|_| GalleryError::poisoned())? = fresh;
        Ok(files)
    }

    pub fn ingest(&self, event: RawEvent) {
        self.monitor.ingest(event);
    }

    /// Drains pending events on the calling thread, bypassing the debounce.
    /// Returns `None` if another drain holds the flag.
    pub fn flush_now(&self) -> Option<BatchOutcome> {
        if !self.monitor.claim() {
            return None;
        }
        Some(self.monitor.process_pending())
    }

    pub fn pending_len(&self) -> usize {
        self.monitor.pending.lock().map(|p| p.events.len()).unwrap_or(0)
    }

    pub fn is_draining(&self) -> bool {
        self.monitor.pending.lock().map(|p| p.running).unwrap_or(false)
    }

    pub fn current_interval(&self) -> Duration {
        self.monitor.interval()
    }

    pub fn snapshot(&self) -> FolderSnapshot {
        self.monitor.snapshot.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn folder_totals(&self) -> BTreeMap<String, usize> {
        self.monitor
            .snapshot
            .lock()
            .map(|s| s.iter().map(|(k, v)| (k.clone(), v.len())).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> LibrarianStats {
        let c = &self.monitor.counters;
        LibrarianStats {
            batches: c.batches.load(Ordering::SeqCst),
            raw_events: c.raw_events.load(Ordering::SeqCst),
            changes: c.changes.load(Ordering::SeqCst),
            peak_drains: c.peak.load(Ordering::SeqCst),
        }
    }

    /// Stops the watcher. Timers still in flight become no-ops.
    pub fn stop(&mut self) {
        self.monitor.cancel.cancel();
        if let Ok(mut pending) = self.monitor.pending.lock() {
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.stop(&self.monitor.root.path);
            tracing::info!("[Librarian] Stopped monitoring {}", self.monitor.root.path.display());
        }
    }
}

impl Drop for Librarian {
    fn drop(&mut self) {
        self.stop();
    }
}
