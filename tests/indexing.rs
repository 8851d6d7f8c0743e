//! End-to-end: events in, change notifications and searchable metadata out.

use gallerydex::config::{DebounceConfig, GalleryConfig};
use gallerydex::engine::MetadataTask;
use gallerydex::librarian::{RawEvent, RawEventKind};
use gallerydex::services::ExtractionError;
use gallerydex::{Broadcaster, Collaborators, GalleryState, Librarian, Metadata, MetadataExtractor};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Capture {
    payloads: Mutex<Vec<Value>>,
}

impl Capture {
    fn actions(&self) -> Vec<String> {
        self.payloads
            .lock()
            .unwrap()
            .iter()
            .flat_map(|p| p["changes"].as_array().cloned().unwrap_or_default())
            .filter_map(|c| c["action"].as_str().map(str::to_string))
            .collect()
    }
}

impl Broadcaster for Capture {
    fn notify(&self, _event: &str, payload: Value) {
        self.payloads.lock().unwrap().push(payload);
    }
}

/// Treats the file body as the prompt.
#[derive(Default)]
struct BodyAsPrompt {
    calls: AtomicUsize,
}

impl MetadataExtractor for BodyAsPrompt {
    fn extract(&self, path: &Path) -> Result<Metadata, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = fs::read_to_string(path).map_err(|e| ExtractionError::new(path, e.to_string()))?;
        Ok(json!({ "prompt": { "positive": body, "model": "test-model" } })
            .as_object()
            .cloned()
            .unwrap_or_default())
    }
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

fn make_root(dir: &Path) -> PathBuf {
    let root = dir.join("output");
    fs::create_dir_all(&root).unwrap();
    fs::canonicalize(root).unwrap()
}

fn config(dir: &Path, base: Duration) -> GalleryConfig {
    GalleryConfig {
        data_dir: dir.join("data"),
        backfill: false,
        debounce: DebounceConfig { base, max: base * 4, ..DebounceConfig::default() },
        ..GalleryConfig::default()
    }
}

#[test]
fn debounced_create_flows_through_to_search() {
    let dir = tempfile::tempdir().unwrap();
    let root = make_root(dir.path());
    let capture = Arc::new(Capture::default());
    let extractor = Arc::new(BodyAsPrompt::default());
    let collaborators = Collaborators { broadcaster: capture.clone(), extractor: extractor.clone(), ..Collaborators::default() };
    let state = GalleryState::open(config(dir.path(), Duration::from_millis(150)), collaborators).unwrap();

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let librarian = Librarian::new(Arc::clone(&state), &root, runtime.handle().clone()).unwrap();
    librarian.scan_baseline().unwrap();

    fs::write(root.join("fox.png"), "a red fox in snow").unwrap();
    librarian.ingest(RawEvent::new(RawEventKind::Created, root.join("fox.png")));
    librarian.ingest(RawEvent::new(RawEventKind::Modified, root.join("fox.png")));

    assert!(wait_until(Duration::from_secs(10), || capture.actions().contains(&"metadata".to_string())));
    let actions = capture.actions();
    assert_eq!(actions.iter().filter(|a| *a == "create").count(), 1);

    assert!(state.pipeline.wait_idle(Duration::from_secs(5)));
    let hits = state.index.search("fox", 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "fox.png");
    assert_eq!(hits[0].model, "test-model");
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);

    state.shutdown();
}

#[test]
fn full_batch_drains_immediately_and_backs_off() {
    let dir = tempfile::tempdir().unwrap();
    let root = make_root(dir.path());
    let capture = Arc::new(Capture::default());
    let collaborators = Collaborators { broadcaster: capture.clone(), ..Collaborators::default() };
    // A debounce this long never fires during the test.
    let state = GalleryState::open(config(dir.path(), Duration::from_secs(60)), collaborators).unwrap();

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let librarian = Librarian::new(Arc::clone(&state), &root, runtime.handle().clone()).unwrap();

    for i in 0..50 {
        let path = root.join(format!("burst_{:02}.mp4", i));
        fs::write(&path, b"x").unwrap();
        librarian.ingest(RawEvent::new(RawEventKind::Created, path));
    }

    assert!(wait_until(Duration::from_secs(10), || librarian.stats().batches == 1 && !librarian.is_draining()));
    assert_eq!(librarian.current_interval(), Duration::from_secs(120));
    assert_eq!(librarian.folder_totals().get("output"), Some(&50));
    assert_eq!(librarian.stats().peak_drains, 1);
    assert_eq!(capture.actions().len(), 50);

    state.shutdown();
}

#[test]
fn cached_metadata_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let root = make_root(dir.path());
    fs::write(root.join("owl.png"), "an owl at dusk").unwrap();
    let task = MetadataTask::index(root.join("owl.png"), "owl.png".into(), "output".into(), false);

    let first = Arc::new(BodyAsPrompt::default());
    {
        let collaborators = Collaborators { extractor: first.clone(), ..Collaborators::default() };
        let state = GalleryState::open(config(dir.path(), Duration::from_secs(2)), collaborators).unwrap();
        assert!(state.pipeline.indexer().process(&task).success);
        state.shutdown();
    }
    assert_eq!(first.calls.load(Ordering::SeqCst), 1);

    let second = Arc::new(BodyAsPrompt::default());
    let collaborators = Collaborators { extractor: second.clone(), ..Collaborators::default() };
    let state = GalleryState::open(config(dir.path(), Duration::from_secs(2)), collaborators).unwrap();
    state.cache.wait_for_warmup();
    assert_eq!(state.cache.hot_len(), 1);

    let result = state.pipeline.indexer().process(&task);
    assert!(result.success);
    assert_eq!(result.metadata.unwrap()["prompt"]["positive"], "an owl at dusk");
    assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    state.shutdown();
}
