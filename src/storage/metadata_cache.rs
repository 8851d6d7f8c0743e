//! Two-tier metadata cache
//!
//! Tier 1 is an in-memory LRU of decoded metadata. Tier 2 is the SQLite
//! `metadata` table and is always authoritative. The optional recovery log
//! only exists to refill tier 1 quickly after a restart.
//!
//! Every entry is keyed by path and carries the (mtime, size) signature it was
//! extracted for; a read whose signature does not match is a miss.

use crate::error::{GalleryError, Result};
use crate::services::Metadata;
use crate::storage::connection::open_database;
use crate::storage::recovery_log::{now_secs, LogRecord, RecoveryLog};
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

const MTIME_EPSILON: f64 = 1e-6;
const WARM_CHUNK: usize = 64;

/// Freshness signature of a file on disk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signature {
    pub mtime: f64,
    pub size: u64,
}

impl Signature {
    pub fn new(mtime: f64, size: u64) -> Self {
        Self { mtime, size }
    }

    /// Stats `path`. Fails with `NotFound` if it is gone.
    pub fn read(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => GalleryError::NotFound(path.display().to_string()),
            _ => GalleryError::Io(e),
        })?;
        let mtime = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Ok(Self { mtime, size: meta.len() })
    }

    pub fn matches(&self, other: &Signature) -> bool {
        self.size == other.size && (self.mtime - other.mtime).abs() < MTIME_EPSILON
    }
}

struct HotEntry {
    signature: Signature,
    metadata: Metadata,
}

/// Writes that happened while warm-up was running. Warm-up must not
/// resurrect anything in here.
#[derive(Default)]
struct WarmFence {
    paths: HashSet<String>,
    prefixes: Vec<String>,
}

impl WarmFence {
    fn blocks(&self, path: &str) -> bool {
        self.paths.contains(path) || self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}

struct Tiers {
    conn: Connection,
    hot: LruCache<String, HotEntry>,
    fence: Option<WarmFence>,
}

impl Tiers {
    fn fence_path(&mut self, path: &str) {
        if let Some(fence) = self.fence.as_mut() {
            fence.paths.insert(path.to_string());
        }
    }

    fn touch(&self, path: &str) {
        if let Err(e) = self.conn.execute(
            "UPDATE metadata SET last_access = ?1 WHERE path = ?2",
            params![now_secs(), path],
        ) {
            tracing::debug!("[MetadataCache] Failed to update last_access for {}: {}", path, e);
        }
    }
}

pub struct MetadataCache {
    db_path: PathBuf,
    tiers: Mutex<Tiers>,
    log: Option<RecoveryLog>,
    capacity: usize,
    closed: AtomicBool,
    warmup: Mutex<Option<JoinHandle<()>>>,
}

impl MetadataCache {
    /// Opens the cache and starts warming tier 1 in the background.
    pub fn open(db_path: &Path, log_path: Option<&Path>, capacity: usize) -> Result<Arc<Self>> {
        let conn = open_database(db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                path TEXT PRIMARY KEY,
                mtime REAL NOT NULL,
                size INTEGER NOT NULL,
                metadata_json TEXT NOT NULL,
                last_access REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_metadata_last_access ON metadata(last_access);
            "#,
        )?;

        let log = match log_path {
            Some(path) => match RecoveryLog::open(path) {
                Ok(log) => Some(log),
                Err(e) => {
                    tracing::warn!("[MetadataCache] Recovery log unavailable at {}: {}", path.display(), e);
                    None
                }
            },
            None => None,
        };

        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        let cache = Arc::new(Self {
            db_path: db_path.to_path_buf(),
            tiers: Mutex::new(Tiers { conn, hot: LruCache::new(cap), fence: Some(WarmFence::default()) }),
            log,
            capacity: cap.get(),
            closed: AtomicBool::new(false),
            warmup: Mutex::new(None),
        });

        let worker = Arc::clone(&cache);
        let handle = std::thread::Builder::new()
            .name("gallerydex-warmup".into())
            .spawn(move || worker.warm())?;
        *cache.warmup.lock().map_err(|_| GalleryError::poisoned())? = Some(handle);

        tracing::info!("[MetadataCache] Opened {} (hot capacity {})", db_path.display(), cap);
        Ok(cache)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tiers>> {
        self.tiers.lock().map_err(|_| GalleryError::poisoned())
    }

    /// Returns cached metadata if the stored signature matches.
    pub fn get(&self, path: &str, signature: Signature) -> Result<Option<Metadata>> {
        let mut tiers = self.lock()?;

        let hot_hit = match tiers.hot.get(path) {
            Some(entry) if entry.signature.matches(&signature) => Some(entry.metadata.clone()),
            _ => None,
        };
        if let Some(metadata) = hot_hit {
            tiers.touch(path);
            return Ok(Some(metadata));
        }

        let row: Option<(f64, i64, String)> = tiers
            .conn
            .query_row(
                "SELECT mtime, size, metadata_json FROM metadata WHERE path = ?1",
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((mtime, size, json)) = row else {
            return Ok(None);
        };
        let stored = Signature::new(mtime, size.max(0) as u64);
        if !stored.matches(&signature) {
            return Ok(None);
        }

        match decode_blob(path, &json) {
            Ok(metadata) => {
                tiers.touch(path);
                tiers.hot.put(path.to_string(), HotEntry { signature: stored, metadata: metadata.clone() });
                Ok(Some(metadata))
            }
            Err(e) => {
                tracing::warn!("[MetadataCache] {}, purging entry", e);
                tiers.conn.execute("DELETE FROM metadata WHERE path = ?1", params![path])?;
                tiers.hot.pop(path);
                tiers.fence_path(path);
                drop(tiers);
                self.log_removal(path);
                Ok(None)
            }
        }
    }

    pub fn has_valid(&self, path: &str, signature: Signature) -> Result<bool> {
        Ok(self.get(path, signature)?.is_some())
    }

    pub fn set(&self, path: &str, signature: Signature, metadata: &Metadata) -> Result<()> {
        let json = serde_json::to_string(metadata)?;
        let mut tiers = self.lock()?;
        tiers.conn.execute(
            r#"
            INSERT INTO metadata(path, mtime, size, metadata_json, last_access)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(path) DO UPDATE SET
                mtime = excluded.mtime,
                size = excluded.size,
                metadata_json = excluded.metadata_json,
                last_access = excluded.last_access
            "#,
            params![path, signature.mtime, signature.size as i64, json, now_secs()],
        )?;
        tiers.hot.put(path.to_string(), HotEntry { signature, metadata: metadata.clone() });
        tiers.fence_path(path);
        drop(tiers);

        if let Some(log) = &self.log {
            if let Err(e) = log.append_upsert(path, signature.mtime, signature.size, &json) {
                tracing::warn!("[MetadataCache] Recovery log append failed for {}: {}", path, e);
            }
        }
        Ok(())
    }

    pub fn invalidate(&self, path: &str) -> Result<()> {
        let mut tiers = self.lock()?;
        tiers.conn.execute("DELETE FROM metadata WHERE path = ?1", params![path])?;
        tiers.hot.pop(path);
        tiers.fence_path(path);
        drop(tiers);
        self.log_removal(path);
        Ok(())
    }

    /// Drops every record whose path starts with `prefix`, in both tiers.
    pub fn purge_prefix(&self, prefix: &str) -> Result<usize> {
        let mut tiers = self.lock()?;
        let doomed: Vec<String> = {
            let mut stmt = tiers
                .conn
                .prepare("SELECT path FROM metadata WHERE substr(path, 1, ?2) = ?1")?;
            let rows = stmt.query_map(params![prefix, prefix.chars().count() as i64], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        tiers.conn.execute(
            "DELETE FROM metadata WHERE substr(path, 1, ?2) = ?1",
            params![prefix, prefix.chars().count() as i64],
        )?;

        let hot_keys: Vec<String> = tiers
            .hot
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &hot_keys {
            tiers.hot.pop(key);
        }
        if let Some(fence) = tiers.fence.as_mut() {
            fence.prefixes.push(prefix.to_string());
        }
        drop(tiers);

        for path in &doomed {
            self.log_removal(path);
        }
        tracing::debug!("[MetadataCache] Purged {} records under {}", doomed.len(), prefix);
        Ok(doomed.len())
    }

    pub fn hot_len(&self) -> usize {
        self.lock().map(|t| t.hot.len()).unwrap_or(0)
    }

    /// Blocks until the background warm-up has finished.
    pub fn wait_for_warmup(&self) {
        let handle = match self.warmup.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Stops warm-up early and waits for it.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wait_for_warmup();
    }

    fn log_removal(&self, path: &str) {
        if let Some(log) = &self.log {
            if let Err(e) = log.append_removal(path) {
                tracing::warn!("[MetadataCache] Recovery log append failed for {}: {}", path, e);
            }
        }
    }

    fn warm(&self) {
        let records = match self.warm_candidates() {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("[MetadataCache] Warm cache failed: {}", e);
                Vec::new()
            }
        };

        let mut loaded = 0usize;
        // Oldest first so the newest end up most recently used.
        let ordered: Vec<_> = records.into_iter().rev().collect();
        for chunk in ordered.chunks(WARM_CHUNK) {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let Ok(mut tiers) = self.lock() else { return };
            for (path, signature, metadata) in chunk {
                let skip = tiers.hot.contains(path)
                    || tiers.fence.as_ref().map(|f| f.blocks(path)).unwrap_or(false);
                if !skip {
                    tiers.hot.put(path.clone(), HotEntry { signature: *signature, metadata: metadata.clone() });
                    loaded += 1;
                }
            }
        }

        if let Ok(mut tiers) = self.lock() {
            tiers.fence = None;
        }
        tracing::info!("[MetadataCache] Warm-up loaded {} entries", loaded);
    }

    /// Newest-first candidates: from the recovery log when it has anything,
    /// otherwise the most recently accessed rows of the table.
    fn warm_candidates(&self) -> Result<Vec<(String, Signature, Metadata)>> {
        if let Some(log) = &self.log {
            match log.recent(self.capacity) {
                Ok(records) if !records.is_empty() => return Ok(self.decode_log(records)),
                Ok(_) => {}
                Err(e) => tracing::warn!("[MetadataCache] Recovery log unreadable, using table: {}", e),
            }
        }

        // A separate connection so reads don't hold the cache lock.
        let conn = open_database(&self.db_path)?;
        let rows: Vec<(String, f64, i64, String)> = {
            let mut stmt = conn.prepare(
                "SELECT path, mtime, size, metadata_json FROM metadata ORDER BY last_access DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![self.capacity as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut out = Vec::with_capacity(rows.len());
        let mut corrupt = Vec::new();
        for (path, mtime, size, json) in rows {
            match decode_blob(&path, &json) {
                Ok(metadata) => out.push((path, Signature::new(mtime, size.max(0) as u64), metadata)),
                Err(e) => {
                    tracing::warn!("[MetadataCache] {} during warm-up, purging", e);
                    corrupt.push(path);
                }
            }
        }
        for path in corrupt {
            if let Err(e) = self.invalidate(&path) {
                tracing::warn!("[MetadataCache] Purge failed for {}: {}", path, e);
            }
        }
        Ok(out)
    }

    fn decode_log(&self, records: Vec<LogRecord>) -> Vec<(String, Signature, Metadata)> {
        records
            .into_iter()
            .filter_map(|r| {
                let metadata = serde_json::from_str::<Metadata>(&r.metadata_json).ok()?;
                Some((r.path, Signature::new(r.mtime, r.size), metadata))
            })
            .collect()
    }
}

/// A stored blob that is not a JSON object is corrupt.
fn decode_blob(path: &str, json: &str) -> Result<Metadata> {
    serde_json::from_str::<Metadata>(json)
        .map_err(|e| GalleryError::CorruptState(format!("metadata for {}: {}", path, e)))
}

impl Drop for MetadataCache {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    fn open(dir: &Path, with_log: bool) -> Arc<MetadataCache> {
        let log = dir.join("cache.log");
        let cache = MetadataCache::open(&dir.join("cache.db"), with_log.then_some(log.as_path()), 32).unwrap();
        cache.wait_for_warmup();
        cache
    }

    #[test]
    fn signature_tolerates_mtime_jitter_but_not_size() {
        let sig = Signature::new(100.0, 10);
        assert!(sig.matches(&Signature::new(100.0 + 1e-9, 10)));
        assert!(!sig.matches(&Signature::new(100.1, 10)));
        assert!(!sig.matches(&Signature::new(100.0, 11)));
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), false);
        let m = meta(json!({"prompt": {"positive": "a cat"}}));

        cache.set("/g/a.png", Signature::new(5.0, 42), &m).unwrap();
        assert_eq!(cache.get("/g/a.png", Signature::new(5.0, 42)).unwrap(), Some(m));
        assert_eq!(cache.get("/g/a.png", Signature::new(5.0, 43)).unwrap(), None);
        assert_eq!(cache.get("/g/a.png", Signature::new(6.0, 42)).unwrap(), None);
    }

    #[test]
    fn durable_tier_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let m = meta(json!({"model": "sdxl"}));
        {
            let cache = open(dir.path(), false);
            cache.set("/g/b.png", Signature::new(1.0, 1), &m).unwrap();
            cache.close();
        }
        let cache = open(dir.path(), false);
        assert_eq!(cache.get("/g/b.png", Signature::new(1.0, 1)).unwrap(), Some(m));
    }

    #[test]
    fn corrupt_rows_are_purged_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), false);
        {
            let tiers = cache.lock().unwrap();
            tiers
                .conn
                .execute(
                    "INSERT INTO metadata(path, mtime, size, metadata_json, last_access) VALUES ('/g/bad.png', 1.0, 1, '{not json', 0)",
                    [],
                )
                .unwrap();
        }

        assert_eq!(cache.get("/g/bad.png", Signature::new(1.0, 1)).unwrap(), None);
        let count: i64 = cache
            .lock()
            .unwrap()
            .conn
            .query_row("SELECT COUNT(*) FROM metadata", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn undecodable_blobs_are_corrupt_state() {
        assert!(matches!(decode_blob("/g/a.png", "{not json"), Err(GalleryError::CorruptState(_))));
        assert!(matches!(decode_blob("/g/a.png", "[1, 2]"), Err(GalleryError::CorruptState(_))));
        assert!(decode_blob("/g/a.png", r#"{"k": 1}"#).is_ok());
    }

    #[test]
    fn invalidate_and_purge_prefix_clear_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), false);
        let m = meta(json!({"k": 1}));
        let sig = Signature::new(1.0, 1);

        cache.set("/g/x/1.png", sig, &m).unwrap();
        cache.set("/g/x/2.png", sig, &m).unwrap();
        cache.set("/g/y/3.png", sig, &m).unwrap();

        cache.invalidate("/g/y/3.png").unwrap();
        assert!(!cache.has_valid("/g/y/3.png", sig).unwrap());

        assert_eq!(cache.purge_prefix("/g/x/").unwrap(), 2);
        assert!(!cache.has_valid("/g/x/1.png", sig).unwrap());
        assert_eq!(cache.hot_len(), 0);
    }

    #[test]
    fn warm_up_replays_recovery_log() {
        let dir = tempfile::tempdir().unwrap();
        let sig = Signature::new(1.0, 1);
        {
            let cache = open(dir.path(), true);
            cache.set("/g/keep.png", sig, &meta(json!({"a": 1}))).unwrap();
            cache.set("/g/gone.png", sig, &meta(json!({"b": 2}))).unwrap();
            cache.invalidate("/g/gone.png").unwrap();
            cache.close();
        }

        let cache = open(dir.path(), true);
        assert_eq!(cache.hot_len(), 1);
        assert!(cache.has_valid("/g/keep.png", sig).unwrap());
    }

    #[test]
    fn warm_up_keeps_the_newest_log_entries() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cache.db");
        let log = dir.path().join("cache.log");
        let sig = Signature::new(1.0, 1);
        {
            let cache = MetadataCache::open(&db, Some(log.as_path()), 64).unwrap();
            cache.wait_for_warmup();
            for i in 0..20 {
                cache.set(&format!("/g/{:02}.png", i), sig, &meta(json!({ "i": i }))).unwrap();
            }
            cache.close();
        }

        let cache = MetadataCache::open(&db, Some(log.as_path()), 16).unwrap();
        cache.wait_for_warmup();
        assert_eq!(cache.hot_len(), 16);
        let tiers = cache.lock().unwrap();
        for i in 0..4 {
            assert!(!tiers.hot.contains(&format!("/g/{:02}.png", i)));
        }
        for i in 4..20 {
            assert!(tiers.hot.contains(&format!("/g/{:02}.png", i)));
        }
    }

    #[test]
    fn warm_up_falls_back_to_table() {
        let dir = tempfile::tempdir().unwrap();
        let sig = Signature::new(1.0, 1);
        {
            let cache = open(dir.path(), false);
            cache.set("/g/a.png", sig, &meta(json!({"a": 1}))).unwrap();
            cache.set("/g/b.png", sig, &meta(json!({"b": 1}))).unwrap();
            cache.close();
        }

        let cache = open(dir.path(), false);
        assert_eq!(cache.hot_len(), 2);
    }

    #[test]
    fn signature_read_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = Signature::read(&dir.path().join("nope.png")).unwrap_err();
        assert!(matches!(err, GalleryError::NotFound(_)));
    }
}
