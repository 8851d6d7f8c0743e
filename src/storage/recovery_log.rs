//! Append-only JSON-lines log of cache writes.
//!
//! Only used to rebuild the hot tier quickly at start-up. The database stays
//! authoritative; a missing or damaged log just means a slower warm-up.

use crate::error::{GalleryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_json: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub remove: bool,
    pub ts: f64,
}

/// Latest surviving upsert for one path.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub path: String,
    pub mtime: f64,
    pub size: u64,
    pub metadata_json: String,
    pub ts: f64,
}

pub struct RecoveryLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RecoveryLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { path: path.to_path_buf(), file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_upsert(&self, path: &str, mtime: f64, size: u64, metadata_json: &str) -> Result<()> {
        self.append(&LogLine {
            path: path.to_string(),
            mtime: Some(mtime),
            size: Some(size),
            metadata_json: Some(metadata_json.to_string()),
            remove: false,
            ts: now_secs(),
        })
    }

    pub fn append_removal(&self, path: &str) -> Result<()> {
        self.append(&LogLine {
            path: path.to_string(),
            mtime: None,
            size: None,
            metadata_json: None,
            remove: true,
            ts: now_secs(),
        })
    }

    fn append(&self, line: &LogLine) -> Result<()> {
        let mut encoded = serde_json::to_string(line)?;
        encoded.push('\n');
        let mut file = self.file.lock().map_err(|_| GalleryError::poisoned())?;
        file.write_all(encoded.as_bytes())?;
        Ok(())
    }

    /// Folds the whole log forward and returns the newest `limit` live
    /// records, newest first. Equal timestamps fall back to log order.
    /// Unparseable lines are skipped.
    pub fn recent(&self, limit: usize) -> Result<Vec<LogRecord>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut latest: HashMap<String, Option<(usize, LogRecord)>> = HashMap::new();
        let mut skipped = 0usize;

        for (seq, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: LogLine = match serde_json::from_str(&line) {
                Ok(l) => l,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };
            if parsed.remove {
                latest.insert(parsed.path, None);
                continue;
            }
            match (parsed.mtime, parsed.size, parsed.metadata_json) {
                (Some(mtime), Some(size), Some(metadata_json)) => {
                    let record = LogRecord { path: parsed.path.clone(), mtime, size, metadata_json, ts: parsed.ts };
                    latest.insert(parsed.path, Some((seq, record)));
                }
                _ => skipped += 1,
            }
        }

        if skipped > 0 {
            tracing::debug!("[RecoveryLog] Skipped {} malformed lines", skipped);
        }

        let mut records: Vec<(usize, LogRecord)> = latest.into_values().flatten().collect();
        records.sort_by(|(seq_a, a), (seq_b, b)| b.ts.total_cmp(&a.ts).then(seq_b.cmp(seq_a)));
        records.truncate(limit);
        Ok(records.into_iter().map(|(_, record)| record).collect())
    }
}

pub(crate) fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_lines_win_and_removals_mask() {
        let dir = tempfile::tempdir().unwrap();
        let log = RecoveryLog::open(&dir.path().join("cache.log")).unwrap();

        log.append_upsert("/a.png", 1.0, 10, r#"{"v":1}"#).unwrap();
        log.append_upsert("/b.png", 2.0, 20, r#"{"v":2}"#).unwrap();
        log.append_upsert("/a.png", 3.0, 30, r#"{"v":3}"#).unwrap();
        log.append_removal("/b.png").unwrap();

        let records = log.recent(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "/a.png");
        assert_eq!(records[0].size, 30);
        assert_eq!(records[0].metadata_json, r#"{"v":3}"#);
    }

    #[test]
    fn garbage_lines_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.log");
        std::fs::write(&path, "not json\n{\"path\":\"/x\",\"ts\":1.0}\n\n").unwrap();

        let log = RecoveryLog::open(&path).unwrap();
        log.append_upsert("/c.png", 1.0, 1, "{}").unwrap();

        let records = log.recent(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "/c.png");
    }

    #[test]
    fn recent_keeps_the_newest_records_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = RecoveryLog::open(&dir.path().join("cache.log")).unwrap();
        for i in 0..5 {
            log.append_upsert(&format!("/{}.png", i), 1.0, 1, "{}").unwrap();
        }
        let paths: Vec<_> = log.recent(3).unwrap().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/4.png", "/3.png", "/2.png"]);
    }

    #[test]
    fn timestamps_order_before_log_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.log");
        let lines = [
            r#"{"path":"/late.png","mtime":1.0,"size":1,"metadata_json":"{}","ts":30.0}"#,
            r#"{"path":"/early.png","mtime":1.0,"size":1,"metadata_json":"{}","ts":10.0}"#,
            r#"{"path":"/tie_a.png","mtime":1.0,"size":1,"metadata_json":"{}","ts":20.0}"#,
            r#"{"path":"/tie_b.png","mtime":1.0,"size":1,"metadata_json":"{}","ts":20.0}"#,
        ];
        std::fs::write(&path, lines.join("\n")).unwrap();

        let log = RecoveryLog::open(&path).unwrap();
        let paths: Vec<_> = log.recent(10).unwrap().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/late.png", "/tie_b.png", "/tie_a.png", "/early.png"]);
    }
}
