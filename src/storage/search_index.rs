//! Full-text index over prompt and model fields.
//!
//! `files` holds one row per relative path; `files_fts` mirrors its text
//! columns under the same rowid. Both are rewritten together in one
//! transaction so they never disagree.

use crate::error::{GalleryError, Result};
use crate::services::Metadata;
use crate::storage::connection::open_database;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: String,
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub model: String,
}

/// Text pulled out of one metadata blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptFields {
    pub positive: String,
    pub negative: String,
    pub model: String,
}

impl PromptFields {
    pub fn is_empty(&self) -> bool {
        self.positive.is_empty() && self.negative.is_empty() && self.model.is_empty()
    }
}

pub struct SearchIndex {
    conn: Mutex<Connection>,
}

impl SearchIndex {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = open_database(db_path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!("[SearchIndex] Opened {}", db_path.display());
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| GalleryError::poisoned())
    }

    pub fn index_file(&self, relative_path: &str, metadata: &Metadata, mtime: f64, size: u64) -> Result<()> {
        let fields = extract_prompts(metadata);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO files(path, mtime, size, positive_prompt, negative_prompt, model)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(path) DO UPDATE SET
                mtime = excluded.mtime,
                size = excluded.size,
                positive_prompt = excluded.positive_prompt,
                negative_prompt = excluded.negative_prompt,
                model = excluded.model
            "#,
            params![relative_path, mtime, size as i64, fields.positive, fields.negative, fields.model],
        )?;
        let rowid: i64 = tx.query_row("SELECT rowid FROM files WHERE path = ?1", params![relative_path], |r| r.get(0))?;

        tx.execute("DELETE FROM files_fts WHERE rowid = ?1", params![rowid])?;
        tx.execute(
            "INSERT INTO files_fts(rowid, path, positive_prompt, negative_prompt, model) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![rowid, relative_path, fields.positive, fields.negative, fields.model],
        )?;
        tx.commit()?;

        tracing::debug!("[SearchIndex] Indexed {}", relative_path);
        Ok(())
    }

    pub fn remove(&self, relative_path: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM files_fts WHERE rowid IN (SELECT rowid FROM files WHERE path = ?1)",
            params![relative_path],
        )?;
        tx.execute("DELETE FROM files WHERE path = ?1", params![relative_path])?;
        tx.commit()?;
        Ok(())
    }

    /// Ranked matches. Every whitespace separated word of `query` must match
    /// a term prefix; FTS syntax in the input is neutralized.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let Some(expr) = match_expression(query) else {
            return Ok(Vec::new());
        };
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT f.path, f.positive_prompt, f.negative_prompt, f.model
            FROM files_fts
            JOIN files f ON f.rowid = files_fts.rowid
            WHERE files_fts MATCH ?1
            ORDER BY rank
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![expr, limit as i64], |row| {
            Ok(SearchHit {
                path: row.get(0)?,
                positive_prompt: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                negative_prompt: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                model: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            })
        })?;
        let hits = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(hits)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY,
        mtime REAL NOT NULL,
        size INTEGER NOT NULL,
        positive_prompt TEXT,
        negative_prompt TEXT,
        model TEXT
    );
    CREATE VIRTUAL TABLE IF NOT EXISTS files_fts USING fts5(
        path UNINDEXED,
        positive_prompt,
        negative_prompt,
        model,
        tokenize = 'porter'
    );
"#;

fn match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|word| !word.is_empty())
        .map(|word| format!("\"{}\"*", word))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// JSON "truthiness": null, false, 0, "" and empty containers don't count.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn first_of<'a>(object: &'a Metadata, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|k| object.get(*k)).find(|v| truthy(v))
}

/// Flattens any JSON value to searchable text.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join("\n"),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}: {}", k, stringify(v)))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn stringify_opt(value: Option<&Value>) -> String {
    value.map(stringify).unwrap_or_default()
}

/// Accepts `prompt` as an object with named fields, a list, or a plain
/// string, then falls back to top-level keys for anything still empty.
pub fn extract_prompts(metadata: &Metadata) -> PromptFields {
    let mut fields = PromptFields::default();

    match metadata.get("prompt") {
        Some(Value::Object(prompt)) => {
            fields.positive = stringify_opt(first_of(prompt, &["positive", "Positive", "Prompt"]));
            fields.negative = stringify_opt(first_of(prompt, &["negative", "Negative"]));
            fields.model = stringify_opt(first_of(prompt, &["model", "Model", "ckpt"]));
        }
        Some(list @ Value::Array(_)) => fields.positive = stringify(list),
        Some(Value::String(text)) => fields.positive = text.clone(),
        _ => {}
    }

    if fields.positive.is_empty() {
        fields.positive = stringify_opt(first_of(metadata, &["positive_prompt", "Prompt"]));
    }
    if fields.negative.is_empty() {
        fields.negative = stringify_opt(first_of(metadata, &["negative_prompt", "Negative prompt"]));
    }
    if fields.model.is_empty() {
        fields.model = stringify_opt(first_of(metadata, &["model", "Model"]));
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    fn open_index() -> (tempfile::TempDir, SearchIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = SearchIndex::open(&dir.path().join("search.db")).unwrap();
        (dir, index)
    }

    #[test]
    fn structured_prompt_object() {
        let fields = extract_prompts(&meta(json!({
            "prompt": {"Positive": "a red fox", "negative": ["blurry", "lowres"], "ckpt": "sdxl_base"}
        })));
        assert_eq!(fields.positive, "a red fox");
        assert_eq!(fields.negative, "blurry\nlowres");
        assert_eq!(fields.model, "sdxl_base");
    }

    #[test]
    fn list_and_string_prompts_with_top_level_fallbacks() {
        let listed = extract_prompts(&meta(json!({
            "prompt": ["castle", "at dusk"],
            "Negative prompt": "people",
            "Model": "dreamshaper"
        })));
        assert_eq!(listed.positive, "castle\nat dusk");
        assert_eq!(listed.negative, "people");
        assert_eq!(listed.model, "dreamshaper");

        let plain = extract_prompts(&meta(json!({"prompt": "lighthouse"})));
        assert_eq!(plain.positive, "lighthouse");
        assert!(plain.negative.is_empty());
    }

    #[test]
    fn empty_values_fall_through() {
        let fields = extract_prompts(&meta(json!({
            "prompt": {"positive": "", "Prompt": "from prompt key"},
            "positive_prompt": "unused"
        })));
        assert_eq!(fields.positive, "from prompt key");
        assert!(extract_prompts(&Metadata::new()).is_empty());
    }

    #[test]
    fn nested_objects_are_stringified_as_lines() {
        let value = json!({"seed": 7, "sampler": "euler"});
        let text = stringify(&value);
        assert!(text.contains("seed: 7"));
        assert!(text.contains("sampler: euler"));
    }

    #[test]
    fn reindex_replaces_previous_text() {
        let (_dir, index) = open_index();
        index.index_file("a.png", &meta(json!({"prompt": "a cat"})), 1.0, 10).unwrap();
        index.index_file("a.png", &meta(json!({"prompt": "a dog"})), 2.0, 11).unwrap();

        assert_eq!(index.count().unwrap(), 1);
        assert!(index.search("cat", 10).unwrap().is_empty());
        let hits = index.search("dog", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "a.png");
        assert_eq!(hits[0].positive_prompt, "a dog");
    }

    #[test]
    fn remove_drops_both_tables() {
        let (_dir, index) = open_index();
        index.index_file("b.png", &meta(json!({"prompt": "sunset"})), 1.0, 1).unwrap();
        index.remove("b.png").unwrap();
        assert_eq!(index.count().unwrap(), 0);
        assert!(index.search("sunset", 10).unwrap().is_empty());
    }

    #[test]
    fn queries_are_prefix_matched_and_sanitized() {
        let (_dir, index) = open_index();
        index.index_file("c.png", &meta(json!({"prompt": "mountains", "model": "juggernaut"})), 1.0, 1).unwrap();

        assert_eq!(index.search("mount", 10).unwrap().len(), 1);
        assert_eq!(index.search("jugg\" OR", 10).unwrap().len(), 0);
        assert_eq!(index.search("juggernaut", 10).unwrap().len(), 1);
        assert!(index.search("   ", 10).unwrap().is_empty());
    }

    #[test]
    fn limit_caps_results() {
        let (_dir, index) = open_index();
        for i in 0..5 {
            index.index_file(&format!("{}.png", i), &meta(json!({"prompt": "forest"})), 1.0, 1).unwrap();
        }
        assert_eq!(index.search("forest", 3).unwrap().len(), 3);
    }
}
