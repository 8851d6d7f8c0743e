//! Database connection management
//!
//! Both stores (metadata cache and search index) open their own connection
//! through here so they share the same pragmas.

use crate::error::{GalleryError, Result};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Opens (creating if needed) a SQLite database in WAL mode.
pub fn open_database(db_path: &Path) -> Result<Connection> {
    let db_dir = db_path
        .parent()
        .ok_or_else(|| GalleryError::InvalidPath("Invalid database path".into()))?;
    std::fs::create_dir_all(db_dir)?;

    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    // WAL lets readers proceed while the workers write
    conn.pragma_update(None, "journal_mode", WAL)?;
    conn.pragma_update(None, "synchronous", NORMAL)?;
    conn.pragma_update(None, "temp_store", MEMORY)?;

    tracing::debug!("[Storage] Opened database {}", db_path.display());
    Ok(conn)
}

/// In-memory database with the same pragmas. Used by tests.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "temp_store", MEMORY)?;
    Ok(conn)
}

// SQL pragma constants
const WAL: &str = "WAL";
const NORMAL: &str = "NORMAL";
const MEMORY: &str = "MEMORY";
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
