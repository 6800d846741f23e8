//! SQLite implementation of the persistent store.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{sequence_key, PersistentStore};
use crate::error::{Result, SyncError};

/// Schema for store tables.
const STORE_SCHEMA: &str = r#"
-- Opaque records grouped by namespace
CREATE TABLE IF NOT EXISTS store_entries (
    namespace TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (namespace, entry_key)
);

-- Next sequence number per namespace (survives clear)
CREATE TABLE IF NOT EXISTS store_sequences (
    namespace TEXT PRIMARY KEY,
    next_seq INTEGER NOT NULL
);
"#;

/// SQLite-based store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (or create) the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| SyncError::storage(format!("failed to create store directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::storage(format!("failed to open store at {}: {}", path.display(), e))
    })?;

    Self::from_connection(conn)
  }

  /// Volatile store, mostly for tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Default store path under the user data directory.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::storage("could not determine data directory"))?;

    Ok(data_dir.join("troopsync").join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| SyncError::storage(format!("failed to run store migrations: {}", e)))?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::storage(format!("lock poisoned: {}", e)))
  }
}

impl PersistentStore for SqliteStore {
  fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO store_entries (namespace, entry_key, data) VALUES (?, ?, ?)",
      params![namespace, key, value],
    )?;
    Ok(())
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self.lock()?;
    let data = conn
      .query_row(
        "SELECT data FROM store_entries WHERE namespace = ? AND entry_key = ?",
        params![namespace, key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(data)
  }

  fn get_all(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT entry_key, data FROM store_entries
       WHERE namespace = ?
       ORDER BY entry_key",
    )?;

    let rows = stmt
      .query_map(params![namespace], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<rusqlite::Result<Vec<(String, Vec<u8>)>>>()?;

    Ok(rows)
  }

  fn delete(&self, namespace: &str, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM store_entries WHERE namespace = ? AND entry_key = ?",
      params![namespace, key],
    )?;
    Ok(())
  }

  fn clear(&self, namespace: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM store_entries WHERE namespace = ?",
      params![namespace],
    )?;
    Ok(())
  }

  fn append(&self, namespace: &str, value: &[u8]) -> Result<u64> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let seq: i64 = tx
      .query_row(
        "SELECT next_seq FROM store_sequences WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
      )
      .optional()?
      .unwrap_or(1);

    tx.execute(
      "INSERT OR REPLACE INTO store_sequences (namespace, next_seq) VALUES (?, ?)",
      params![namespace, seq + 1],
    )?;
    tx.execute(
      "INSERT INTO store_entries (namespace, entry_key, data) VALUES (?, ?, ?)",
      params![namespace, sequence_key(seq as u64), value],
    )?;
    tx.commit()?;

    Ok(seq as u64)
  }
}
