//! Partition storage backends: SQLite (persistent) and in-memory.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheKey, CacheStorage, CachedEntry, Registration, Registry};
use crate::http::Response;

/// SQLite-based partition storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-cache").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for partition tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named partitions, rowid gives creation order
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, one row per (partition, request)
CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, key_hash),
    FOREIGN KEY (partition) REFERENCES partitions(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(key_hash);

-- Host registration: slot is 'active' or 'waiting'
CREATE TABLE IF NOT EXISTS registration (
    slot TEXT PRIMARY KEY,
    version TEXT NOT NULL
);
"#;

type EntryRow = (u16, String, String, Vec<u8>);

fn row_to_response(row: EntryRow) -> Result<Response> {
  let (status, status_text, headers, body) = row;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

  Ok(Response {
    status,
    status_text,
    headers,
    body: Bytes::from(body),
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, partition: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;
    Ok(())
  }

  fn match_in(&self, partition: &str, key: &CacheKey) -> Result<Option<Response>> {
    let conn = self.lock()?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT status, status_text, headers, body FROM entries
         WHERE partition = ? AND key_hash = ?",
        params![partition, key.digest()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", key, partition, e))?;

    row.map(row_to_response).transpose()
  }

  fn match_any(&self, key: &CacheKey) -> Result<Option<Response>> {
    let conn = self.lock()?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT e.status, e.status_text, e.headers, e.body FROM entries e
         INNER JOIN partitions p ON p.name = e.partition
         WHERE e.key_hash = ?
         ORDER BY p.rowid
         LIMIT 1",
        params![key.digest()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    row.map(row_to_response).transpose()
  }

  fn put(&self, partition: &str, key: &CacheKey, response: &Response) -> Result<()> {
    let mut conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO entries
         (partition, key_hash, request_key, status, status_text, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        partition,
        key.digest(),
        key.as_str(),
        response.status,
        response.status_text,
        headers,
        response.body.as_ref(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", key, partition, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, partition: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", partition, e))?;

    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn entries(&self, partition: &str) -> Result<Vec<CachedEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT request_key, status, length(body), cached_at FROM entries
         WHERE partition = ?
         ORDER BY request_key",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![partition], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, u16>(1)?,
          row.get::<_, i64>(2)?,
          row.get::<_, String>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(key, status, size, cached_at)| {
        Ok(CachedEntry {
          key,
          status,
          size: usize::try_from(size).unwrap_or_default(),
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .collect()
  }
}

impl Registry for SqliteStorage {
  fn load_registration(&self) -> Result<Registration> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT slot, version FROM registration")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
      .map_err(|e| eyre!("Failed to load registration: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read registration: {}", e))?;

    let mut registration = Registration::default();
    for (slot, version) in rows {
      match slot.as_str() {
        "active" => registration.active = Some(version),
        "waiting" => registration.waiting = Some(version),
        other => tracing::warn!("Ignoring unknown registration slot '{}'", other),
      }
    }

    Ok(registration)
  }

  fn store_registration(&self, registration: &Registration) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM registration", [])
      .map_err(|e| eyre!("Failed to clear registration: {}", e))?;

    for (slot, version) in [
      ("active", &registration.active),
      ("waiting", &registration.waiting),
    ] {
      if let Some(version) = version {
        tx.execute(
          "INSERT INTO registration (slot, version) VALUES (?, ?)",
          params![slot, version],
        )
        .map_err(|e| eyre!("Failed to store registration: {}", e))?;
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

struct MemoryEntry {
  key: String,
  response: Response,
  cached_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
  /// Partitions in creation order
  partitions: Vec<(String, Vec<MemoryEntry>)>,
  registration: Registration,
}

impl MemoryState {
  fn partition(&self, name: &str) -> Option<&Vec<MemoryEntry>> {
    self
      .partitions
      .iter()
      .find(|(n, _)| n == name)
      .map(|(_, entries)| entries)
  }

  fn partition_mut(&mut self, name: &str) -> &mut Vec<MemoryEntry> {
    let index = match self.partitions.iter().position(|(n, _)| n == name) {
      Some(index) => index,
      None => {
        self.partitions.push((name.to_string(), Vec::new()));
        self.partitions.len() - 1
      }
    };
    &mut self.partitions[index].1
  }
}

/// Partition storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
  state: Mutex<MemoryState>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
    self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, partition: &str) -> Result<()> {
    self.lock()?.partition_mut(partition);
    Ok(())
  }

  fn match_in(&self, partition: &str, key: &CacheKey) -> Result<Option<Response>> {
    let state = self.lock()?;
    Ok(
      state
        .partition(partition)
        .and_then(|entries| entries.iter().find(|e| e.key == key.as_str()))
        .map(|e| e.response.clone()),
    )
  }

  fn match_any(&self, key: &CacheKey) -> Result<Option<Response>> {
    let state = self.lock()?;
    Ok(
      state
        .partitions
        .iter()
        .flat_map(|(_, entries)| entries.iter())
        .find(|e| e.key == key.as_str())
        .map(|e| e.response.clone()),
    )
  }

  fn put(&self, partition: &str, key: &CacheKey, response: &Response) -> Result<()> {
    let mut state = self.lock()?;
    let entries = state.partition_mut(partition);
    let entry = MemoryEntry {
      key: key.as_str().to_string(),
      response: response.clone(),
      cached_at: Utc::now(),
    };

    match entries.iter_mut().find(|e| e.key == entry.key) {
      Some(existing) => *existing = entry,
      None => entries.push(entry),
    }
    Ok(())
  }

  fn delete(&self, partition: &str) -> Result<bool> {
    let mut state = self.lock()?;
    let before = state.partitions.len();
    state.partitions.retain(|(n, _)| n != partition);
    Ok(state.partitions.len() != before)
  }

  fn keys(&self) -> Result<Vec<String>> {
    let state = self.lock()?;
    Ok(state.partitions.iter().map(|(n, _)| n.clone()).collect())
  }

  fn entries(&self, partition: &str) -> Result<Vec<CachedEntry>> {
    let state = self.lock()?;
    let mut entries: Vec<CachedEntry> = state
      .partition(partition)
      .map(|entries| {
        entries
          .iter()
          .map(|e| CachedEntry {
            key: e.key.clone(),
            status: e.response.status,
            size: e.response.body.len(),
            cached_at: e.cached_at,
          })
          .collect()
      })
      .unwrap_or_default();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(entries)
  }
}

impl Registry for MemoryStorage {
  fn load_registration(&self) -> Result<Registration> {
    Ok(self.lock()?.registration.clone())
  }

  fn store_registration(&self, registration: &Registration) -> Result<()> {
    self.lock()?.registration = registration.clone();
    Ok(())
  }
}
