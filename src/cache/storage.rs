//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use super::traits::CachedEntry;
use crate::db::{schema::CACHE_SCHEMA, Database};
use crate::http::Response;

/// Trait for cache storage backends.
///
/// A backend holds any number of named partitions, each mapping a request
/// key (the full URL) to a stored response.
pub trait CacheStorage: Send + Sync {
  /// Create the partition if it doesn't exist yet.
  fn open(&self, cache: &str) -> Result<()>;

  /// Look up a request key in one partition.
  fn match_entry(&self, cache: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Look up a request key across every partition.
  fn match_any(&self, key: &str) -> Result<Option<CachedEntry>>;

  /// Store (or replace) a response. Opens the partition implicitly.
  fn put(&self, cache: &str, key: &str, response: &Response) -> Result<()>;

  /// Request keys stored in a partition.
  fn keys(&self, cache: &str) -> Result<Vec<String>>;

  /// Names of all existing partitions.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Remove a partition and its entries. Returns whether it existed.
  fn delete_cache(&self, cache: &str) -> Result<bool>;
}

/// Storage that lives only as long as the process.
/// Used when persistence is disabled.
#[derive(Default)]
pub struct MemoryStorage {
  partitions: Mutex<BTreeMap<String, BTreeMap<String, CachedEntry>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

fn lock_err<T>(e: std::sync::PoisonError<T>) -> color_eyre::Report {
  eyre!("Lock poisoned: {}", e)
}

impl CacheStorage for MemoryStorage {
  fn open(&self, cache: &str) -> Result<()> {
    let mut partitions = self.partitions.lock().map_err(lock_err)?;
    partitions.entry(cache.to_string()).or_default();
    Ok(())
  }

  fn match_entry(&self, cache: &str, key: &str) -> Result<Option<CachedEntry>> {
    let partitions = self.partitions.lock().map_err(lock_err)?;
    Ok(partitions.get(cache).and_then(|p| p.get(key)).cloned())
  }

  fn match_any(&self, key: &str) -> Result<Option<CachedEntry>> {
    let partitions = self.partitions.lock().map_err(lock_err)?;
    Ok(partitions.values().find_map(|p| p.get(key)).cloned())
  }

  fn put(&self, cache: &str, key: &str, response: &Response) -> Result<()> {
    let mut partitions = self.partitions.lock().map_err(lock_err)?;
    partitions.entry(cache.to_string()).or_default().insert(
      key.to_string(),
      CachedEntry {
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn keys(&self, cache: &str) -> Result<Vec<String>> {
    let partitions = self.partitions.lock().map_err(lock_err)?;
    Ok(
      partitions
        .get(cache)
        .map(|p| p.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let partitions = self.partitions.lock().map_err(lock_err)?;
    Ok(partitions.keys().cloned().collect())
  }

  fn delete_cache(&self, cache: &str) -> Result<bool> {
    let mut partitions = self.partitions.lock().map_err(lock_err)?;
    Ok(partitions.remove(cache).is_some())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    let db = Database::open(path, CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(db.into_connection()),
    })
  }

  fn row_to_entry(
    status: u16,
    headers: String,
    body: Vec<u8>,
    cached_at: String,
  ) -> Result<CachedEntry> {
    let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

    Ok(CachedEntry {
      response: Response {
        status,
        headers,
        body,
      },
      cached_at: parse_datetime(&cached_at)?,
    })
  }
}

type EntryRow = (u16, String, Vec<u8>, String);

impl CacheStorage for SqliteStorage {
  fn open(&self, cache: &str) -> Result<()> {
    let conn = self.conn.lock().map_err(lock_err)?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
        params![cache],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", cache, e))?;
    Ok(())
  }

  fn match_entry(&self, cache: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.conn.lock().map_err(lock_err)?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND url = ?",
        params![cache, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache {}: {}", cache, e))?;

    row
      .map(|(status, headers, body, cached_at)| {
        Self::row_to_entry(status, headers, body, cached_at)
      })
      .transpose()
  }

  fn match_any(&self, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.conn.lock().map_err(lock_err)?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE url = ?
         ORDER BY cache_name
         LIMIT 1",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query caches: {}", e))?;

    row
      .map(|(status, headers, body, cached_at)| {
        Self::row_to_entry(status, headers, body, cached_at)
      })
      .transpose()
  }

  fn put(&self, cache: &str, key: &str, response: &Response) -> Result<()> {
    let conn = self.conn.lock().map_err(lock_err)?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
        params![cache],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", cache, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (cache_name, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![cache, key, response.status, headers, response.body],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", key, cache, e))?;

    Ok(())
  }

  fn keys(&self, cache: &str) -> Result<Vec<String>> {
    let conn = self.conn.lock().map_err(lock_err)?;

    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE cache_name = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![cache], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", cache, e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.conn.lock().map_err(lock_err)?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_cache(&self, cache: &str) -> Result<bool> {
    let mut conn = self.conn.lock().map_err(lock_err)?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE cache_name = ?", params![cache])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", cache, e))?;

    let removed = tx
      .execute("DELETE FROM cache_partitions WHERE name = ?", params![cache])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
