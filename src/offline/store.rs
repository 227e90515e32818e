//! Durable storage for the replay queue.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::error;

use super::operation::PendingOperation;
use crate::db::{schema::QUEUE_SCHEMA, Database};

/// Key holding the serialized queue.
pub const QUEUE_KEY: &str = "offline_queue";

/// Durable home of the pending operation queue.
///
/// `save` is called on every mutation and must not return before the data
/// is durable.
pub trait QueueStore: Send + Sync {
  fn load(&self) -> Result<Vec<PendingOperation>>;

  fn save(&self, queue: &[PendingOperation]) -> Result<()>;
}

/// Decode a stored queue. Corrupt contents yield an empty queue.
fn decode(raw: &str) -> Vec<PendingOperation> {
  match serde_json::from_str(raw) {
    Ok(queue) => queue,
    Err(e) => {
      error!(error = %e, "stored offline queue is corrupt, starting empty");
      Vec::new()
    }
  }
}

fn encode(queue: &[PendingOperation]) -> Result<String> {
  serde_json::to_string(queue).map_err(|e| eyre!("Failed to serialize offline queue: {}", e))
}

/// Key-value table in SQLite, the JSON array stored under [`QUEUE_KEY`].
pub struct SqliteQueueStore {
  conn: Mutex<Connection>,
}

impl SqliteQueueStore {
  pub fn open_at(path: &Path) -> Result<Self> {
    let db = Database::open(path, QUEUE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(db.into_connection()),
    })
  }

  /// Write a raw value, bypassing serialization.
  #[cfg(test)]
  pub fn put_raw(&self, value: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value) VALUES (?, ?)",
        params![QUEUE_KEY, value],
      )
      .map_err(|e| eyre!("Failed to write raw value: {}", e))?;
    Ok(())
  }
}

impl QueueStore for SqliteQueueStore {
  fn load(&self) -> Result<Vec<PendingOperation>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let raw: Option<String> = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![QUEUE_KEY],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read offline queue: {}", e))?;

    Ok(raw.as_deref().map(decode).unwrap_or_default())
  }

  fn save(&self, queue: &[PendingOperation]) -> Result<()> {
    let value = encode(queue)?;
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![QUEUE_KEY, value],
      )
      .map_err(|e| eyre!("Failed to persist offline queue: {}", e))?;

    Ok(())
  }
}

/// In-memory store. Clones share contents, so a "reload" is a new manager
/// built over a clone of the same store.
#[derive(Clone, Default)]
pub struct MemoryQueueStore {
  raw: Arc<Mutex<Option<String>>>,
}

impl MemoryQueueStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Overwrite the stored text, e.g. to simulate corruption.
  #[cfg(test)]
  pub fn put_raw(&self, value: &str) {
    if let Ok(mut raw) = self.raw.lock() {
      *raw = Some(value.to_string());
    }
  }
}

impl QueueStore for MemoryQueueStore {
  fn load(&self) -> Result<Vec<PendingOperation>> {
    let raw = self.raw.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(raw.as_deref().map(decode).unwrap_or_default())
  }

  fn save(&self, queue: &[PendingOperation]) -> Result<()> {
    let value = encode(queue)?;
    let mut raw = self.raw.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *raw = Some(value);
    Ok(())
  }
}
