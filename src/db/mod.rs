pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// SQLite connection wrapper shared by the cache partitions and the replay queue
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create a database file and apply the given schema
  pub fn open(path: &Path, schema: &str) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let db = Self { conn };
    db.run_migrations(schema)?;

    Ok(db)
  }

  /// Resolve the directory holding durable files.
  ///
  /// An explicit override wins; otherwise `$XDG_DATA_HOME/lifeline`.
  pub fn data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
      return Ok(dir.to_path_buf());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("lifeline"))
  }

  /// Run database migrations
  fn run_migrations(&self, schema: &str) -> Result<()> {
    self
      .conn
      .execute_batch(schema)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Hand the connection over to its owner
  pub fn into_connection(self) -> Connection {
    self.conn
  }
}
