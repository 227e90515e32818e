/// Schema for cache partitions.
pub const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, url)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_url ON cache_entries(url);
"#;

/// Schema for the durable key-value store backing the replay queue.
pub const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
