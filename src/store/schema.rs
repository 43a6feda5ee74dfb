//! Versioned SQLite schemas.
//!
//! Each schema is an ordered list of migrations. The index of the last
//! applied migration is kept in `PRAGMA user_version`, so a structural upgrade
//! is a new entry at the end of the list.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;

/// Durable store: cached conversations and the pending-action queue.
pub const STORE_MIGRATIONS: &[&str] = &[r#"
-- Conversations keyed by thread id
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    thread BLOB NOT NULL,
    last_modified INTEGER NOT NULL,
    sync_status TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_last_modified ON conversations(last_modified);
CREATE INDEX IF NOT EXISTS idx_conversations_sync_status ON conversations(sync_status);

-- Pending actions keyed by action id, replayed in timestamp order
CREATE TABLE IF NOT EXISTS queue (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    payload BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    user_id TEXT,
    thread_id TEXT,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    last_attempt INTEGER,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_queue_timestamp ON queue(timestamp);
CREATE INDEX IF NOT EXISTS idx_queue_status ON queue(status);
CREATE INDEX IF NOT EXISTS idx_queue_type ON queue(type);
"#];

/// HTTP response cache shared by the page and the interceptor.
pub const HTTP_CACHE_MIGRATIONS: &[&str] = &[r#"
CREATE TABLE IF NOT EXISTS http_cache (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    response_type TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    captured_at INTEGER NOT NULL,
    UNIQUE (cache_name, request_key)
);

CREATE INDEX IF NOT EXISTS idx_http_cache_name ON http_cache(cache_name, seq);
"#];

/// Bring `conn` up to the latest version of `migrations`.
pub fn migrate(conn: &Connection, migrations: &[&str]) -> Result<()> {
  let current: usize = conn
    .query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))? as usize;

  for (index, sql) in migrations.iter().enumerate().skip(current) {
    conn
      .execute_batch(sql)
      .map_err(|e| eyre!("Failed to apply migration {}: {}", index + 1, e))?;
    conn
      .pragma_update(None, "user_version", (index + 1) as i64)
      .map_err(|e| eyre!("Failed to record schema version {}: {}", index + 1, e))?;
    tracing::debug!(version = index + 1, "applied schema migration");
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn version(conn: &Connection) -> i64 {
    conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .unwrap()
  }

  #[test]
  fn test_migrate_sets_version() {
    let conn = Connection::open_in_memory().unwrap();
    migrate(&conn, STORE_MIGRATIONS).unwrap();
    assert_eq!(version(&conn), STORE_MIGRATIONS.len() as i64);
  }

  #[test]
  fn test_migrate_is_idempotent_and_applies_new_steps() {
    let conn = Connection::open_in_memory().unwrap();
    migrate(&conn, STORE_MIGRATIONS).unwrap();
    migrate(&conn, STORE_MIGRATIONS).unwrap();

    let upgraded = [STORE_MIGRATIONS[0], "ALTER TABLE queue ADD COLUMN note TEXT;"];
    migrate(&conn, &upgraded).unwrap();
    assert_eq!(version(&conn), 2);
    conn
      .execute("UPDATE queue SET note = 'x' WHERE 0", [])
      .unwrap();
  }
}
