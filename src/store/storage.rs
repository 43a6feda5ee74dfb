//! Durable store trait and its SQLite and no-op implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::schema::{migrate, STORE_MIGRATIONS};
use super::StorageEstimate;
use crate::model::{
  ActionKind, ActionStatus, CachedConversation, QueuedAction, SyncState, Thread,
};

/// Persistence backend for conversations and queued actions.
///
/// Lookups of missing records return `Ok(None)` or succeed silently; errors
/// are reserved for the storage engine itself misbehaving.
#[async_trait]
pub trait DurableStore: Send + Sync {
  /// Insert or replace a conversation. `last_modified` never moves backwards.
  async fn put_conversation(&self, conversation: &CachedConversation) -> Result<()>;

  async fn get_conversation(&self, id: &str) -> Result<Option<CachedConversation>>;

  /// All conversations, most recently modified first.
  async fn all_conversations(&self) -> Result<Vec<CachedConversation>>;

  async fn delete_conversation(&self, id: &str) -> Result<()>;

  async fn count_conversations(&self, state: SyncState) -> Result<usize>;

  async fn put_action(&self, action: &QueuedAction) -> Result<()>;

  /// All queued actions ordered by timestamp, ties broken by insertion order.
  async fn actions(&self) -> Result<Vec<QueuedAction>>;

  /// Overwrite an existing action. Updating a deleted action is a no-op.
  async fn update_action(&self, action: &QueuedAction) -> Result<()>;

  async fn delete_action(&self, id: &str) -> Result<()>;

  /// Point every queued action for `from` at `to`. Returns how many moved.
  async fn retarget_actions(&self, from: &str, to: &str) -> Result<usize>;

  async fn estimate(&self) -> Result<StorageEstimate>;
}

/// Storage implementation that doesn't persist anything.
/// Used when the database cannot be opened - all operations are no-ops.
pub struct NoopStore;

#[async_trait]
impl DurableStore for NoopStore {
  async fn put_conversation(&self, _conversation: &CachedConversation) -> Result<()> {
    Ok(()) // Discard
  }

  async fn get_conversation(&self, _id: &str) -> Result<Option<CachedConversation>> {
    Ok(None) // Always miss
  }

  async fn all_conversations(&self) -> Result<Vec<CachedConversation>> {
    Ok(Vec::new())
  }

  async fn delete_conversation(&self, _id: &str) -> Result<()> {
    Ok(())
  }

  async fn count_conversations(&self, _state: SyncState) -> Result<usize> {
    Ok(0)
  }

  async fn put_action(&self, _action: &QueuedAction) -> Result<()> {
    Ok(()) // Discard
  }

  async fn actions(&self) -> Result<Vec<QueuedAction>> {
    Ok(Vec::new())
  }

  async fn update_action(&self, _action: &QueuedAction) -> Result<()> {
    Ok(())
  }

  async fn delete_action(&self, _id: &str) -> Result<()> {
    Ok(())
  }

  async fn retarget_actions(&self, _from: &str, _to: &str) -> Result<usize> {
    Ok(0)
  }

  async fn estimate(&self) -> Result<StorageEstimate> {
    Ok(StorageEstimate::default())
  }
}

/// SQLite-based durable store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  quota_bytes: u64,
}

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path, quota_bytes: u64) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::with_connection(conn, quota_bytes)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory(quota_bytes: u64) -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::with_connection(conn, quota_bytes)
  }

  fn with_connection(conn: Connection, quota_bytes: u64) -> Result<Self> {
    migrate(&conn, STORE_MIGRATIONS)?;
    Ok(Self {
      conn: Mutex::new(conn),
      quota_bytes,
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

const CONVERSATION_COLUMNS: &str = "id, thread, last_modified, sync_status";
const ACTION_COLUMNS: &str = "id, type, payload, timestamp, user_id, thread_id, status, \
   retry_count, max_retries, last_attempt, error";

#[async_trait]
impl DurableStore for SqliteStore {
  async fn put_conversation(&self, conversation: &CachedConversation) -> Result<()> {
    let conn = self.lock()?;
    let thread = serde_json::to_vec(&conversation.thread)
      .map_err(|e| eyre!("Failed to serialize thread: {}", e))?;

    conn
      .execute(
        "INSERT INTO conversations (id, thread, last_modified, sync_status)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
           thread = excluded.thread,
           sync_status = excluded.sync_status,
           last_modified = MAX(conversations.last_modified, excluded.last_modified)",
        params![
          conversation.id,
          thread,
          conversation.last_modified.timestamp_millis(),
          conversation.sync_state.as_str()
        ],
      )
      .map_err(|e| eyre!("Failed to store conversation {}: {}", conversation.id, e))?;

    Ok(())
  }

  async fn get_conversation(&self, id: &str) -> Result<Option<CachedConversation>> {
    let conn = self.lock()?;
    let sql = format!("SELECT {} FROM conversations WHERE id = ?", CONVERSATION_COLUMNS);

    let raw = conn
      .query_row(&sql, params![id], RawConversation::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to load conversation {}: {}", id, e))?;

    raw.map(RawConversation::decode).transpose()
  }

  async fn all_conversations(&self) -> Result<Vec<CachedConversation>> {
    let conn = self.lock()?;
    let sql = format!(
      "SELECT {} FROM conversations ORDER BY last_modified DESC",
      CONVERSATION_COLUMNS
    );
    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let conversations = stmt
      .query_map([], RawConversation::from_row)
      .map_err(|e| eyre!("Failed to query conversations: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(|raw| match raw.decode() {
        Ok(c) => Some(c),
        Err(e) => {
          tracing::warn!("Skipping unreadable conversation: {}", e);
          None
        }
      })
      .collect();

    Ok(conversations)
  }

  async fn delete_conversation(&self, id: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM conversations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete conversation {}: {}", id, e))?;
    Ok(())
  }

  async fn count_conversations(&self, state: SyncState) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM conversations WHERE sync_status = ?",
        params![state.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count conversations: {}", e))?;
    Ok(count as usize)
  }

  async fn put_action(&self, action: &QueuedAction) -> Result<()> {
    let conn = self.lock()?;
    let payload =
      serde_json::to_vec(&action.kind).map_err(|e| eyre!("Failed to serialize action: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO queue
           (id, type, payload, timestamp, user_id, thread_id, status,
            retry_count, max_retries, last_attempt, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
          action.id,
          action.kind.name(),
          payload,
          action.timestamp.timestamp_millis(),
          action.user_id,
          action.thread_id,
          action.status.as_str(),
          action.retry_count,
          action.max_retries,
          action.last_attempt.map(|t| t.timestamp_millis()),
          action.error,
        ],
      )
      .map_err(|e| eyre!("Failed to store action {}: {}", action.id, e))?;

    Ok(())
  }

  async fn actions(&self) -> Result<Vec<QueuedAction>> {
    let conn = self.lock()?;
    let sql = format!(
      "SELECT {} FROM queue ORDER BY timestamp ASC, rowid ASC",
      ACTION_COLUMNS
    );
    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let actions = stmt
      .query_map([], RawAction::from_row)
      .map_err(|e| eyre!("Failed to query actions: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(|raw| match raw.decode() {
        Ok(a) => Some(a),
        Err(e) => {
          tracing::warn!("Skipping unreadable queue item: {}", e);
          None
        }
      })
      .collect();

    Ok(actions)
  }

  async fn update_action(&self, action: &QueuedAction) -> Result<()> {
    let conn = self.lock()?;
    let payload =
      serde_json::to_vec(&action.kind).map_err(|e| eyre!("Failed to serialize action: {}", e))?;

    conn
      .execute(
        "UPDATE queue SET
           type = ?2, payload = ?3, timestamp = ?4, user_id = ?5, thread_id = ?6,
           status = ?7, retry_count = ?8, max_retries = ?9, last_attempt = ?10, error = ?11
         WHERE id = ?1",
        params![
          action.id,
          action.kind.name(),
          payload,
          action.timestamp.timestamp_millis(),
          action.user_id,
          action.thread_id,
          action.status.as_str(),
          action.retry_count,
          action.max_retries,
          action.last_attempt.map(|t| t.timestamp_millis()),
          action.error,
        ],
      )
      .map_err(|e| eyre!("Failed to update action {}: {}", action.id, e))?;

    Ok(())
  }

  async fn delete_action(&self, id: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete action {}: {}", id, e))?;
    Ok(())
  }

  async fn retarget_actions(&self, from: &str, to: &str) -> Result<usize> {
    let conn = self.lock()?;
    let moved = conn
      .execute(
        "UPDATE queue SET thread_id = ?2 WHERE thread_id = ?1",
        params![from, to],
      )
      .map_err(|e| eyre!("Failed to retarget actions from {}: {}", from, e))?;
    Ok(moved)
  }

  async fn estimate(&self) -> Result<StorageEstimate> {
    let conn = self.lock()?;
    let page_count: i64 = conn
      .query_row("PRAGMA page_count", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read page count: {}", e))?;
    let page_size: i64 = conn
      .query_row("PRAGMA page_size", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read page size: {}", e))?;

    Ok(StorageEstimate {
      usage: (page_count * page_size).max(0) as u64,
      quota: self.quota_bytes,
    })
  }
}

// ============================================================================
// Row decoding
// ============================================================================

struct RawConversation {
  id: String,
  thread: Vec<u8>,
  last_modified: i64,
  sync_status: String,
}

impl RawConversation {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      thread: row.get(1)?,
      last_modified: row.get(2)?,
      sync_status: row.get(3)?,
    })
  }

  fn decode(self) -> Result<CachedConversation> {
    let thread: Thread = serde_json::from_slice(&self.thread)
      .map_err(|e| eyre!("Failed to deserialize thread {}: {}", self.id, e))?;
    let sync_state = SyncState::parse(&self.sync_status)
      .ok_or_else(|| eyre!("Unknown sync status '{}'", self.sync_status))?;

    Ok(CachedConversation {
      id: self.id,
      thread,
      last_modified: millis_to_datetime(self.last_modified)?,
      sync_state,
    })
  }
}

struct RawAction {
  id: String,
  payload: Vec<u8>,
  timestamp: i64,
  user_id: Option<String>,
  thread_id: Option<String>,
  status: String,
  retry_count: u32,
  max_retries: u32,
  last_attempt: Option<i64>,
  error: Option<String>,
}

impl RawAction {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      payload: row.get(2)?,
      timestamp: row.get(3)?,
      user_id: row.get(4)?,
      thread_id: row.get(5)?,
      status: row.get(6)?,
      retry_count: row.get(7)?,
      max_retries: row.get(8)?,
      last_attempt: row.get(9)?,
      error: row.get(10)?,
    })
  }

  fn decode(self) -> Result<QueuedAction> {
    let kind: ActionKind = serde_json::from_slice(&self.payload)
      .map_err(|e| eyre!("Failed to deserialize action {}: {}", self.id, e))?;
    let status = ActionStatus::parse(&self.status)
      .ok_or_else(|| eyre!("Unknown action status '{}'", self.status))?;

    Ok(QueuedAction {
      id: self.id,
      kind,
      timestamp: millis_to_datetime(self.timestamp)?,
      user_id: self.user_id,
      thread_id: self.thread_id,
      status,
      retry_count: self.retry_count,
      max_retries: self.max_retries,
      last_attempt: self.last_attempt.map(millis_to_datetime).transpose()?,
      error: self.error,
    })
  }
}

pub(crate) fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms).ok_or_else(|| eyre!("Timestamp out of range: {}", ms))
}
