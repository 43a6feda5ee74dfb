//! Domain types shared by the durable store and the sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  User,
  Assistant,
  System,
}

/// A single message inside a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
  pub id: String,
  pub role: Role,
  pub content: String,
  pub created_at: DateTime<Utc>,
}

impl Message {
  /// Create a message with a fresh id.
  pub fn new(role: Role, content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      role,
      content: content.into(),
      created_at,
    }
  }
}

/// Snapshot of a chat thread as the remote store returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
  pub id: String,
  pub title: String,
  #[serde(default)]
  pub messages: Vec<Message>,
  #[serde(default)]
  pub project_id: Option<String>,
  #[serde(default)]
  pub page_type: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Thread {
  /// Build a local thread for an offline `create_thread`, before the server assigns anything.
  pub fn local(id: impl Into<String>, draft: &NewThread, now: DateTime<Utc>) -> Self {
    Self {
      id: id.into(),
      title: draft.title.clone(),
      messages: draft.initial_message.iter().cloned().collect(),
      project_id: draft.project_id.clone(),
      page_type: draft.page_type.clone(),
      created_at: now,
      updated_at: now,
    }
  }

  /// Apply a metadata patch in place.
  pub fn apply_patch(&mut self, patch: &ThreadPatch) {
    if let Some(title) = &patch.title {
      self.title = title.clone();
    }
    if let Some(project_id) = &patch.project_id {
      self.project_id = Some(project_id.clone());
    }
  }
}

/// Arguments for creating a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewThread {
  pub title: String,
  #[serde(default)]
  pub project_id: Option<String>,
  #[serde(default)]
  pub page_type: Option<String>,
  #[serde(default)]
  pub initial_message: Option<Message>,
}

impl NewThread {
  pub fn titled(title: impl Into<String>) -> Self {
    Self {
      title: title.into(),
      project_id: None,
      page_type: None,
      initial_message: None,
    }
  }
}

/// Partial thread metadata update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPatch {
  #[serde(default)]
  pub title: Option<String>,
  #[serde(default)]
  pub project_id: Option<String>,
}

// ============================================================================
// Cached conversations
// ============================================================================

/// Whether a cached conversation matches the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
  Synced,
  Pending,
  Conflict,
}

impl SyncState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Synced => "synced",
      Self::Pending => "pending",
      Self::Conflict => "conflict",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "synced" => Some(Self::Synced),
      "pending" => Some(Self::Pending),
      "conflict" => Some(Self::Conflict),
      _ => None,
    }
  }
}

/// Local copy of a thread, one per thread id.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedConversation {
  pub id: String,
  pub thread: Thread,
  pub last_modified: DateTime<Utc>,
  pub sync_state: SyncState,
}

impl CachedConversation {
  pub fn new(thread: Thread, last_modified: DateTime<Utc>, sync_state: SyncState) -> Self {
    Self {
      id: thread.id.clone(),
      thread,
      last_modified,
      sync_state,
    }
  }
}

// ============================================================================
// Queued actions
// ============================================================================

/// Lifecycle of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
  Pending,
  Syncing,
  Completed,
  Failed,
}

impl ActionStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Syncing => "syncing",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(Self::Pending),
      "syncing" => Some(Self::Syncing),
      "completed" => Some(Self::Completed),
      "failed" => Some(Self::Failed),
      _ => None,
    }
  }
}

/// A side-effecting operation waiting to be replayed against the remote store.
///
/// Every variant is replayed by exactly one remote call; the match in the sync
/// engine's dispatcher is exhaustive so a new variant cannot be forgotten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
  SendMessage { message: Message },
  CreateThread { thread: NewThread },
  DeleteThread,
  UpdateTitle { title: String },
  UpdateThread { patch: ThreadPatch },
}

impl ActionKind {
  /// Stable name used for the `type` index of the queue table.
  pub fn name(&self) -> &'static str {
    match self {
      Self::SendMessage { .. } => "SEND_MESSAGE",
      Self::CreateThread { .. } => "CREATE_THREAD",
      Self::DeleteThread => "DELETE_THREAD",
      Self::UpdateTitle { .. } => "UPDATE_TITLE",
      Self::UpdateThread { .. } => "UPDATE_THREAD",
    }
  }
}

/// A persisted queue item.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedAction {
  pub id: String,
  pub kind: ActionKind,
  pub timestamp: DateTime<Utc>,
  pub user_id: Option<String>,
  pub thread_id: Option<String>,
  pub status: ActionStatus,
  pub retry_count: u32,
  pub max_retries: u32,
  pub last_attempt: Option<DateTime<Utc>>,
  pub error: Option<String>,
}

/// Caller-supplied part of a queued action; `SyncEngine::enqueue` fills in the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
  pub kind: ActionKind,
  pub user_id: Option<String>,
  pub thread_id: Option<String>,
  pub timestamp: Option<DateTime<Utc>>,
}

impl NewAction {
  pub fn new(kind: ActionKind, user_id: Option<&str>, thread_id: Option<&str>) -> Self {
    Self {
      kind,
      user_id: user_id.map(String::from),
      thread_id: thread_id.map(String::from),
      timestamp: None,
    }
  }

  /// Pin the ordering timestamp instead of taking it from the engine's clock.
  pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
    self.timestamp = Some(timestamp);
    self
  }
}
