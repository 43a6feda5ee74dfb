//! Best-effort local persistence for cached conversations and the action queue.
//!
//! [`Store`] is the service the rest of the crate talks to. It never returns
//! an error: storage failures are logged and degrade to "nothing stored" or
//! "nothing found", so a broken disk can never take the chat flow down with it.

mod schema;
mod storage;

pub use schema::{migrate, HTTP_CACHE_MIGRATIONS};
pub use storage::{DurableStore, NoopStore, SqliteStore};

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::model::{CachedConversation, QueuedAction, SyncState};

/// Bytes used versus bytes granted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageEstimate {
  pub usage: u64,
  pub quota: u64,
}

impl StorageEstimate {
  /// Fraction of the quota in use. An unknown (zero) quota reads as empty.
  pub fn ratio(&self) -> f64 {
    if self.quota == 0 {
      0.0
    } else {
      self.usage as f64 / self.quota as f64
    }
  }
}

/// Shared handle to the durable store.
#[derive(Clone)]
pub struct Store {
  backend: Arc<dyn DurableStore>,
}

impl Store {
  pub fn new(backend: impl DurableStore + 'static) -> Self {
    Self {
      backend: Arc::new(backend),
    }
  }

  /// Open the SQLite store at `path`, falling back to a no-op store if that fails.
  pub fn open(path: &Path, quota_bytes: u64) -> Self {
    match SqliteStore::open(path, quota_bytes) {
      Ok(store) => {
        tracing::debug!(path = %path.display(), "opened durable store");
        Self::new(store)
      }
      Err(e) => {
        tracing::warn!("Durable store unavailable, running without persistence: {}", e);
        Self::new(NoopStore)
      }
    }
  }

  /// In-memory store, mainly for tests.
  pub fn in_memory() -> Self {
    match SqliteStore::open_in_memory(u64::MAX) {
      Ok(store) => Self::new(store),
      Err(e) => {
        tracing::warn!("In-memory store unavailable: {}", e);
        Self::new(NoopStore)
      }
    }
  }

  pub async fn put_conversation(&self, conversation: &CachedConversation) {
    if let Err(e) = self.backend.put_conversation(conversation).await {
      tracing::warn!("put_conversation failed: {}", e);
    }
  }

  pub async fn get_conversation(&self, id: &str) -> Option<CachedConversation> {
    self
      .backend
      .get_conversation(id)
      .await
      .unwrap_or_else(|e| {
        tracing::warn!("get_conversation failed: {}", e);
        None
      })
  }

  pub async fn all_conversations(&self) -> Vec<CachedConversation> {
    self.backend.all_conversations().await.unwrap_or_else(|e| {
      tracing::warn!("all_conversations failed: {}", e);
      Vec::new()
    })
  }

  pub async fn delete_conversation(&self, id: &str) {
    if let Err(e) = self.backend.delete_conversation(id).await {
      tracing::warn!("delete_conversation failed: {}", e);
    }
  }

  pub async fn count_conversations(&self, state: SyncState) -> usize {
    self
      .backend
      .count_conversations(state)
      .await
      .unwrap_or_else(|e| {
        tracing::warn!("count_conversations failed: {}", e);
        0
      })
  }

  pub async fn put_action(&self, action: &QueuedAction) {
    if let Err(e) = self.backend.put_action(action).await {
      tracing::warn!("put_action failed: {}", e);
    }
  }

  /// Queue items in replay order.
  pub async fn actions(&self) -> Vec<QueuedAction> {
    self.backend.actions().await.unwrap_or_else(|e| {
      tracing::warn!("actions failed: {}", e);
      Vec::new()
    })
  }

  pub async fn update_action(&self, action: &QueuedAction) {
    if let Err(e) = self.backend.update_action(action).await {
      tracing::warn!("update_action failed: {}", e);
    }
  }

  pub async fn delete_action(&self, id: &str) {
    if let Err(e) = self.backend.delete_action(id).await {
      tracing::warn!("delete_action failed: {}", e);
    }
  }

  pub async fn retarget_actions(&self, from: &str, to: &str) -> usize {
    self
      .backend
      .retarget_actions(from, to)
      .await
      .unwrap_or_else(|e| {
        tracing::warn!("retarget_actions failed: {}", e);
        0
      })
  }

  pub async fn estimate(&self) -> StorageEstimate {
    self.backend.estimate().await.unwrap_or_else(|e| {
      tracing::warn!("estimate failed: {}", e);
      StorageEstimate::default()
    })
  }
}
