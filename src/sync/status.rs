//! Single source of truth for sync status, with explicit subscriptions.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Snapshot delivered to subscribers on every recomputation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
  pub is_online: bool,
  pub queued_actions_count: usize,
  pub sync_in_progress: bool,
  pub has_conflicts: bool,
}

type Listener = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

struct Inner {
  status: Mutex<SyncStatus>,
  listeners: Mutex<Vec<(u64, Listener)>>,
  next_id: AtomicU64,
}

/// Publish/subscribe hub for [`SyncStatus`].
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct StatusBroadcaster {
  inner: Arc<Inner>,
}

impl Default for StatusBroadcaster {
  fn default() -> Self {
    Self::new(SyncStatus::default())
  }
}

impl StatusBroadcaster {
  pub fn new(initial: SyncStatus) -> Self {
    Self {
      inner: Arc::new(Inner {
        status: Mutex::new(initial),
        listeners: Mutex::new(Vec::new()),
        next_id: AtomicU64::new(0),
      }),
    }
  }

  /// Current status.
  pub fn current(&self) -> SyncStatus {
    match self.inner.status.lock() {
      Ok(status) => *status,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  /// Register a listener. It stays registered until the returned handle is
  /// dropped or [`Subscription::unsubscribe`] is called.
  #[must_use = "dropping the subscription unsubscribes immediately"]
  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&SyncStatus) + Send + Sync + 'static,
  {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    if let Ok(mut listeners) = self.inner.listeners.lock() {
      listeners.push((id, Arc::new(listener)));
    }
    Subscription {
      id,
      hub: Arc::downgrade(&self.inner),
    }
  }

  /// Apply `change` and fan the new status out to every listener.
  ///
  /// Listeners run synchronously on the caller's task, after the lock has
  /// been released, so a listener may read [`current`](Self::current).
  pub fn update(&self, change: impl FnOnce(&mut SyncStatus)) -> SyncStatus {
    let snapshot = {
      let mut status = match self.inner.status.lock() {
        Ok(status) => status,
        Err(poisoned) => poisoned.into_inner(),
      };
      change(&mut status);
      *status
    };

    let listeners: Vec<Listener> = match self.inner.listeners.lock() {
      Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
      Err(_) => Vec::new(),
    };
    for listener in listeners {
      listener(&snapshot);
    }

    snapshot
  }

  pub fn subscriber_count(&self) -> usize {
    self.inner.listeners.lock().map(|l| l.len()).unwrap_or(0)
  }
}

/// Handle returned by [`StatusBroadcaster::subscribe`].
pub struct Subscription {
  id: u64,
  hub: Weak<Inner>,
}

impl Subscription {
  pub fn unsubscribe(self) {
    // Drop does the work.
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(hub) = self.hub.upgrade() {
      if let Ok(mut listeners) = hub.listeners.lock() {
        listeners.retain(|(id, _)| *id != self.id);
      }
    }
  }
}
