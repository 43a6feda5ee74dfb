//! Offline action queue and sync engine.
//!
//! Mutations go through one of the write paths (`send_message`,
//! `create_thread`, ...). Online, they hit the remote store directly and the
//! result is mirrored into the local cache. Offline, or when the direct call
//! fails transiently, the cache is updated optimistically and the action is
//! queued. [`SyncEngine::drain_queue`] replays queued actions one at a time in
//! timestamp order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::remote::RemoteStore;
use super::status::{StatusBroadcaster, SyncStatus};
use crate::clock::{Clock, SystemClock};
use crate::error::{RemoteError, SyncError};
use crate::model::{
  ActionKind, ActionStatus, CachedConversation, Message, NewAction, NewThread, QueuedAction,
  SyncState, Thread, ThreadPatch,
};
use crate::store::Store;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What one call to [`SyncEngine::drain_queue`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  /// The drain did not run (offline, or another drain was in progress).
  pub skipped: bool,
  pub attempted: usize,
  pub completed: usize,
  /// Failed this time but left pending for a later drain.
  pub retried: usize,
  /// Failed terminally and retained as `failed`.
  pub failed: usize,
  /// Left pending behind an earlier failure on the same thread.
  pub held: usize,
}

impl DrainReport {
  fn skipped() -> Self {
    Self {
      skipped: true,
      ..Self::default()
    }
  }
}

/// Resets the in-progress flag even if the drain future is dropped mid-way.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Result of trying a write against the remote store before queueing it.
enum Direct {
  Done(Option<Thread>),
  Queue,
}

/// The sync engine. Clones share the same store, remote and drain flag.
#[derive(Clone)]
pub struct SyncEngine {
  store: Store,
  remote: Arc<dyn RemoteStore>,
  status: StatusBroadcaster,
  clock: Arc<dyn Clock>,
  draining: Arc<AtomicBool>,
  max_retries: u32,
}

impl SyncEngine {
  pub fn new(store: Store, remote: Arc<dyn RemoteStore>, status: StatusBroadcaster) -> Self {
    Self {
      store,
      remote,
      status,
      clock: Arc::new(SystemClock),
      draining: Arc::new(AtomicBool::new(false)),
      max_retries: DEFAULT_MAX_RETRIES,
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Attempts an action gets before it is marked failed.
  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn status(&self) -> &StatusBroadcaster {
    &self.status
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn is_online(&self) -> bool {
    self.status.current().is_online
  }

  fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  // ==========================================================================
  // Queue
  // ==========================================================================

  /// Persist a new pending action and, when online, kick off a drain in the background.
  pub async fn enqueue(&self, draft: NewAction) -> QueuedAction {
    let action = QueuedAction {
      id: Uuid::new_v4().to_string(),
      timestamp: draft.timestamp.unwrap_or_else(|| self.now()),
      kind: draft.kind,
      user_id: draft.user_id,
      thread_id: draft.thread_id,
      status: ActionStatus::Pending,
      retry_count: 0,
      max_retries: self.max_retries,
      last_attempt: None,
      error: None,
    };

    self.store.put_action(&action).await;
    debug!(id = %action.id, kind = action.kind.name(), "queued action");
    self.refresh_status().await;

    if self.is_online() {
      self.schedule_drain();
    }

    action
  }

  /// Start a drain without waiting for it.
  pub fn schedule_drain(&self) -> JoinHandle<DrainReport> {
    let engine = self.clone();
    tokio::spawn(async move { engine.drain_queue().await })
  }

  /// Replay every pending action against the remote store.
  ///
  /// At most one drain runs at a time; a call made while another drain is
  /// running, or while offline, returns immediately with `skipped` set.
  pub async fn drain_queue(&self) -> DrainReport {
    if !self.is_online() {
      debug!("offline, not draining");
      return DrainReport::skipped();
    }
    if self
      .draining
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("drain already running");
      return DrainReport::skipped();
    }
    let _guard = DrainGuard(&self.draining);

    self.status.update(|s| s.sync_in_progress = true);

    // `syncing` rows here were orphaned by an interrupted drain.
    let batch: Vec<QueuedAction> = self
      .store
      .actions()
      .await
      .into_iter()
      .filter(|a| matches!(a.status, ActionStatus::Pending | ActionStatus::Syncing))
      .collect();

    let mut report = DrainReport::default();
    let mut renamed: HashMap<String, String> = HashMap::new();
    // Threads whose earlier action did not go through in this drain.
    let mut blocked: HashSet<String> = HashSet::new();

    for mut action in batch {
      if !self.is_online() {
        info!("went offline during drain, leaving the rest queued");
        break;
      }
      let server_id = action
        .thread_id
        .as_ref()
        .and_then(|t| renamed.get(t))
        .cloned();
      if server_id.is_some() {
        action.thread_id = server_id;
      }
      if let Some(thread_id) = action.thread_id.as_ref().filter(|t| blocked.contains(*t)) {
        debug!(id = %action.id, thread = %thread_id, "holding action behind earlier failure");
        report.held += 1;
        continue;
      }

      report.attempted += 1;
      action.status = ActionStatus::Syncing;
      self.store.update_action(&action).await;

      let outcome = self
        .dispatch(
          action.user_id.as_deref(),
          action.thread_id.as_deref(),
          &action.kind,
        )
        .await;

      match outcome {
        Ok(created) => {
          self.store.delete_action(&action.id).await;
          if let Some((local, server)) = self.confirm(&action, created).await {
            renamed.insert(local, server);
          }
          report.completed += 1;
        }
        Err(err) => {
          if let Some(thread_id) = &action.thread_id {
            blocked.insert(thread_id.clone());
          }
          if self.record_failure(&mut action, err).await {
            report.failed += 1;
          } else {
            report.retried += 1;
          }
        }
      }
    }

    self.publish(|s| s.sync_in_progress = false).await;

    info!(
      attempted = report.attempted,
      completed = report.completed,
      retried = report.retried,
      failed = report.failed,
      held = report.held,
      "queue drain finished"
    );
    report
  }

  /// Send one action to the remote store. The match is the single place
  /// action kinds are turned into remote calls.
  async fn dispatch(
    &self,
    user_id: Option<&str>,
    thread_id: Option<&str>,
    kind: &ActionKind,
  ) -> Result<Option<Thread>, RemoteError> {
    let user = user_id.ok_or(RemoteError::MissingUser)?;
    let chat = || thread_id.ok_or(RemoteError::MissingThread);

    match kind {
      ActionKind::SendMessage { message } => {
        self.remote.add_message(user, chat()?, message).await?;
        Ok(None)
      }
      ActionKind::CreateThread { thread } => {
        let created = self.remote.create_thread(user, thread).await?;
        Ok(Some(created))
      }
      ActionKind::DeleteThread => {
        self.remote.delete_thread(user, chat()?).await?;
        Ok(None)
      }
      ActionKind::UpdateTitle { title } => {
        self.remote.update_thread_title(user, chat()?, title).await?;
        Ok(None)
      }
      ActionKind::UpdateThread { patch } => {
        self.remote.update_thread(user, chat()?, patch).await?;
        Ok(None)
      }
    }
  }

  /// Bump retry bookkeeping after a failed replay. Returns true if the action is now terminal.
  async fn record_failure(&self, action: &mut QueuedAction, err: RemoteError) -> bool {
    action.retry_count = (action.retry_count + 1).min(action.max_retries);
    action.last_attempt = Some(self.now());
    action.error = Some(err.to_string());

    let terminal = err.is_permanent() || action.retry_count >= action.max_retries;
    action.status = if terminal {
      ActionStatus::Failed
    } else {
      ActionStatus::Pending
    };
    self.store.update_action(action).await;

    if terminal {
      error!(id = %action.id, kind = action.kind.name(), "action failed permanently: {}", err);
      if let Some(thread_id) = &action.thread_id {
        self.set_sync_state(thread_id, SyncState::Conflict).await;
      }
    } else {
      warn!(
        id = %action.id,
        attempt = action.retry_count,
        max = action.max_retries,
        "action failed, will retry: {}",
        err
      );
    }

    terminal
  }

  /// Reflect a successful replay in the cache. Returns `(local_id, server_id)`
  /// when a created thread came back under a different id.
  async fn confirm(
    &self,
    action: &QueuedAction,
    created: Option<Thread>,
  ) -> Option<(String, String)> {
    match (&action.kind, created) {
      (ActionKind::DeleteThread, _) => {
        if let Some(thread_id) = &action.thread_id {
          self.store.delete_conversation(thread_id).await;
        }
        None
      }
      (ActionKind::CreateThread { .. }, Some(server)) => {
        let local_id = action.thread_id.clone().unwrap_or_else(|| server.id.clone());
        let local = self.store.get_conversation(&local_id).await;

        let mut thread = match local {
          Some(conversation) => conversation.thread,
          None => server.clone(),
        };
        thread.id = server.id.clone();
        thread.created_at = server.created_at;

        let renamed = if local_id != server.id {
          self.store.delete_conversation(&local_id).await;
          let moved = self.store.retarget_actions(&local_id, &server.id).await;
          debug!(local = %local_id, server = %server.id, moved, "thread re-keyed");
          Some((local_id, server.id.clone()))
        } else {
          None
        };

        let state = self.settled_state(&server.id).await;
        self
          .store
          .put_conversation(&CachedConversation::new(thread, self.now(), state))
          .await;
        renamed
      }
      _ => {
        if let Some(thread_id) = &action.thread_id {
          let state = self.settled_state(thread_id).await;
          self.set_sync_state(thread_id, state).await;
        }
        None
      }
    }
  }

  /// State a thread rests in once nothing is in flight for it. A retained
  /// failed action keeps it in conflict until retried or cleared.
  async fn settled_state(&self, thread_id: &str) -> SyncState {
    let actions = self.store.actions().await;
    let mut pending = false;
    for action in actions.iter().filter(|a| a.thread_id.as_deref() == Some(thread_id)) {
      if action.status == ActionStatus::Failed {
        return SyncState::Conflict;
      }
      pending = true;
    }
    if pending {
      SyncState::Pending
    } else {
      SyncState::Synced
    }
  }

  /// Whether a non-terminal queued action targets `thread_id`.
  async fn has_queued_for(&self, thread_id: &str) -> bool {
    self.store.actions().await.iter().any(|a| {
      a.thread_id.as_deref() == Some(thread_id) && a.status != ActionStatus::Failed
    })
  }

  async fn set_sync_state(&self, thread_id: &str, state: SyncState) {
    if let Some(mut conversation) = self.store.get_conversation(thread_id).await {
      conversation.sync_state = state;
      conversation.last_modified = self.now();
      self.store.put_conversation(&conversation).await;
    }
  }

  // ==========================================================================
  // Status
  // ==========================================================================

  /// Recompute counts from the store and notify subscribers.
  pub async fn refresh_status(&self) -> SyncStatus {
    self.publish(|_| {}).await
  }

  async fn publish(&self, extra: impl FnOnce(&mut SyncStatus)) -> SyncStatus {
    let queued = self.store.actions().await.len();
    let conflicts = self.store.count_conversations(SyncState::Conflict).await > 0;
    self.status.update(|s| {
      s.queued_actions_count = queued;
      s.has_conflicts = conflicts;
      extra(s);
    })
  }

  /// Everything still in the queue, including failed actions.
  pub async fn queued_actions(&self) -> Vec<QueuedAction> {
    self.store.actions().await
  }

  /// Put failed actions back in line with a fresh retry budget.
  pub async fn retry_failed(&self) -> usize {
    let mut reset = 0;
    for mut action in self.store.actions().await {
      if action.status != ActionStatus::Failed {
        continue;
      }
      action.status = ActionStatus::Pending;
      action.retry_count = 0;
      action.error = None;
      self.store.update_action(&action).await;
      if let Some(thread_id) = &action.thread_id {
        self.set_sync_state(thread_id, SyncState::Pending).await;
      }
      reset += 1;
    }

    self.refresh_status().await;
    if reset > 0 && self.is_online() {
      self.schedule_drain();
    }
    reset
  }

  /// Drop every failed action.
  pub async fn clear_failed(&self) -> usize {
    let mut cleared = 0;
    let mut threads = HashSet::new();
    for action in self.store.actions().await {
      if action.status == ActionStatus::Failed {
        self.store.delete_action(&action.id).await;
        threads.extend(action.thread_id);
        cleared += 1;
      }
    }
    for thread_id in &threads {
      let state = self.settled_state(thread_id).await;
      self.set_sync_state(thread_id, state).await;
    }
    self.refresh_status().await;
    cleared
  }

  // ==========================================================================
  // Write paths
  // ==========================================================================

  /// Try the remote store directly. Transient failures fall back to the
  /// queue; permanent ones are returned to the caller.
  async fn attempt_direct(
    &self,
    user_id: &str,
    thread_id: Option<&str>,
    kind: &ActionKind,
  ) -> Result<Direct, SyncError> {
    if !self.is_online() {
      return Ok(Direct::Queue);
    }
    // Queued work for this thread must land first.
    if let Some(thread_id) = thread_id {
      if self.has_queued_for(thread_id).await {
        debug!(thread = thread_id, "thread has queued actions, queueing behind them");
        return Ok(Direct::Queue);
      }
    }

    match self.dispatch(Some(user_id), thread_id, kind).await {
      Ok(created) => Ok(Direct::Done(created)),
      Err(err) if err.is_permanent() => {
        warn!(kind = kind.name(), "remote rejected write: {}", err);
        Err(SyncError::Rejected(err))
      }
      Err(err) => {
        info!(kind = kind.name(), "remote write failed, queueing for later: {}", err);
        Ok(Direct::Queue)
      }
    }
  }

  /// Apply a thread-scoped action to the cached conversation.
  async fn apply_local(&self, thread_id: &str, kind: &ActionKind, state: SyncState) {
    if let ActionKind::DeleteThread = kind {
      self.store.delete_conversation(thread_id).await;
      return;
    }

    let Some(mut conversation) = self.store.get_conversation(thread_id).await else {
      debug!(thread = thread_id, "no cached conversation to update");
      return;
    };

    let now = self.now();
    let thread = &mut conversation.thread;
    match kind {
      ActionKind::SendMessage { message } => {
        if !thread.messages.iter().any(|m| m.id == message.id) {
          thread.messages.push(message.clone());
        }
      }
      ActionKind::UpdateTitle { title } => thread.title = title.clone(),
      ActionKind::UpdateThread { patch } => thread.apply_patch(patch),
      ActionKind::CreateThread { .. } | ActionKind::DeleteThread => {}
    }
    thread.updated_at = now;
    conversation.last_modified = now;
    conversation.sync_state = state;
    self.store.put_conversation(&conversation).await;
  }

  async fn write(&self, user_id: &str, thread_id: &str, kind: ActionKind) -> Result<(), SyncError> {
    match self.attempt_direct(user_id, Some(thread_id), &kind).await? {
      Direct::Done(_) => {
        let state = self.settled_state(thread_id).await;
        self.apply_local(thread_id, &kind, state).await;
        self.refresh_status().await;
      }
      Direct::Queue => {
        let state = match self.settled_state(thread_id).await {
          SyncState::Conflict => SyncState::Conflict,
          _ => SyncState::Pending,
        };
        self.apply_local(thread_id, &kind, state).await;
        self
          .enqueue(NewAction::new(kind, Some(user_id), Some(thread_id)))
          .await;
      }
    }
    Ok(())
  }

  pub async fn send_message(
    &self,
    user_id: &str,
    thread_id: &str,
    message: Message,
  ) -> Result<(), SyncError> {
    self
      .write(user_id, thread_id, ActionKind::SendMessage { message })
      .await
  }

  /// Create a thread. Offline, the returned thread carries a local id that
  /// is swapped for the server's id once the creation replays.
  pub async fn create_thread(&self, user_id: &str, draft: NewThread) -> Result<Thread, SyncError> {
    let kind = ActionKind::CreateThread {
      thread: draft.clone(),
    };

    if let Direct::Done(Some(thread)) = self.attempt_direct(user_id, None, &kind).await? {
      self
        .store
        .put_conversation(&CachedConversation::new(
          thread.clone(),
          self.now(),
          SyncState::Synced,
        ))
        .await;
      self.refresh_status().await;
      return Ok(thread);
    }

    let local = Thread::local(Uuid::new_v4().to_string(), &draft, self.now());
    self
      .store
      .put_conversation(&CachedConversation::new(
        local.clone(),
        self.now(),
        SyncState::Pending,
      ))
      .await;
    self
      .enqueue(NewAction::new(kind, Some(user_id), Some(&local.id)))
      .await;
    Ok(local)
  }

  pub async fn delete_thread(&self, user_id: &str, thread_id: &str) -> Result<(), SyncError> {
    self.write(user_id, thread_id, ActionKind::DeleteThread).await
  }

  pub async fn update_thread_title(
    &self,
    user_id: &str,
    thread_id: &str,
    title: &str,
  ) -> Result<(), SyncError> {
    let kind = ActionKind::UpdateTitle {
      title: title.to_string(),
    };
    self.write(user_id, thread_id, kind).await
  }

  pub async fn update_thread(
    &self,
    user_id: &str,
    thread_id: &str,
    patch: ThreadPatch,
  ) -> Result<(), SyncError> {
    self
      .write(user_id, thread_id, ActionKind::UpdateThread { patch })
      .await
  }

  /// Refetch the user's threads and overwrite cached copies that have no
  /// queued local changes. Offline or on failure, the cache is returned as is.
  pub async fn refresh_threads(&self, user_id: &str) -> Vec<CachedConversation> {
    if self.is_online() {
      match self.remote.fetch_threads(user_id).await {
        Ok(threads) => {
          let queued = self.store.actions().await;
          for thread in threads {
            let busy = queued.iter().any(|a| {
              a.thread_id.as_deref() == Some(thread.id.as_str())
                && a.status != ActionStatus::Failed
            });
            if busy {
              debug!(thread = %thread.id, "keeping local copy with queued changes");
              continue;
            }
            self
              .store
              .put_conversation(&CachedConversation::new(thread, self.now(), SyncState::Synced))
              .await;
          }
          self.refresh_status().await;
        }
        Err(err) => warn!("failed to refresh threads: {}", err),
      }
    }

    self.store.all_conversations().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::model::Role;
  use crate::sync::testing::FakeRemote;
  use chrono::{Duration, TimeZone};
  use std::sync::Mutex;

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
  }

  fn engine_with(remote: Arc<FakeRemote>) -> SyncEngine {
    SyncEngine::new(Store::in_memory(), remote, StatusBroadcaster::default())
      .with_clock(Arc::new(ManualClock::new(t0())))
      .with_max_retries(3)
  }

  fn set_online(engine: &SyncEngine, online: bool) {
    engine.status().update(|s| s.is_online = online);
  }

  async fn seed_conversation(engine: &SyncEngine, id: &str) {
    let thread = Thread::local(id, &NewThread::titled("Seed"), t0());
    engine
      .store()
      .put_conversation(&CachedConversation::new(thread, t0(), SyncState::Synced))
      .await;
  }

  fn title_action(thread: &str, at: DateTime<Utc>) -> NewAction {
    let kind = ActionKind::UpdateTitle {
      title: format!("title {}", thread),
    };
    NewAction::new(kind, Some("u1"), Some(thread)).at(at)
  }

  #[tokio::test]
  async fn test_drain_replays_in_timestamp_order() {
    let remote = Arc::new(FakeRemote::new());
    let engine = engine_with(remote.clone());

    for (thread, secs) in [("c", 30), ("a", 10), ("d", 40), ("b", 20)] {
      engine
        .enqueue(title_action(thread, t0() + Duration::seconds(secs)))
        .await;
    }
    set_online(&engine, true);
    let report = engine.drain_queue().await;

    assert_eq!(report.completed, 4);
    assert_eq!(
      remote.calls(),
      vec![
        "update_thread_title:a",
        "update_thread_title:b",
        "update_thread_title:c",
        "update_thread_title:d"
      ]
    );
    assert!(engine.queued_actions().await.is_empty());
  }

  #[tokio::test]
  async fn test_offline_right_after_enqueue_leaves_item_pending() {
    let remote = Arc::new(FakeRemote::new());
    let engine = engine_with(remote.clone());
    set_online(&engine, true);

    engine.enqueue(title_action("a", t0())).await;
    set_online(&engine, false);
    for _ in 0..5 {
      tokio::task::yield_now().await;
    }

    let queued = engine.queued_actions().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].status, ActionStatus::Pending);
    assert_eq!(queued[0].retry_count, 0);
    assert!(remote.calls().is_empty());
  }

  #[tokio::test]
  async fn test_action_failing_max_retries_times_is_retained_as_failed() {
    let remote = Arc::new(FakeRemote::new());
    remote.fail_next(3, RemoteError::transient("503"));
    let engine = engine_with(remote.clone());
    seed_conversation(&engine, "t1").await;

    engine.update_thread_title("u1", "t1", "Renamed").await.unwrap();
    set_online(&engine, true);

    let first = engine.drain_queue().await;
    assert_eq!(first.retried, 1);
    let queued = engine.queued_actions().await;
    assert_eq!(queued[0].status, ActionStatus::Pending);
    assert_eq!(queued[0].retry_count, 1);
    assert!(queued[0].last_attempt.is_some());

    engine.drain_queue().await;
    let third = engine.drain_queue().await;
    assert_eq!(third.failed, 1);

    let queued = engine.queued_actions().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].status, ActionStatus::Failed);
    assert_eq!(queued[0].retry_count, 3);

    // Terminal: later drains leave it alone.
    engine.drain_queue().await;
    assert_eq!(remote.calls().len(), 3);
    assert_eq!(engine.queued_actions().await.len(), 1);

    let conversation = engine.store().get_conversation("t1").await.unwrap();
    assert_eq!(conversation.sync_state, SyncState::Conflict);
    assert!(engine.status().current().has_conflicts);
  }

  #[tokio::test]
  async fn test_action_failing_fewer_times_then_succeeding_is_deleted() {
    let remote = Arc::new(FakeRemote::new());
    remote.fail_next(2, RemoteError::transient("reset"));
    let engine = engine_with(remote.clone());
    seed_conversation(&engine, "t1").await;

    engine.update_thread_title("u1", "t1", "Renamed").await.unwrap();
    set_online(&engine, true);
    for _ in 0..3 {
      engine.drain_queue().await;
    }

    assert!(engine.queued_actions().await.is_empty());
    let conversation = engine.store().get_conversation("t1").await.unwrap();
    assert_eq!(conversation.sync_state, SyncState::Synced);
    assert_eq!(conversation.thread.title, "Renamed");
  }

  #[tokio::test]
  async fn test_missing_user_fails_without_retry() {
    let remote = Arc::new(FakeRemote::new());
    let engine = engine_with(remote.clone());

    engine
      .enqueue(NewAction::new(ActionKind::DeleteThread, None, Some("t1")))
      .await;
    set_online(&engine, true);
    let report = engine.drain_queue().await;

    assert_eq!(report.failed, 1);
    assert!(remote.calls().is_empty());
    let queued = engine.queued_actions().await;
    assert_eq!(queued[0].status, ActionStatus::Failed);
    assert!(queued[0].retry_count <= queued[0].max_retries);
    assert!(queued[0].error.as_deref().unwrap().contains("user"));
  }

  #[tokio::test]
  async fn test_offline_create_thread_then_drain_syncs() {
    let remote = Arc::new(FakeRemote::new());
    remote.next_server_id("srv-demo");
    let engine = engine_with(remote.clone());

    let local = engine
      .create_thread("u1", NewThread::titled("Demo"))
      .await
      .unwrap();

    let cached = engine.store().get_conversation(&local.id).await.unwrap();
    assert!(cached.thread.messages.is_empty());
    assert_eq!(cached.sync_state, SyncState::Pending);
    let queued = engine.queued_actions().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind.name(), "CREATE_THREAD");
    assert_eq!(engine.status().current().queued_actions_count, 1);

    set_online(&engine, true);
    engine.drain_queue().await;

    assert!(engine.queued_actions().await.is_empty());
    assert!(engine.store().get_conversation(&local.id).await.is_none());
    let synced = engine.store().get_conversation("srv-demo").await.unwrap();
    assert_eq!(synced.sync_state, SyncState::Synced);
    assert_eq!(synced.thread.title, "Demo");
    assert_eq!(engine.status().current().queued_actions_count, 0);
  }

  #[tokio::test]
  async fn test_later_actions_follow_the_re_keyed_thread() {
    let remote = Arc::new(FakeRemote::new());
    remote.next_server_id("srv-1");
    let engine = engine_with(remote.clone());

    let local = engine
      .create_thread("u1", NewThread::titled("Demo"))
      .await
      .unwrap();
    set_online(&engine, true);

    // Online, but the thread still has queued work, so this queues too.
    let message = Message::new(Role::User, "hello", t0());
    engine.send_message("u1", &local.id, message).await.unwrap();
    assert!(remote.calls().is_empty());
    assert_eq!(engine.queued_actions().await.len(), 2);

    engine.drain_queue().await;
    assert_eq!(
      remote.calls(),
      vec!["create_thread:Demo", "add_message:srv-1"]
    );
    let synced = engine.store().get_conversation("srv-1").await.unwrap();
    assert_eq!(synced.thread.messages.len(), 1);
    assert_eq!(synced.sync_state, SyncState::Synced);
  }

  #[tokio::test]
  async fn test_failed_create_holds_later_actions_for_the_thread() {
    let remote = Arc::new(FakeRemote::new());
    remote.fail_next(1, RemoteError::transient("503"));
    remote.next_server_id("srv-1");
    let engine = engine_with(remote.clone());

    let local = engine
      .create_thread("u1", NewThread::titled("Demo"))
      .await
      .unwrap();
    let message = Message::new(Role::User, "hello", t0());
    engine.send_message("u1", &local.id, message).await.unwrap();
    set_online(&engine, true);

    let report = engine.drain_queue().await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(report.held, 1);
    assert_eq!(remote.calls(), vec!["create_thread:Demo"]);

    let queued = engine.queued_actions().await;
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[1].kind.name(), "SEND_MESSAGE");
    assert_eq!(queued[1].status, ActionStatus::Pending);
    assert_eq!(queued[1].retry_count, 0);
    assert_eq!(queued[1].thread_id.as_deref(), Some(local.id.as_str()));

    engine.drain_queue().await;
    assert_eq!(
      remote.calls(),
      vec!["create_thread:Demo", "create_thread:Demo", "add_message:srv-1"]
    );
    assert!(engine.queued_actions().await.is_empty());
    let synced = engine.store().get_conversation("srv-1").await.unwrap();
    assert_eq!(synced.sync_state, SyncState::Synced);
    assert!(!engine.status().current().has_conflicts);
  }

  #[tokio::test]
  async fn test_later_write_keeps_conflict_while_failure_is_retained() {
    let remote = Arc::new(FakeRemote::new());
    remote.fail_next(1, RemoteError::permanent(422, "title too long"));
    let engine = engine_with(remote.clone());
    seed_conversation(&engine, "t1").await;

    engine.update_thread_title("u1", "t1", "A").await.unwrap();
    set_online(&engine, true);
    engine.drain_queue().await;
    assert!(engine.status().current().has_conflicts);

    engine.update_thread_title("u1", "t1", "B").await.unwrap();
    let conversation = engine.store().get_conversation("t1").await.unwrap();
    assert_eq!(conversation.thread.title, "B");
    assert_eq!(conversation.sync_state, SyncState::Conflict);
    assert!(engine.status().current().has_conflicts);
    assert_eq!(engine.queued_actions().await.len(), 1);

    assert_eq!(engine.clear_failed().await, 1);
    let conversation = engine.store().get_conversation("t1").await.unwrap();
    assert_eq!(conversation.sync_state, SyncState::Synced);
    assert!(!engine.status().current().has_conflicts);
  }

  #[tokio::test]
  async fn test_online_write_goes_direct() {
    let remote = Arc::new(FakeRemote::new());
    let engine = engine_with(remote.clone());
    set_online(&engine, true);

    let thread = engine
      .create_thread("u1", NewThread::titled("Live"))
      .await
      .unwrap();
    assert_eq!(remote.calls(), vec!["create_thread:Live"]);
    assert!(engine.queued_actions().await.is_empty());
    let cached = engine.store().get_conversation(&thread.id).await.unwrap();
    assert_eq!(cached.sync_state, SyncState::Synced);
  }

  #[tokio::test]
  async fn test_transient_online_failure_falls_back_to_queue() {
    let remote = Arc::new(FakeRemote::new());
    remote.fail_next(1, RemoteError::transient("timeout"));
    let engine = engine_with(remote.clone());
    seed_conversation(&engine, "t1").await;
    set_online(&engine, true);

    let message = Message::new(Role::User, "hi", t0());
    engine.send_message("u1", "t1", message).await.unwrap();

    // The background drain scheduled by enqueue has not run yet.
    let queued = engine.queued_actions().await;
    assert_eq!(queued.len(), 1);
    let cached = engine.store().get_conversation("t1").await.unwrap();
    assert_eq!(cached.sync_state, SyncState::Pending);
    assert_eq!(cached.thread.messages.len(), 1);
  }

  #[tokio::test]
  async fn test_permanent_online_failure_is_returned() {
    let remote = Arc::new(FakeRemote::new());
    remote.fail_next(1, RemoteError::permanent(422, "title too long"));
    let engine = engine_with(remote.clone());
    seed_conversation(&engine, "t1").await;
    set_online(&engine, true);

    let err = engine
      .update_thread_title("u1", "t1", "x")
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::Rejected(RemoteError::Permanent { status: 422, .. })));
    assert!(engine.queued_actions().await.is_empty());
    let cached = engine.store().get_conversation("t1").await.unwrap();
    assert_eq!(cached.thread.title, "Seed");
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_drain_is_dropped() {
    let remote = Arc::new(FakeRemote::with_delay(std::time::Duration::from_millis(100)));
    let engine = engine_with(remote.clone());
    engine.enqueue(title_action("a", t0())).await;
    engine.enqueue(title_action("b", t0())).await;
    set_online(&engine, true);

    let (first, second) = tokio::join!(engine.drain_queue(), engine.drain_queue());
    assert!(!first.skipped);
    assert_eq!(first.completed, 2);
    assert!(second.skipped);
    assert_eq!(remote.calls().len(), 2);
  }

  #[tokio::test]
  async fn test_drain_publishes_progress() {
    let remote = Arc::new(FakeRemote::new());
    let engine = engine_with(remote);
    engine.enqueue(title_action("a", t0())).await;
    set_online(&engine, true);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let _sub = engine
      .status()
      .subscribe(move |status| s.lock().unwrap().push(status.sync_in_progress));

    engine.drain_queue().await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.first(), Some(&true));
    assert_eq!(seen.last(), Some(&false));
  }

  #[tokio::test]
  async fn test_retry_failed_resets_budget() {
    let remote = Arc::new(FakeRemote::new());
    remote.fail_next(1, RemoteError::permanent(500, "x"));
    let engine = engine_with(remote.clone());
    engine
      .enqueue(title_action("a", t0()))
      .await;
    set_online(&engine, true);
    // 500 classified by hand as permanent above, so one attempt is terminal.
    engine.drain_queue().await;
    assert_eq!(engine.queued_actions().await[0].status, ActionStatus::Failed);

    set_online(&engine, false);
    assert_eq!(engine.retry_failed().await, 1);
    let queued = engine.queued_actions().await;
    assert_eq!(queued[0].status, ActionStatus::Pending);
    assert_eq!(queued[0].retry_count, 0);

    set_online(&engine, true);
    engine.drain_queue().await;
    assert!(engine.queued_actions().await.is_empty());
  }

  #[tokio::test]
  async fn test_clear_failed() {
    let remote = Arc::new(FakeRemote::new());
    let engine = engine_with(remote);
    engine
      .enqueue(NewAction::new(ActionKind::DeleteThread, None, Some("t1")))
      .await;
    set_online(&engine, true);
    engine.drain_queue().await;

    assert_eq!(engine.clear_failed().await, 1);
    assert!(engine.queued_actions().await.is_empty());
    assert_eq!(engine.status().current().queued_actions_count, 0);
  }

  #[tokio::test]
  async fn test_refresh_threads_skips_threads_with_queued_changes() {
    let remote = Arc::new(FakeRemote::new());
    let engine = engine_with(remote.clone());
    seed_conversation(&engine, "busy").await;
    engine.update_thread_title("u1", "busy", "Local").await.unwrap();

    remote
      .threads
      .lock()
      .unwrap()
      .push(Thread::local("busy", &NewThread::titled("Remote"), t0()));
    remote
      .threads
      .lock()
      .unwrap()
      .push(Thread::local("fresh", &NewThread::titled("Fresh"), t0()));

    set_online(&engine, true);
    let conversations = engine.refresh_threads("u1").await;

    assert_eq!(conversations.len(), 2);
    let busy = engine.store().get_conversation("busy").await.unwrap();
    assert_eq!(busy.thread.title, "Local");
    assert_eq!(busy.sync_state, SyncState::Pending);
    let fresh = engine.store().get_conversation("fresh").await.unwrap();
    assert_eq!(fresh.sync_state, SyncState::Synced);
  }

  #[tokio::test]
  async fn test_offline_delete_removes_conversation_and_queues() {
    let remote = Arc::new(FakeRemote::new());
    let engine = engine_with(remote.clone());
    seed_conversation(&engine, "t1").await;

    engine.delete_thread("u1", "t1").await.unwrap();
    assert!(engine.store().get_conversation("t1").await.is_none());

    set_online(&engine, true);
    engine.drain_queue().await;
    assert_eq!(remote.calls(), vec!["delete_thread:t1"]);
  }
}
