//! The interceptor worker task and its handle.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use url::Url;

use super::messages::{InterceptorMessage, InterceptorReply, InterceptorStatus, WorkerState};
use crate::cache::{CachePolicyEngine, CacheRequest, CacheResult, CACHE_VERSION};
use crate::error::{FetchError, InterceptorError};

static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
  /// Origin that relative URLs resolve against.
  pub origin: Url,
  /// Fetched and stored during install. Any failure fails the install.
  pub precache: Vec<Url>,
  /// Activate straight after install instead of waiting for `SkipWaiting`.
  pub auto_activate: bool,
}

enum Command {
  Fetch {
    request: CacheRequest,
    reply: oneshot::Sender<Result<CacheResult, FetchError>>,
  },
  Message {
    message: InterceptorMessage,
    reply: oneshot::Sender<InterceptorReply>,
  },
  /// Replaced by a newer worker.
  Retire,
}

/// Handle to a running worker. Cloning shares the same worker; the worker
/// exits once every handle is gone.
#[derive(Clone)]
pub struct InterceptorHandle {
  id: usize,
  commands: mpsc::Sender<Command>,
  state: watch::Receiver<WorkerState>,
}

impl InterceptorHandle {
  /// Start a worker. It begins installing immediately.
  pub fn spawn(engine: CachePolicyEngine, config: WorkerConfig) -> Self {
    let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
    let (commands, inbox) = mpsc::channel(64);
    let (state_tx, state) = watch::channel(WorkerState::Installing);

    let worker = Worker {
      id,
      engine,
      config,
      inbox,
      state: state_tx,
    };
    tokio::spawn(worker.run());

    Self {
      id,
      commands,
      state,
    }
  }

  pub fn id(&self) -> usize {
    self.id
  }

  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  /// Wait until the worker reaches `target` or a later state, and return it.
  pub async fn wait_until(&self, target: WorkerState) -> WorkerState {
    let mut state = self.state.clone();
    let result = state.wait_for(|s| *s >= target).await;
    match result {
      Ok(reached) => *reached,
      Err(_) => WorkerState::Redundant,
    }
  }

  /// Route an intercepted request through the worker.
  pub async fn fetch(&self, request: CacheRequest) -> Result<CacheResult, InterceptorError> {
    let (reply, response) = oneshot::channel();
    self
      .commands
      .send(Command::Fetch { request, reply })
      .await
      .map_err(|_| InterceptorError::Stopped)?;
    let result = response.await.map_err(|_| InterceptorError::Stopped)?;
    Ok(result?)
  }

  pub async fn post(&self, message: InterceptorMessage) -> Result<InterceptorReply, InterceptorError> {
    let (reply, response) = oneshot::channel();
    self
      .commands
      .send(Command::Message { message, reply })
      .await
      .map_err(|_| InterceptorError::Stopped)?;
    response.await.map_err(|_| InterceptorError::Stopped)
  }

  pub(crate) async fn retire(&self) {
    // A worker that already exited needs no retiring.
    let _ = self.commands.send(Command::Retire).await;
  }
}

struct Worker {
  id: usize,
  engine: CachePolicyEngine,
  config: WorkerConfig,
  inbox: mpsc::Receiver<Command>,
  state: watch::Sender<WorkerState>,
}

impl Worker {
  async fn run(mut self) {
    if !self.install().await {
      self.set_state(WorkerState::Redundant);
      return;
    }

    if !self.config.auto_activate && !self.wait_for_skip().await {
      self.set_state(WorkerState::Redundant);
      return;
    }

    self.activate().await;

    while let Some(command) = self.inbox.recv().await {
      if !self.dispatch(command).await {
        break;
      }
    }
    info!(worker = self.id, "interceptor retired");
    self.set_state(WorkerState::Redundant);
  }

  fn set_state(&self, state: WorkerState) {
    debug!(worker = self.id, ?state, "interceptor state");
    self.state.send_replace(state);
  }

  async fn install(&self) -> bool {
    let report = self.engine.warm_cache(&self.config.precache).await;
    if !report.failed.is_empty() {
      warn!(
        worker = self.id,
        failed = report.failed.len(),
        "Interceptor install failed: precache incomplete"
      );
      return false;
    }
    self.set_state(WorkerState::Installed);
    true
  }

  /// Serve commands until `SkipWaiting` arrives. False if retired or orphaned first.
  async fn wait_for_skip(&mut self) -> bool {
    info!(worker = self.id, "interceptor installed, waiting to activate");
    while let Some(command) = self.inbox.recv().await {
      match command {
        Command::Message {
          message: InterceptorMessage::SkipWaiting,
          reply,
        } => {
          let _ = reply.send(InterceptorReply::Ack);
          return true;
        }
        other => {
          if !self.dispatch(other).await {
            return false;
          }
        }
      }
    }
    false
  }

  async fn activate(&self) {
    self.set_state(WorkerState::Activating);
    match self.engine.delete_outdated_caches().await {
      Ok(deleted) if !deleted.is_empty() => {
        info!(worker = self.id, deleted = deleted.len(), "removed outdated caches")
      }
      Ok(_) => {}
      Err(e) => warn!(worker = self.id, "Failed to remove outdated caches: {}", e),
    }
    self.set_state(WorkerState::Activated);
    info!(worker = self.id, version = CACHE_VERSION, "interceptor active");
  }

  /// Returns false when the worker should stop.
  async fn dispatch(&self, command: Command) -> bool {
    match command {
      Command::Fetch { request, reply } => {
        let engine = self.engine.clone();
        tokio::spawn(async move {
          let _ = reply.send(engine.handle(&request).await);
        });
        true
      }
      Command::Message { message, reply } => {
        let _ = reply.send(self.on_message(message).await);
        true
      }
      Command::Retire => false,
    }
  }

  async fn on_message(&self, message: InterceptorMessage) -> InterceptorReply {
    match message {
      InterceptorMessage::SkipWaiting => InterceptorReply::Ack,
      InterceptorMessage::Cleanup => self.cleanup().await,
      InterceptorMessage::WarmCache { urls } => self.warm(&urls).await,
      InterceptorMessage::GetStatus => self.status().await,
    }
  }

  async fn cleanup(&self) -> InterceptorReply {
    let expired = match self.engine.cleanup_expired().await {
      Ok(n) => n,
      Err(e) => return error_reply(e),
    };
    match self.engine.delete_outdated_caches().await {
      Ok(outdated) => InterceptorReply::CleanupDone { expired, outdated },
      Err(e) => error_reply(e),
    }
  }

  async fn warm(&self, urls: &[String]) -> InterceptorReply {
    let mut resolved = Vec::new();
    let mut invalid = Vec::new();
    for raw in urls {
      match self.config.origin.join(raw) {
        Ok(url) => resolved.push(url),
        Err(e) => invalid.push((raw.clone(), format!("invalid URL: {}", e))),
      }
    }
    let mut report = self.engine.warm_cache(&resolved).await;
    report.failed.extend(invalid);
    InterceptorReply::Warmed(report)
  }

  async fn status(&self) -> InterceptorReply {
    let caches = match self.engine.stats().await {
      Ok(stats) => stats,
      Err(e) => return error_reply(e),
    };
    let estimate = match self.engine.estimate().await {
      Ok(estimate) => estimate,
      Err(e) => return error_reply(e),
    };
    let state = *self.state.borrow();
    InterceptorReply::Status(InterceptorStatus {
      state,
      version: CACHE_VERSION.to_string(),
      caches,
      usage: estimate.usage,
      quota: estimate.quota,
    })
  }
}

fn error_reply(err: impl std::fmt::Display) -> InterceptorReply {
  InterceptorReply::Error {
    message: err.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::testing::FakeFetcher;
  use crate::cache::{CacheSource, CachedResponse, SqliteHttpCache};
  use std::sync::Arc;

  const ORIGIN: &str = "https://app.example";

  fn setup() -> (CachePolicyEngine, Arc<FakeFetcher>) {
    let fetcher = Arc::new(FakeFetcher::new());
    let cache = Arc::new(SqliteHttpCache::open_in_memory(u64::MAX).unwrap());
    (CachePolicyEngine::new(cache, fetcher.clone()), fetcher)
  }

  fn config(auto_activate: bool) -> WorkerConfig {
    let origin = Url::parse(ORIGIN).unwrap();
    WorkerConfig {
      precache: vec![origin.join("/").unwrap(), origin.join("/offline").unwrap()],
      origin,
      auto_activate,
    }
  }

  fn get(path: &str) -> CacheRequest {
    CacheRequest::get(Url::parse(ORIGIN).unwrap().join(path).unwrap())
  }

  #[tokio::test]
  async fn test_install_precaches_and_activate_drops_old_caches() {
    let (engine, _) = setup();
    engine
      .cache()
      .put("pages-v0", &get("/old"), &CachedResponse::ok("old"))
      .await
      .unwrap();

    let worker = InterceptorHandle::spawn(engine.clone(), config(true));
    assert_eq!(worker.wait_until(WorkerState::Activated).await, WorkerState::Activated);

    let names = engine.cache().cache_names().await.unwrap();
    assert_eq!(names, vec!["precache-v1".to_string()]);
    assert_eq!(engine.cache().keys("precache-v1").await.unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_failed_precache_makes_worker_redundant() {
    let (engine, fetcher) = setup();
    fetcher.fail("https://app.example/offline");

    let worker = InterceptorHandle::spawn(engine, config(true));
    assert_eq!(worker.wait_until(WorkerState::Installed).await, WorkerState::Redundant);
    assert_eq!(
      worker.post(InterceptorMessage::GetStatus).await,
      Err(InterceptorError::Stopped)
    );
  }

  #[tokio::test]
  async fn test_waits_for_skip_waiting() {
    let (engine, _) = setup();
    let worker = InterceptorHandle::spawn(engine, config(false));
    assert_eq!(worker.wait_until(WorkerState::Installed).await, WorkerState::Installed);

    // Messages other than SkipWaiting are served while waiting.
    let status = worker.post(InterceptorMessage::GetStatus).await.unwrap();
    assert!(matches!(
      status,
      InterceptorReply::Status(InterceptorStatus {
        state: WorkerState::Installed,
        ..
      })
    ));
    assert_eq!(worker.state(), WorkerState::Installed);

    let ack = worker.post(InterceptorMessage::SkipWaiting).await.unwrap();
    assert_eq!(ack, InterceptorReply::Ack);
    assert_eq!(worker.wait_until(WorkerState::Activated).await, WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_fetch_goes_through_cache_policy() {
    let (engine, fetcher) = setup();
    let worker = InterceptorHandle::spawn(engine, config(true));
    worker.wait_until(WorkerState::Activated).await;

    let first = worker.fetch(get("/main.js")).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    let second = worker.fetch(get("/main.js")).await.unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(fetcher.call_count("https://app.example/main.js"), 1);
  }

  #[tokio::test]
  async fn test_warm_message_resolves_relative_urls() {
    let (engine, fetcher) = setup();
    fetcher.fail("https://app.example/b.png");
    let worker = InterceptorHandle::spawn(engine, config(true));
    worker.wait_until(WorkerState::Activated).await;

    let reply = worker
      .post(InterceptorMessage::WarmCache {
        urls: vec!["/a.js".to_string(), "/b.png".to_string()],
      })
      .await
      .unwrap();
    let InterceptorReply::Warmed(report) = reply else {
      panic!("unexpected reply: {:?}", reply);
    };
    assert_eq!(report.stored, vec!["https://app.example/a.js".to_string()]);
    assert_eq!(report.failed.len(), 1);
  }

  #[tokio::test]
  async fn test_retire_makes_worker_redundant() {
    let (engine, _) = setup();
    let worker = InterceptorHandle::spawn(engine, config(true));
    worker.wait_until(WorkerState::Activated).await;

    worker.retire().await;
    assert_eq!(worker.wait_until(WorkerState::Redundant).await, WorkerState::Redundant);
  }
}
