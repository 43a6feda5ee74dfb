//! Scriptable in-memory remote store for engine tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::remote::RemoteStore;
use crate::error::RemoteError;
use crate::model::{Message, NewThread, Thread, ThreadPatch};

#[derive(Default)]
pub struct FakeRemote {
  /// `"<op>:<chat_id or title>"` for every call, in call order.
  pub calls: Mutex<Vec<String>>,
  /// Errors handed out to the next calls, one per call.
  failures: Mutex<VecDeque<RemoteError>>,
  /// Id the next `create_thread` returns; defaults to `server-<n>`.
  server_ids: Mutex<VecDeque<String>>,
  pub threads: Mutex<Vec<Thread>>,
  delay: Option<Duration>,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_delay(delay: Duration) -> Self {
    Self {
      delay: Some(delay),
      ..Self::default()
    }
  }

  pub fn fail_next(&self, times: usize, error: RemoteError) {
    let mut failures = self.failures.lock().unwrap();
    for _ in 0..times {
      failures.push_back(error.clone());
    }
  }

  pub fn next_server_id(&self, id: &str) {
    self.server_ids.lock().unwrap().push_back(id.to_string());
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  async fn call(&self, label: String) -> Result<(), RemoteError> {
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    self.calls.lock().unwrap().push(label);
    match self.failures.lock().unwrap().pop_front() {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }
}

#[async_trait]
impl RemoteStore for FakeRemote {
  async fn add_message(&self, _user: &str, chat_id: &str, _m: &Message) -> Result<(), RemoteError> {
    self.call(format!("add_message:{}", chat_id)).await
  }

  async fn create_thread(&self, _user: &str, thread: &NewThread) -> Result<Thread, RemoteError> {
    self.call(format!("create_thread:{}", thread.title)).await?;
    let id = self.server_ids.lock().unwrap().pop_front().unwrap_or_else(|| {
      let n = self.calls.lock().unwrap().len();
      format!("server-{}", n)
    });
    let created = Thread::local(id, thread, Utc::now());
    self.threads.lock().unwrap().push(created.clone());
    Ok(created)
  }

  async fn delete_thread(&self, _user: &str, chat_id: &str) -> Result<(), RemoteError> {
    self.call(format!("delete_thread:{}", chat_id)).await
  }

  async fn update_thread_title(
    &self,
    _user: &str,
    chat_id: &str,
    _title: &str,
  ) -> Result<(), RemoteError> {
    self.call(format!("update_thread_title:{}", chat_id)).await
  }

  async fn update_thread(
    &self,
    _user: &str,
    chat_id: &str,
    _patch: &ThreadPatch,
  ) -> Result<(), RemoteError> {
    self.call(format!("update_thread:{}", chat_id)).await
  }

  async fn fetch_threads(&self, user_id: &str) -> Result<Vec<Thread>, RemoteError> {
    self.call(format!("fetch_threads:{}", user_id)).await?;
    Ok(self.threads.lock().unwrap().clone())
  }
}
