//! Scriptable fetcher for cache engine tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::fetch::Fetcher;
use super::http::{CacheRequest, CachedResponse};
use crate::error::FetchError;

#[derive(Clone)]
pub enum Reply {
  Respond(CachedResponse),
  Fail(FetchError),
  /// Never resolves.
  Hang,
}

/// Answers by URL. Unscripted URLs get a `200 OK` whose body is the URL.
#[derive(Default)]
pub struct FakeFetcher {
  replies: Mutex<HashMap<String, Reply>>,
  calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn reply(&self, url: &str, reply: Reply) {
    self.replies.lock().unwrap().insert(url.to_string(), reply);
  }

  pub fn respond(&self, url: &str, response: CachedResponse) {
    self.reply(url, Reply::Respond(response));
  }

  pub fn fail(&self, url: &str) {
    self.reply(url, Reply::Fail(FetchError::Network("connection refused".to_string())));
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, url: &str) -> usize {
    self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
  }
}

#[async_trait]
impl Fetcher for FakeFetcher {
  async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse, FetchError> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(url.clone());
    let reply = self.replies.lock().unwrap().get(&url).cloned();
    match reply {
      Some(Reply::Respond(response)) => Ok(response),
      Some(Reply::Fail(err)) => Err(err),
      Some(Reply::Hang) => futures::future::pending().await,
      None => Ok(CachedResponse::ok(url)),
    }
  }
}
