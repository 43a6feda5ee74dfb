//! Remote persistence API consumed by the sync engine.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use url::Url;

use crate::error::RemoteError;
use crate::model::{Message, NewThread, Thread, ThreadPatch};

/// Operations the remote store must offer.
///
/// Every call may be repeated after a lost acknowledgement, so implementations
/// should tolerate replays. Success is `Ok`; anything else is a [`RemoteError`]
/// whose kind decides whether the engine retries.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  async fn add_message(
    &self,
    user_id: &str,
    chat_id: &str,
    message: &Message,
  ) -> Result<(), RemoteError>;

  async fn create_thread(&self, user_id: &str, thread: &NewThread) -> Result<Thread, RemoteError>;

  async fn delete_thread(&self, user_id: &str, chat_id: &str) -> Result<(), RemoteError>;

  async fn update_thread_title(
    &self,
    user_id: &str,
    chat_id: &str,
    title: &str,
  ) -> Result<(), RemoteError>;

  async fn update_thread(
    &self,
    user_id: &str,
    chat_id: &str,
    patch: &ThreadPatch,
  ) -> Result<(), RemoteError>;

  async fn fetch_threads(&self, user_id: &str) -> Result<Vec<Thread>, RemoteError>;
}

/// JSON-over-HTTP remote store.
#[derive(Clone)]
pub struct HttpRemoteStore {
  client: Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpRemoteStore {
  pub fn new(base_url: Url, token: Option<String>, timeout: Duration) -> Result<Self, RemoteError> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| RemoteError::transient(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
    self
      .base_url
      .join(path)
      .map_err(|e| RemoteError::permanent(0, format!("Invalid endpoint {}: {}", path, e)))
  }

  fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, RemoteError> {
    let url = self.endpoint(path)?;
    let builder = self.client.request(method, url);
    Ok(match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    })
  }

  async fn send(builder: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
    let response = builder.send().await?;
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::from_status(status.as_u16(), body))
  }

  async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, RemoteError> {
    let response = Self::send(builder).await?;
    response
      .json::<T>()
      .await
      .map_err(|e| RemoteError::transient(format!("Failed to decode response: {}", e)))
  }
}

fn thread_path(chat_id: &str) -> String {
  format!("api/threads/{}", chat_id)
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
  async fn add_message(
    &self,
    user_id: &str,
    chat_id: &str,
    message: &Message,
  ) -> Result<(), RemoteError> {
    let path = format!("{}/messages", thread_path(chat_id));
    let builder = self
      .request(Method::POST, &path)?
      .json(&json!({ "userId": user_id, "message": message }));
    Self::send(builder).await.map(|_| ())
  }

  async fn create_thread(&self, user_id: &str, thread: &NewThread) -> Result<Thread, RemoteError> {
    let builder = self.request(Method::POST, "api/threads")?.json(&json!({
      "userId": user_id,
      "title": thread.title,
      "projectId": thread.project_id,
      "pageType": thread.page_type,
      "initialMessage": thread.initial_message,
    }));
    Self::send_json(builder).await
  }

  async fn delete_thread(&self, user_id: &str, chat_id: &str) -> Result<(), RemoteError> {
    let builder = self
      .request(Method::DELETE, &thread_path(chat_id))?
      .query(&[("userId", user_id)]);
    Self::send(builder).await.map(|_| ())
  }

  async fn update_thread_title(
    &self,
    user_id: &str,
    chat_id: &str,
    title: &str,
  ) -> Result<(), RemoteError> {
    let builder = self
      .request(Method::PATCH, &thread_path(chat_id))?
      .json(&json!({ "userId": user_id, "title": title }));
    Self::send(builder).await.map(|_| ())
  }

  async fn update_thread(
    &self,
    user_id: &str,
    chat_id: &str,
    patch: &ThreadPatch,
  ) -> Result<(), RemoteError> {
    let builder = self.request(Method::PATCH, &thread_path(chat_id))?.json(&json!({
      "userId": user_id,
      "title": patch.title,
      "projectId": patch.project_id,
    }));
    Self::send(builder).await.map(|_| ())
  }

  async fn fetch_threads(&self, user_id: &str) -> Result<Vec<Thread>, RemoteError> {
    let builder = self
      .request(Method::GET, "api/threads")?
      .query(&[("userId", user_id)]);
    Self::send_json(builder).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_endpoint_joins_under_base_path() {
    let base = Url::parse("https://chat.example.com/app/").unwrap();
    let remote = HttpRemoteStore::new(base, None, Duration::from_secs(5)).unwrap();
    assert_eq!(
      remote.endpoint(&thread_path("t-1")).unwrap().as_str(),
      "https://chat.example.com/app/api/threads/t-1"
    );
  }

  #[tokio::test]
  async fn test_unreachable_host_is_transient() {
    // Port 9 (discard) on localhost is closed on any sane test machine.
    let base = Url::parse("http://127.0.0.1:9/").unwrap();
    let remote = HttpRemoteStore::new(base, None, Duration::from_secs(2)).unwrap();
    let err = remote.fetch_threads("u1").await.unwrap_err();
    assert!(!err.is_permanent(), "unexpected {:?}", err);
  }
}
