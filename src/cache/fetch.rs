//! Network side of the cache engine.

use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use super::http::{CacheRequest, CachedResponse, ResponseType};
use crate::error::FetchError;

/// Performs a request against the network.
///
/// Non-2xx answers are still `Ok`; only failing to get any answer is an error.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse, FetchError>;
}

/// reqwest-backed fetcher for a single application origin.
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Url,
}

impl HttpFetcher {
  pub fn new(origin: Url, timeout: Duration) -> color_eyre::Result<Self> {
    use color_eyre::eyre::eyre;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    Ok(Self { client, origin })
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Resolve a path or absolute URL against the origin.
  pub fn resolve(&self, target: &str) -> Result<Url, url::ParseError> {
    self.origin.join(target)
  }

  fn response_type(&self, url: &Url) -> ResponseType {
    if url.origin() == self.origin.origin() {
      ResponseType::Basic
    } else {
      ResponseType::Cors
    }
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    // Redirects are followed; classify by where we ended up.
    let response_type = self.response_type(response.url());
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(CachedResponse {
      status,
      response_type,
      headers,
      body,
      captured_at: None,
    })
  }
}
