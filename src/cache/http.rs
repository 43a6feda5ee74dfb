//! Request/response model used by the cache engine and the interceptor.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// How the request was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level page load.
  Navigate,
  #[default]
  SameOrigin,
  Cors,
  NoCors,
}

/// An outgoing request as seen by the cache layer.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub mode: RequestMode,
}

impl CacheRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      mode: RequestMode::default(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A page navigation to `url`.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url).with_header("accept", "text/html")
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }

  /// Stable, fixed-length lookup key for this request.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Mirrors the platform's response types; only `Basic` is cacheable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
  /// Same-origin, fully readable.
  Basic,
  Cors,
  Opaque,
  Error,
}

impl ResponseType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
      Self::Error => "error",
    }
  }

  pub fn parse(s: &str) -> Self {
    match s {
      "basic" => Self::Basic,
      "cors" => Self::Cors,
      "opaque" => Self::Opaque,
      _ => Self::Error,
    }
  }
}

/// A response, possibly stamped with the time it entered the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
  pub status: u16,
  pub response_type: ResponseType,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// Set when the response was stored; drives age-based expiry.
  pub captured_at: Option<DateTime<Utc>>,
}

impl CachedResponse {
  pub fn new(status: u16, response_type: ResponseType, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      response_type,
      headers: Vec::new(),
      body: body.into(),
      captured_at: None,
    }
  }

  /// A plain same-origin `200 OK`.
  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self::new(200, ResponseType::Basic, body)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
    self.captured_at = Some(at);
    self
  }

  /// Whether this response may be written to the cache.
  ///
  /// Requires HTTP 200, a `basic` response type and no `no-store` directive.
  pub fn is_cacheable(&self) -> bool {
    if self.status != 200 || self.response_type != ResponseType::Basic {
      return false;
    }
    !self
      .header("cache-control")
      .map(|value| {
        value
          .split(',')
          .any(|directive| directive.trim().eq_ignore_ascii_case("no-store"))
      })
      .unwrap_or(false)
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}
