//! Versioned cache strategy table.
//!
//! This module is the one piece of configuration the page-side cache engine
//! and the request interceptor both compile in. Bumping [`CACHE_VERSION`]
//! renames every cache, and the interceptor deletes the old ones on activate.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use super::http::{CacheRequest, CachedResponse, RequestMode};

pub const CACHE_VERSION: &str = "v1";

/// Cache that holds install-time precached URLs and warmed URLs no strategy claims.
pub const PRECACHE_NAME: &str = "precache";

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// How a strategy answers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Handler {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

/// Which requests a strategy claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlPattern {
  /// Exact host names.
  Hosts(&'static [&'static str]),
  /// Path prefix on any host.
  PathPrefix(&'static str),
  /// Path ending in one of these extensions (no dot, case-insensitive).
  Extensions(&'static [&'static str]),
  /// Page navigations and anything asking for HTML.
  Navigation,
}

impl UrlPattern {
  pub fn matches(&self, request: &CacheRequest) -> bool {
    match self {
      Self::Hosts(hosts) => request
        .url
        .host_str()
        .map(|host| hosts.iter().any(|h| h.eq_ignore_ascii_case(host)))
        .unwrap_or(false),
      Self::PathPrefix(prefix) => request.url.path().starts_with(prefix),
      Self::Extensions(extensions) => {
        let path = request.url.path();
        let last = path.rsplit('/').next().unwrap_or("");
        match last.rsplit_once('.') {
          Some((_, ext)) => extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
          None => false,
        }
      }
      Self::Navigation => {
        request.mode == RequestMode::Navigate
          || request
            .header("accept")
            .map(|accept| accept.contains("text/html"))
            .unwrap_or(false)
      }
    }
  }
}

/// One row of the strategy table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStrategy {
  pub name: &'static str,
  pub handler: Handler,
  pub pattern: UrlPattern,
  pub max_entries: usize,
  pub max_age: Duration,
  /// Whether quota enforcement may evict from this cache.
  pub purge_on_quota_error: bool,
}

impl CacheStrategy {
  /// Versioned on-disk cache name.
  pub fn cache_name(&self) -> String {
    versioned(self.name)
  }

  /// A response is expired once its age exceeds `max_age`. Unstamped responses are expired.
  pub fn is_expired(&self, response: &CachedResponse, now: DateTime<Utc>) -> bool {
    self.is_expired_at(response.captured_at, now)
  }

  pub fn is_expired_at(&self, captured_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match captured_at {
      Some(captured_at) => {
        let age = now.signed_duration_since(captured_at);
        age.to_std().map(|age| age > self.max_age).unwrap_or(false)
      }
      None => true,
    }
  }
}

pub fn versioned(name: &str) -> String {
  format!("{}-{}", name, CACHE_VERSION)
}

/// The strategy table, matched first to last.
pub static STRATEGIES: &[CacheStrategy] = &[
  CacheStrategy {
    name: "google-fonts",
    handler: Handler::CacheFirst,
    pattern: UrlPattern::Hosts(&["fonts.googleapis.com", "fonts.gstatic.com"]),
    max_entries: 30,
    max_age: Duration::from_secs(365 * DAY),
    purge_on_quota_error: false,
  },
  CacheStrategy {
    name: "next-image",
    handler: Handler::StaleWhileRevalidate,
    pattern: UrlPattern::PathPrefix("/_next/image"),
    max_entries: 60,
    max_age: Duration::from_secs(7 * DAY),
    purge_on_quota_error: true,
  },
  CacheStrategy {
    name: "api-cache",
    handler: Handler::NetworkFirst,
    pattern: UrlPattern::PathPrefix("/api/"),
    max_entries: 50,
    max_age: Duration::from_secs(5 * MINUTE),
    // Needed for offline reads.
    purge_on_quota_error: false,
  },
  CacheStrategy {
    name: "static-assets",
    handler: Handler::CacheFirst,
    pattern: UrlPattern::Extensions(&[
      "js", "css", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "woff", "woff2", "ttf",
    ]),
    max_entries: 100,
    max_age: Duration::from_secs(30 * DAY),
    purge_on_quota_error: true,
  },
  CacheStrategy {
    name: "pages",
    handler: Handler::StaleWhileRevalidate,
    pattern: UrlPattern::Navigation,
    max_entries: 50,
    max_age: Duration::from_secs(DAY),
    purge_on_quota_error: true,
  },
];

/// First strategy in `table` whose pattern matches.
pub fn classify<'a>(table: &'a [CacheStrategy], request: &CacheRequest) -> Option<&'a CacheStrategy> {
  table.iter().find(|s| s.pattern.matches(request))
}

/// Every cache name the current configuration owns.
pub fn current_cache_names(table: &[CacheStrategy]) -> Vec<String> {
  std::iter::once(versioned(PRECACHE_NAME))
    .chain(table.iter().map(CacheStrategy::cache_name))
    .collect()
}
