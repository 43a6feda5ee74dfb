//! Named HTTP response caches backed by SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::http::{CacheRequest, CachedResponse, ResponseType};
use crate::error::CacheStoreError;
use crate::store::{migrate, StorageEstimate, HTTP_CACHE_MIGRATIONS};

/// An entry's identity and footprint, as listed by [`HttpCache::keys`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
  pub request_key: String,
  pub url: String,
  pub bytes: u64,
  pub captured_at: Option<DateTime<Utc>>,
}

/// Named request→response caches, the way the platform cache API exposes them.
#[async_trait]
pub trait HttpCache: Send + Sync {
  async fn lookup(
    &self,
    cache: &str,
    request: &CacheRequest,
  ) -> Result<Option<CachedResponse>, CacheStoreError>;

  /// Store `response`, replacing any entry for the same request. The entry
  /// becomes the newest in its cache.
  async fn put(
    &self,
    cache: &str,
    request: &CacheRequest,
    response: &CachedResponse,
  ) -> Result<(), CacheStoreError>;

  /// Returns whether an entry was removed.
  async fn delete(&self, cache: &str, request_key: &str) -> Result<bool, CacheStoreError>;

  /// Entries in `cache`, oldest first.
  async fn keys(&self, cache: &str) -> Result<Vec<CacheKey>, CacheStoreError>;

  async fn cache_names(&self) -> Result<Vec<String>, CacheStoreError>;

  /// Drop a whole cache. Returns whether it existed.
  async fn delete_cache(&self, cache: &str) -> Result<bool, CacheStoreError>;

  async fn estimate(&self) -> Result<StorageEstimate, CacheStoreError>;
}

/// SQLite-based HTTP cache with a byte quota over stored bodies.
pub struct SqliteHttpCache {
  conn: Mutex<Connection>,
  quota_bytes: u64,
}

impl SqliteHttpCache {
  pub fn open(path: &Path, quota_bytes: u64) -> color_eyre::Result<Self> {
    use color_eyre::eyre::eyre;

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open HTTP cache at {}: {}", path.display(), e))?;
    Self::with_connection(conn, quota_bytes)
  }

  pub fn open_in_memory(quota_bytes: u64) -> color_eyre::Result<Self> {
    let conn = Connection::open_in_memory()?;
    Self::with_connection(conn, quota_bytes)
  }

  fn with_connection(conn: Connection, quota_bytes: u64) -> color_eyre::Result<Self> {
    migrate(&conn, HTTP_CACHE_MIGRATIONS)?;
    Ok(Self {
      conn: Mutex::new(conn),
      quota_bytes,
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CacheStoreError> {
    self
      .conn
      .lock()
      .map_err(|e| CacheStoreError::Storage(format!("Lock poisoned: {}", e)))
  }
}

fn usage(conn: &Connection) -> Result<u64, CacheStoreError> {
  let used: i64 = conn.query_row(
    "SELECT COALESCE(SUM(LENGTH(body)), 0) FROM http_cache",
    [],
    |row| row.get(0),
  )?;
  Ok(used.max(0) as u64)
}

#[async_trait]
impl HttpCache for SqliteHttpCache {
  async fn lookup(
    &self,
    cache: &str,
    request: &CacheRequest,
  ) -> Result<Option<CachedResponse>, CacheStoreError> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT status, response_type, headers, body, captured_at FROM http_cache
         WHERE cache_name = ? AND request_key = ?",
        params![cache, request.cache_key()],
        |row| {
          Ok((
            row.get::<_, u16>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Vec<u8>>(3)?,
            row.get::<_, i64>(4)?,
          ))
        },
      )
      .optional()?;

    let Some((status, response_type, headers, body, captured_at)) = row else {
      return Ok(None);
    };

    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| CacheStoreError::Storage(format!("Corrupt headers: {}", e)))?;

    Ok(Some(CachedResponse {
      status,
      response_type: ResponseType::parse(&response_type),
      headers,
      body,
      captured_at: DateTime::from_timestamp_millis(captured_at),
    }))
  }

  async fn put(
    &self,
    cache: &str,
    request: &CacheRequest,
    response: &CachedResponse,
  ) -> Result<(), CacheStoreError> {
    let conn = self.lock()?;
    let key = request.cache_key();

    let replaced: i64 = conn
      .query_row(
        "SELECT LENGTH(body) FROM http_cache WHERE cache_name = ? AND request_key = ?",
        params![cache, key],
        |row| row.get(0),
      )
      .optional()?
      .unwrap_or(0);
    let used = usage(&conn)?.saturating_sub(replaced.max(0) as u64);
    let needed = response.body.len() as u64;
    if used + needed > self.quota_bytes {
      return Err(CacheStoreError::QuotaExceeded {
        needed,
        available: self.quota_bytes.saturating_sub(used),
      });
    }

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| CacheStoreError::Storage(format!("Failed to serialize headers: {}", e)))?;
    let captured_at = response.captured_at.unwrap_or_else(Utc::now);

    // REPLACE deletes the old row, so the entry gets a fresh (newest) seq.
    conn.execute(
      "INSERT OR REPLACE INTO http_cache
         (cache_name, request_key, method, url, status, response_type, headers, body, captured_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
      params![
        cache,
        key,
        request.method.as_str(),
        request.url.as_str(),
        response.status,
        response.response_type.as_str(),
        headers,
        response.body,
        captured_at.timestamp_millis(),
      ],
    )?;

    Ok(())
  }

  async fn delete(&self, cache: &str, request_key: &str) -> Result<bool, CacheStoreError> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM http_cache WHERE cache_name = ? AND request_key = ?",
      params![cache, request_key],
    )?;
    Ok(removed > 0)
  }

  async fn keys(&self, cache: &str) -> Result<Vec<CacheKey>, CacheStoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT request_key, url, LENGTH(body), captured_at FROM http_cache
       WHERE cache_name = ? ORDER BY seq ASC",
    )?;
    let keys = stmt
      .query_map(params![cache], |row| {
        Ok(CacheKey {
          request_key: row.get(0)?,
          url: row.get(1)?,
          bytes: row.get::<_, i64>(2)?.max(0) as u64,
          captured_at: DateTime::from_timestamp_millis(row.get(3)?),
        })
      })?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
  }

  async fn cache_names(&self) -> Result<Vec<String>, CacheStoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT DISTINCT cache_name FROM http_cache ORDER BY cache_name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  async fn delete_cache(&self, cache: &str) -> Result<bool, CacheStoreError> {
    let conn = self.lock()?;
    let removed = conn.execute("DELETE FROM http_cache WHERE cache_name = ?", params![cache])?;
    Ok(removed > 0)
  }

  async fn estimate(&self) -> Result<StorageEstimate, CacheStoreError> {
    let conn = self.lock()?;
    Ok(StorageEstimate {
      usage: usage(&conn)?,
      quota: self.quota_bytes,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn request(path: &str) -> CacheRequest {
    CacheRequest::get(Url::parse(&format!("https://app.example{}", path)).unwrap())
  }

  #[tokio::test]
  async fn test_put_and_lookup() {
    let cache = SqliteHttpCache::open_in_memory(1_000).unwrap();
    let response = CachedResponse::ok("body")
      .with_header("content-type", "text/plain")
      .stamped(Utc::now());
    cache.put("c", &request("/a"), &response).await.unwrap();

    let hit = cache.lookup("c", &request("/a")).await.unwrap().unwrap();
    assert_eq!(hit.body, b"body");
    assert_eq!(hit.header("Content-Type"), Some("text/plain"));
    assert!(cache.lookup("other", &request("/a")).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_keys_oldest_first_and_replace_moves_to_newest() {
    let cache = SqliteHttpCache::open_in_memory(1_000).unwrap();
    for path in ["/a", "/b", "/c"] {
      cache.put("c", &request(path), &CachedResponse::ok("x")).await.unwrap();
    }
    cache.put("c", &request("/a"), &CachedResponse::ok("y")).await.unwrap();

    let urls: Vec<String> = cache.keys("c").await.unwrap().into_iter().map(|k| k.url).collect();
    assert_eq!(
      urls,
      vec!["https://app.example/b", "https://app.example/c", "https://app.example/a"]
    );
  }

  #[tokio::test]
  async fn test_quota_exceeded() {
    let cache = SqliteHttpCache::open_in_memory(10).unwrap();
    cache.put("c", &request("/a"), &CachedResponse::ok("123456")).await.unwrap();
    let err = cache
      .put("c", &request("/b"), &CachedResponse::ok("123456"))
      .await
      .unwrap_err();
    assert_eq!(
      err,
      CacheStoreError::QuotaExceeded {
        needed: 6,
        available: 4
      }
    );
    // Replacing an entry only counts the difference.
    cache.put("c", &request("/a"), &CachedResponse::ok("1234567890")).await.unwrap();
  }

  #[tokio::test]
  async fn test_delete_cache_and_names() {
    let cache = SqliteHttpCache::open_in_memory(1_000).unwrap();
    cache.put("old-v0", &request("/a"), &CachedResponse::ok("x")).await.unwrap();
    cache.put("new-v1", &request("/a"), &CachedResponse::ok("x")).await.unwrap();

    assert_eq!(cache.cache_names().await.unwrap(), vec!["new-v1", "old-v0"]);
    assert!(cache.delete_cache("old-v0").await.unwrap());
    assert!(!cache.delete_cache("old-v0").await.unwrap());
    assert_eq!(cache.cache_names().await.unwrap(), vec!["new-v1"]);
    assert_eq!(cache.estimate().await.unwrap().usage, 1);
  }
}
