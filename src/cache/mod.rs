//! HTTP caching for offline use.
//!
//! Requests are classified by the shared [`strategy`] table and answered
//! cache-first, network-first or stale-while-revalidate against a set of
//! named, versioned caches. Both the page-side [`CachePolicyEngine`] and the
//! request interceptor are built on the same table.

mod fetch;
pub mod http;
mod policy;
mod storage;
pub mod strategy;
#[cfg(test)]
pub(crate) mod testing;

pub use fetch::{Fetcher, HttpFetcher};
pub use http::{CacheRequest, CachedResponse, RequestMode, ResponseType};
pub use policy::{CachePolicyEngine, CacheResult, CacheSource, CacheStats, PolicySettings, WarmReport};
pub use storage::{CacheKey, HttpCache, SqliteHttpCache};
pub use strategy::{CacheStrategy, Handler, UrlPattern, CACHE_VERSION, STRATEGIES};
