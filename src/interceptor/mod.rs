//! Request interceptor.
//!
//! Runs as its own tokio task with its own [`CachePolicyEngine`](crate::cache::CachePolicyEngine)
//! and shares nothing with the page but the compiled-in strategy table. Pages
//! talk to it only through [`InterceptorHandle`] (typed messages and routed
//! fetches) and learn about new versions from [`Registration`] events.
//!
//! Lifecycle: install (precache) → wait for `SkipWaiting` unless
//! auto-activating → activate (delete caches from other versions, take
//! control) → serve fetches until retired by a newer worker.

mod messages;
mod registration;
mod worker;

pub use messages::{InterceptorMessage, InterceptorReply, InterceptorStatus, UpdateEvent, WorkerState};
pub use registration::Registration;
pub use worker::{InterceptorHandle, WorkerConfig};
