//! Offline support for a chat client: a durable action queue replayed
//! against the remote store, and an HTTP cache policy shared with a
//! request interceptor.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod logging;
pub mod model;
pub mod store;
pub mod sync;
