//! Offline action queue, replay engine and connectivity-driven scheduling.
//!
//! - [`StatusBroadcaster`] holds `{is_online, queued_actions_count,
//!   sync_in_progress, has_conflicts}` and fans changes out to subscribers.
//! - [`SyncEngine`] owns the write paths and the queue drain.
//! - [`ConnectivityMonitor`] turns online/offline events into drains and a
//!   periodic timer.
//! - [`RemoteStore`] is the remote persistence API; [`HttpRemoteStore`] talks
//!   to it over HTTP.

mod connectivity;
mod engine;
mod remote;
mod status;
#[cfg(test)]
mod testing;

pub use connectivity::{ConnectivityEvent, ConnectivityMonitor};
pub use engine::{DrainReport, SyncEngine, DEFAULT_MAX_RETRIES};
pub use remote::{HttpRemoteStore, RemoteStore};
pub use status::{StatusBroadcaster, Subscription, SyncStatus};
