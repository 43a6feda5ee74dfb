//! Typed messages exchanged between pages and the interceptor.

use serde::{Deserialize, Serialize};

use crate::cache::{CacheStats, WarmReport};

/// Lifecycle of an interceptor worker, in the order it moves through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
  Installing,
  Installed,
  Activating,
  Activated,
  /// Install failed or a newer worker replaced this one.
  Redundant,
}

/// Page → interceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterceptorMessage {
  /// Activate a waiting worker now.
  SkipWaiting,
  /// Drop expired entries and caches from older versions.
  Cleanup,
  /// Precache these URLs. Relative paths resolve against the origin.
  WarmCache { urls: Vec<String> },
  GetStatus,
}

/// Interceptor → page, one per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterceptorReply {
  Ack,
  CleanupDone {
    expired: usize,
    outdated: Vec<String>,
  },
  Warmed(WarmReport),
  Status(InterceptorStatus),
  Error {
    message: String,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterceptorStatus {
  pub state: WorkerState,
  pub version: String,
  pub caches: Vec<CacheStats>,
  pub usage: u64,
  pub quota: u64,
}

/// Events the registration dispatches to pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateEvent {
  /// A new worker installed while an older one controls the page.
  Available,
  /// The new worker activated.
  Applied,
  /// The new worker took control of the page.
  Controlling,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_message_wire_format() {
    let warm: InterceptorMessage =
      serde_json::from_str(r#"{"type":"WARM_CACHE","urls":["/a.js","/b.png"]}"#).unwrap();
    assert_eq!(
      warm,
      InterceptorMessage::WarmCache {
        urls: vec!["/a.js".to_string(), "/b.png".to_string()]
      }
    );
    let skip: InterceptorMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
    assert_eq!(skip, InterceptorMessage::SkipWaiting);
  }

  #[test]
  fn test_reply_and_event_wire_format() {
    let reply = InterceptorReply::CleanupDone {
      expired: 2,
      outdated: vec!["pages-v0".to_string()],
    };
    assert_eq!(
      serde_json::to_value(&reply).unwrap(),
      serde_json::json!({"type": "CLEANUP_DONE", "expired": 2, "outdated": ["pages-v0"]})
    );
    assert_eq!(
      serde_json::to_string(&UpdateEvent::Controlling).unwrap(),
      r#""controlling""#
    );
  }

  #[test]
  fn test_states_are_ordered() {
    assert!(WorkerState::Installing < WorkerState::Installed);
    assert!(WorkerState::Activated < WorkerState::Redundant);
  }
}
