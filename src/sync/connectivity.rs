//! Online/offline tracking and the periodic sync timer.

use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use super::engine::{DrainReport, SyncEngine};

/// Connectivity transitions reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  Online,
  Offline,
}

/// Drives the sync engine from connectivity changes.
///
/// Going online starts a fixed-interval timer that drains the queue on every
/// tick and triggers one drain right away; going offline stops the timer.
pub struct ConnectivityMonitor {
  engine: SyncEngine,
  interval: Duration,
  timer: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
  pub fn new(engine: SyncEngine, interval: Duration) -> Self {
    Self {
      engine,
      interval,
      timer: Mutex::new(None),
    }
  }

  pub fn engine(&self) -> &SyncEngine {
    &self.engine
  }

  /// Handle a platform event. Returns the immediate drain when going online.
  pub fn handle(&self, event: ConnectivityEvent) -> Option<JoinHandle<DrainReport>> {
    match event {
      ConnectivityEvent::Online => Some(self.go_online()),
      ConnectivityEvent::Offline => {
        self.go_offline();
        None
      }
    }
  }

  pub fn go_online(&self) -> JoinHandle<DrainReport> {
    info!("connectivity: online");
    self.engine.status().update(|s| s.is_online = true);
    self.start_timer();
    self.engine.schedule_drain()
  }

  pub fn go_offline(&self) {
    info!("connectivity: offline");
    self.stop_timer();
    self.engine.status().update(|s| s.is_online = false);
  }

  pub fn is_timer_running(&self) -> bool {
    self
      .timer
      .lock()
      .map(|t| t.as_ref().is_some_and(|h| !h.is_finished()))
      .unwrap_or(false)
  }

  fn start_timer(&self) {
    let engine = self.engine.clone();
    let period = self.interval;

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      // The first tick fires immediately; the online transition already drained.
      ticker.tick().await;
      loop {
        ticker.tick().await;
        engine.drain_queue().await;
      }
    });

    if let Ok(mut timer) = self.timer.lock() {
      if let Some(previous) = timer.replace(handle) {
        previous.abort();
      }
    }
  }

  fn stop_timer(&self) {
    if let Ok(mut timer) = self.timer.lock() {
      if let Some(handle) = timer.take() {
        handle.abort();
      }
    }
  }
}

impl Drop for ConnectivityMonitor {
  fn drop(&mut self) {
    self.stop_timer();
  }
}
