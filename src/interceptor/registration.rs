//! Page-side view of the interceptor: which worker controls, which one
//! waits, and update events.

use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::messages::{InterceptorMessage, InterceptorReply, UpdateEvent, WorkerState};
use super::worker::{InterceptorHandle, WorkerConfig};
use crate::cache::CachePolicyEngine;
use crate::error::InterceptorError;

#[derive(Default)]
struct Slots {
  controller: Option<InterceptorHandle>,
  waiting: Option<InterceptorHandle>,
}

/// Tracks interceptor workers for a page and dispatches [`UpdateEvent`]s.
#[derive(Clone)]
pub struct Registration {
  slots: Arc<Mutex<Slots>>,
  events: broadcast::Sender<UpdateEvent>,
}

impl Default for Registration {
  fn default() -> Self {
    Self::new()
  }
}

impl Registration {
  pub fn new() -> Self {
    let (events, _) = broadcast::channel(16);
    Self {
      slots: Arc::new(Mutex::new(Slots::default())),
      events,
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
    self.events.subscribe()
  }

  pub fn controller(&self) -> Option<InterceptorHandle> {
    self.slots.lock().ok().and_then(|s| s.controller.clone())
  }

  pub fn waiting(&self) -> Option<InterceptorHandle> {
    self.slots.lock().ok().and_then(|s| s.waiting.clone())
  }

  /// Start a new worker and follow it through its lifecycle in the background.
  pub fn register(&self, engine: CachePolicyEngine, config: WorkerConfig) -> InterceptorHandle {
    let worker = InterceptorHandle::spawn(engine, config);
    let registration = self.clone();
    let tracked = worker.clone();
    tokio::spawn(async move { registration.track(tracked).await });
    worker
  }

  /// Ask the waiting worker, if any, to activate now.
  pub async fn skip_waiting(&self) -> Result<bool, InterceptorError> {
    match self.waiting() {
      Some(worker) => {
        let reply = worker.post(InterceptorMessage::SkipWaiting).await?;
        Ok(reply == InterceptorReply::Ack)
      }
      None => Ok(false),
    }
  }

  async fn track(&self, worker: InterceptorHandle) {
    if worker.wait_until(WorkerState::Installed).await == WorkerState::Redundant {
      warn!(worker = worker.id(), "Interceptor failed to install");
      return;
    }

    let replaces_controller = {
      let Ok(mut slots) = self.slots.lock() else {
        return;
      };
      slots.waiting = Some(worker.clone());
      slots.controller.is_some()
    };
    if replaces_controller {
      self.emit(UpdateEvent::Available);
    }

    let reached = worker.wait_until(WorkerState::Activated).await;
    let previous = {
      let Ok(mut slots) = self.slots.lock() else {
        return;
      };
      if slots.waiting.as_ref().map(|w| w.id()) == Some(worker.id()) {
        slots.waiting = None;
      }
      if reached != WorkerState::Activated {
        return;
      }
      slots.controller.replace(worker.clone())
    };

    self.emit(UpdateEvent::Applied);
    if let Some(previous) = previous {
      previous.retire().await;
    }
    info!(worker = worker.id(), "interceptor now controls the page");
    self.emit(UpdateEvent::Controlling);
  }

  fn emit(&self, event: UpdateEvent) {
    // No subscribers is fine.
    let _ = self.events.send(event);
  }
}
