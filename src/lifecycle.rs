//! Worker lifecycle: states, transitions and lifecycle events.

use color_eyre::{eyre::eyre, Result};
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use tokio::task::JoinHandle;

use crate::commands::Command;
use crate::http::Request;

/// Where a router version is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Uninitialized,
  Installing,
  /// Installed, waiting for the previous version to let go
  Waiting,
  /// Controlling pages and intercepting fetches
  Active,
  /// Replaced by a newer active version
  Superseded,
}

impl WorkerState {
  fn can_transition_to(self, next: WorkerState) -> bool {
    use WorkerState::*;
    matches!(
      (self, next),
      (Uninitialized, Installing) | (Installing, Waiting) | (Waiting, Active) | (Active, Superseded)
    )
  }

  /// Move to `next`, rejecting transitions the lifecycle does not allow.
  pub fn advance(&mut self, next: WorkerState) -> Result<()> {
    if !self.can_transition_to(next) {
      return Err(eyre!("Illegal worker transition {} -> {}", self, next));
    }
    tracing::debug!("Worker state {} -> {}", self, next);
    *self = next;
    Ok(())
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Uninitialized => "uninitialized",
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Active => "active",
      Self::Superseded => "superseded",
    };
    f.write_str(name)
  }
}

/// Lifetime extension for a lifecycle event.
///
/// Futures passed to [`wait_until`](Self::wait_until) start running right
/// away as detached tasks. Dropping the event does not cancel them; the host
/// calls [`settle`](Self::settle) to wait for all of them.
#[derive(Default)]
pub struct ExtendableEvent {
  pending: Mutex<Vec<JoinHandle<()>>>,
}

impl ExtendableEvent {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn wait_until<F>(&self, future: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let handle = tokio::spawn(future);
    match self.pending.lock() {
      Ok(mut pending) => pending.push(handle),
      Err(poisoned) => poisoned.into_inner().push(handle),
    }
  }

  /// Number of extensions not yet settled.
  pub fn pending(&self) -> usize {
    match self.pending.lock() {
      Ok(pending) => pending.len(),
      Err(poisoned) => poisoned.into_inner().len(),
    }
  }

  /// Wait for every registered extension to finish.
  pub async fn settle(&self) {
    let handles = match self.pending.lock() {
      Ok(mut pending) => std::mem::take(&mut *pending),
      Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };

    for result in futures::future::join_all(handles).await {
      if let Err(e) = result {
        tracing::error!("Event extension task failed: {}", e);
      }
    }
  }
}

/// An intercepted request together with its lifetime extension.
pub struct FetchEvent {
  pub request: Request,
  pub extend: ExtendableEvent,
}

impl FetchEvent {
  pub fn new(request: Request) -> Self {
    Self {
      request,
      extend: ExtendableEvent::new(),
    }
  }
}

/// A command posted from the page.
pub struct MessageEvent {
  pub command: Command,
  pub extend: ExtendableEvent,
}

impl MessageEvent {
  pub fn new(command: Command) -> Self {
    Self {
      command,
      extend: ExtendableEvent::new(),
    }
  }
}
