//! Ordered startup and shutdown hooks
//!
//! Hooks run in registration order on startup and in reverse order on
//! shutdown. A hook that fails to start rolls back the hooks started before
//! it, so a half-started process never leaks resources.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actor::ActorThread;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Startup hook '{hook}' failed: {message}")]
pub struct LifecycleError {
  pub hook: String,
  pub message: String,
}

#[async_trait]
pub trait LifecycleHook: Send + Sync {
  fn name(&self) -> &str;

  async fn on_startup(&self) -> Result<(), LifecycleError> {
    Ok(())
  }

  async fn on_shutdown(&self);
}

#[derive(Default)]
pub struct Lifecycle {
  hooks: Vec<Arc<dyn LifecycleHook>>,
  started: usize,
}

impl Lifecycle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
    self.hooks.push(hook);
    self
  }

  pub fn len(&self) -> usize {
    self.hooks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.hooks.is_empty()
  }

  /// Run every startup hook in order.
  pub async fn startup(&mut self) -> Result<(), LifecycleError> {
    while self.started < self.hooks.len() {
      let hook = Arc::clone(&self.hooks[self.started]);
      debug!(hook = hook.name(), "Running startup hook");
      if let Err(e) = hook.on_startup().await {
        error!(hook = hook.name(), error = %e, "Startup hook failed, rolling back");
        self.shutdown().await;
        return Err(e);
      }
      self.started += 1;
    }
    info!(hooks = self.started, "Startup complete");
    Ok(())
  }

  /// Run the shutdown hooks of every started hook, newest first.
  pub async fn shutdown(&mut self) {
    while self.started > 0 {
      self.started -= 1;
      let hook = Arc::clone(&self.hooks[self.started]);
      debug!(hook = hook.name(), "Running shutdown hook");
      hook.on_shutdown().await;
    }
  }
}

// ============================================================================
// Hooks
// ============================================================================

/// Stops an actor thread, following its drain policy.
pub struct ActorThreadHook {
  thread: ActorThread,
}

impl ActorThreadHook {
  pub fn new(thread: ActorThread) -> Self {
    Self { thread }
  }
}

#[async_trait]
impl LifecycleHook for ActorThreadHook {
  fn name(&self) -> &str {
    self.thread.name()
  }

  async fn on_shutdown(&self) {
    self.thread.shutdown().await;
  }
}

/// Cancels a background task and waits for it, up to a deadline.
pub struct TaskHook {
  name: String,
  cancel: CancellationToken,
  task: Mutex<Option<JoinHandle<()>>>,
  timeout: Duration,
}

impl TaskHook {
  pub fn new(name: impl Into<String>, cancel: CancellationToken, task: JoinHandle<()>, timeout: Duration) -> Self {
    Self {
      name: name.into(),
      cancel,
      task: Mutex::new(Some(task)),
      timeout,
    }
  }
}

#[async_trait]
impl LifecycleHook for TaskHook {
  fn name(&self) -> &str {
    &self.name
  }

  async fn on_shutdown(&self) {
    self.cancel.cancel();
    let Some(mut task) = self.task.lock().await.take() else {
      return;
    };
    match tokio::time::timeout(self.timeout, &mut task).await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => warn!(task = %self.name, error = %e, "Task ended abnormally"),
      Err(_) => {
        warn!(task = %self.name, "Task did not stop in time, aborting");
        task.abort();
      }
    }
  }
}
