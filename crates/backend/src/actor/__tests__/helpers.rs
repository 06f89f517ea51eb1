//! Test helpers for actor and worker-counter scenarios.

use std::{
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use crate::actor::{ActorRef, ActorThread, ActorThreadConfig, MessageLog, MessageSender, WorkerEvent, WorkerListener};

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if condition() {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
}

/// Worker listener that counts how often it fired and records a label.
pub struct RecordingListener {
  label: String,
  fired: Arc<AtomicUsize>,
  log: MessageLog<String>,
}

impl WorkerListener for RecordingListener {
  fn on_all_workers_finished(&mut self) {
    self.fired.fetch_add(1, Ordering::SeqCst);
    self.log.send(self.label.clone());
  }
}

/// Actor context shared by the scenarios in this directory.
pub struct CompletionContext {
  pub thread: ActorThread,
  pub log: MessageLog<String>,
}

impl CompletionContext {
  pub fn new() -> Self {
    Self {
      thread: ActorThread::spawn(ActorThreadConfig::new("test-actors")),
      log: MessageLog::new(),
    }
  }

  /// Bind a recording listener and return it with its fire counter.
  pub fn listener(&self, label: &str) -> (ActorRef<WorkerEvent>, Arc<AtomicUsize>) {
    let fired = Arc::new(AtomicUsize::new(0));
    let listener = RecordingListener {
      label: label.to_string(),
      fired: Arc::clone(&fired),
      log: self.log.clone(),
    };
    (self.thread.bind::<WorkerEvent>(Box::new(listener), label), fired)
  }
}
