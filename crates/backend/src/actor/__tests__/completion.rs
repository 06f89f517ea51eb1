//! Worker counters delivering their completion through real actor threads.

use std::{
  sync::{Arc, atomic::Ordering},
  time::Duration,
};

use pretty_assertions::assert_eq;

use super::helpers::{CompletionContext, wait_for};
use crate::actor::{BlockingExecutor, Executor, WorkerCounter, WorkerError};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_listener_fires_once_after_count_returns_to_zero() {
  let ctx = CompletionContext::new();
  let counter = WorkerCounter::new("suite", Arc::new(BlockingExecutor::current()));
  let (listener, fired) = ctx.listener("done");

  counter.increment().unwrap();
  counter.increment().unwrap();
  counter.decrement().unwrap();
  counter.after_previous_workers_finished(listener).unwrap();
  assert_eq!(fired.load(Ordering::SeqCst), 0);

  counter.decrement().unwrap();
  assert!(wait_for(TIMEOUT, || fired.load(Ordering::SeqCst) == 1).await);

  // Nothing can revive a closed counter.
  assert_eq!(counter.increment(), Err(WorkerError::Closed("suite".into())));
  ctx.thread.shutdown().await;
  assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_workers_added_while_draining_delay_the_listener() {
  let ctx = CompletionContext::new();
  let counter = WorkerCounter::new("suite", Arc::new(BlockingExecutor::current()));
  let (listener, fired) = ctx.listener("done");

  counter.increment().unwrap();
  counter.after_previous_workers_finished(listener).unwrap();

  // Still draining: more work is accepted and holds the listener back
  counter.increment().unwrap();
  counter.decrement().unwrap();
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(fired.load(Ordering::SeqCst), 0);

  counter.decrement().unwrap();
  assert!(wait_for(TIMEOUT, || fired.load(Ordering::SeqCst) == 1).await);
  assert_eq!(counter.increment(), Err(WorkerError::Closed("suite".into())));
  ctx.thread.shutdown().await;
}

#[tokio::test]
async fn test_idle_counter_fires_on_registration() {
  let ctx = CompletionContext::new();
  let counter = WorkerCounter::new("empty", Arc::new(BlockingExecutor::current()));
  let (listener, fired) = ctx.listener("empty-done");

  counter.after_previous_workers_finished(listener).unwrap();

  assert!(wait_for(TIMEOUT, || fired.load(Ordering::SeqCst) == 1).await);
  ctx.thread.shutdown().await;
}

#[tokio::test]
async fn test_second_listener_is_rejected() {
  let ctx = CompletionContext::new();
  let counter = WorkerCounter::new("suite", Arc::new(BlockingExecutor::current()));
  let (first, _) = ctx.listener("first");
  let (second, second_fired) = ctx.listener("second");

  counter.after_previous_workers_finished(first).unwrap();
  let result = counter.after_previous_workers_finished(second);

  assert_eq!(result, Err(WorkerError::ListenerAlreadyRegistered("suite".into())));
  ctx.thread.shutdown().await;
  assert_eq!(second_fired.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_child_completion_is_delivered_before_parent_completion() {
  let ctx = CompletionContext::new();
  let suite = WorkerCounter::new("suite", Arc::new(BlockingExecutor::current()));

  for name in ["a", "b", "c"] {
    let file = suite.child(format!("file-{}", name));
    let nested = file.clone();
    file
      .start_worker(Box::new(move || {
        std::thread::sleep(Duration::from_millis(10));
        nested.execute(Box::new(|| std::thread::sleep(Duration::from_millis(10))));
      }))
      .unwrap();
    let (listener, _) = ctx.listener(&format!("file-{}", name));
    file.after_previous_workers_finished(listener).unwrap();
  }
  let (suite_listener, suite_fired) = ctx.listener("suite");
  suite.after_previous_workers_finished(suite_listener).unwrap();

  assert!(wait_for(TIMEOUT, || suite_fired.load(Ordering::SeqCst) == 1).await);
  ctx.thread.shutdown().await;

  let events = ctx.log.messages();
  assert_eq!(events.len(), 4);
  assert_eq!(events.last().map(String::as_str), Some("suite"));
  let mut files = events[..3].to_vec();
  files.sort();
  assert_eq!(files, vec!["file-a", "file-b", "file-c"]);
}
