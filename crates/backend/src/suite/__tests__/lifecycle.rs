//! Suite lifecycle from discovery to the suite finished event.

use pretty_assertions::assert_eq;

use std::{sync::Arc, time::Duration};

use super::helpers::{ListFinder, Script, StagedFinder, SuiteContext, TIMEOUT, finished, found, wait_for};
use crate::{events::SuiteEvent, suite::SuitePhase};

fn gated(_: &crate::domain::suite::TestFile) -> Script {
  Script::Gated
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_files_finish_before_the_suite() {
  let ctx = SuiteContext::new();
  let mut handle = ctx.start(ListFinder::of(&["F1", "F2"]), gated);

  assert!(wait_for(TIMEOUT, || ctx.contains(&SuiteEvent::AllTestFilesFound)).await);
  assert_eq!(
    ctx.log.messages(),
    vec![
      SuiteEvent::SuiteStarted,
      found("F1"),
      found("F2"),
      SuiteEvent::AllTestFilesFound
    ]
  );
  assert!(wait_for(TIMEOUT, || handle.phase() == SuitePhase::Draining).await);

  ctx.gates.open("F1");
  assert!(wait_for(TIMEOUT, || ctx.contains(&finished("F1"))).await);
  assert!(!ctx.contains(&SuiteEvent::SuiteFinished));

  ctx.gates.open("F2");
  assert!(tokio::time::timeout(TIMEOUT, handle.finished()).await.unwrap());

  assert_eq!(
    ctx.log.messages(),
    vec![
      SuiteEvent::SuiteStarted,
      found("F1"),
      found("F2"),
      SuiteEvent::AllTestFilesFound,
      finished("F1"),
      finished("F2"),
      SuiteEvent::SuiteFinished,
    ]
  );
  ctx.thread.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_finished_during_discovery_is_reported_after_all_found() {
  let ctx = SuiteContext::new();
  let finder = Arc::new(StagedFinder {
    files: vec!["F1", "F2"],
    gates: ctx.gates.clone(),
    before_all_found: "F1/ran",
    settle: Duration::from_millis(200),
  });
  let mut handle = ctx.start(finder, |file| {
    if file.as_str() == "F1" {
      Script::Signal
    } else {
      Script::Gated
    }
  });

  // F1 is done long before discovery ends, yet its finished event waits
  assert!(wait_for(TIMEOUT, || ctx.contains(&SuiteEvent::AllTestFilesFound)).await);
  assert!(wait_for(TIMEOUT, || ctx.contains(&finished("F1"))).await);
  assert_eq!(
    ctx.log.messages(),
    vec![
      SuiteEvent::SuiteStarted,
      found("F1"),
      found("F2"),
      SuiteEvent::AllTestFilesFound,
      finished("F1"),
    ]
  );

  ctx.gates.open("F2");
  assert!(tokio::time::timeout(TIMEOUT, handle.finished()).await.unwrap());
  assert_eq!(
    ctx.log.messages(),
    vec![
      SuiteEvent::SuiteStarted,
      found("F1"),
      found("F2"),
      SuiteEvent::AllTestFilesFound,
      finished("F1"),
      finished("F2"),
      SuiteEvent::SuiteFinished,
    ]
  );
  ctx.thread.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finished_suite_releases_its_actors() {
  let ctx = SuiteContext::new();
  ctx.gates.open("F1");
  ctx.gates.open("F2");
  let mut handle = ctx.start(ListFinder::of(&["F1", "F2"]), gated);

  assert!(tokio::time::timeout(TIMEOUT, handle.finished()).await.unwrap());
  assert!(wait_for(TIMEOUT, || ctx.thread.bound_actors() == 0).await);
  ctx.thread.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_suite_finishes() {
  let ctx = SuiteContext::new();
  let mut handle = ctx.start(ListFinder::of(&[]), gated);

  assert!(tokio::time::timeout(TIMEOUT, handle.finished()).await.unwrap());
  assert_eq!(
    ctx.log.messages(),
    vec![
      SuiteEvent::SuiteStarted,
      SuiteEvent::AllTestFilesFound,
      SuiteEvent::SuiteFinished
    ]
  );
  ctx.thread.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_driver_is_reported_and_siblings_finish() {
  let ctx = SuiteContext::new();
  ctx.gates.open("ok");
  let mut handle = ctx.start(ListFinder::of(&["boom", "ok"]), |file| {
    if file.as_str() == "boom" {
      Script::Panic
    } else {
      Script::Gated
    }
  });

  assert!(tokio::time::timeout(TIMEOUT, handle.finished()).await.unwrap());

  let events = ctx.log.messages();
  let internal: Vec<_> = events
    .iter()
    .filter_map(|e| match e {
      SuiteEvent::InternalError { message, .. } => Some(message.clone()),
      _ => None,
    })
    .collect();
  assert_eq!(internal, vec!["Uncaught panic in worker: driver for boom exploded".to_string()]);
  assert!(events.contains(&finished("boom")));
  assert!(events.contains(&finished("ok")));
  assert_eq!(events.last(), Some(&SuiteEvent::SuiteFinished));
  ctx.thread.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nested_work_keeps_the_file_open() {
  let ctx = SuiteContext::new();
  let mut handle = ctx.start(ListFinder::of(&["outer"]), |_| Script::Nested);

  assert!(wait_for(TIMEOUT, || ctx.contains(&SuiteEvent::AllTestFilesFound)).await);
  // The driver itself returns at once; its nested worker is still waiting
  tokio::time::sleep(std::time::Duration::from_millis(50)).await;
  assert!(!ctx.contains(&finished("outer")));

  ctx.gates.open("outer/nested");
  assert!(tokio::time::timeout(TIMEOUT, handle.finished()).await.unwrap());
  assert_eq!(
    &ctx.log.messages()[3..],
    &[finished("outer"), SuiteEvent::SuiteFinished]
  );
  ctx.thread.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_finder_still_finishes_the_suite() {
  let ctx = SuiteContext::new();
  ctx.gates.open("F1");
  let finder = std::sync::Arc::new(ListFinder {
    files: vec!["F1"],
    fail: true,
  });
  let mut handle = ctx.start(finder, gated);

  assert!(tokio::time::timeout(TIMEOUT, handle.finished()).await.unwrap());

  let events = ctx.log.messages();
  assert!(
    events
      .iter()
      .any(|e| matches!(e, SuiteEvent::InternalError { message, .. } if message.contains("disk went away")))
  );
  assert!(events.contains(&SuiteEvent::AllTestFilesFound));
  assert!(events.contains(&finished("F1")));
  assert_eq!(events.last(), Some(&SuiteEvent::SuiteFinished));
  ctx.thread.shutdown().await;
}
