//! Launching, connecting and tearing down daemons.

use std::{
  sync::{Arc, atomic::Ordering},
  time::Duration,
};

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use super::helpers::{FakeDaemonStarter, ShellStarter, options};
use crate::{
  actor::MessageLog,
  domain::{config::CommandTransport, suite::SuiteConfiguration},
  events::{CommandEvent, SuiteEvent},
  launcher::{LaunchError, Launcher},
};

const SHORT: Duration = Duration::from_millis(300);
const LONG: Duration = Duration::from_secs(5);

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + LONG;
  while tokio::time::Instant::now() < deadline {
    if condition() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  false
}

#[tokio::test]
async fn test_daemon_that_never_connects() {
  let home = TempDir::new().unwrap();
  let launcher = Launcher::new().with_process_starter(Arc::new(ShellStarter::new("sleep 30")));
  let results = MessageLog::<SuiteEvent>::new();

  let mut session = launcher
    .launch(options(home.path(), CommandTransport::Ipc), Arc::new(results.clone()))
    .await
    .unwrap();

  let started = tokio::time::Instant::now();
  let error = session.await_connection(SHORT).await.unwrap_err();
  assert_eq!(error, LaunchError::NeverConnected(SHORT));
  assert!(started.elapsed() < LONG);

  // Teardown kills the silent daemon instead of hanging
  let status = tokio::time::timeout(LONG, session.shutdown(SHORT)).await.unwrap();
  assert!(!status.is_some_and(|s| s.success()));
  assert!(results.is_empty());
}

#[tokio::test]
async fn test_daemon_that_exits_before_connecting() {
  let home = TempDir::new().unwrap();
  let launcher = Launcher::new().with_process_starter(Arc::new(ShellStarter::new("exit 3")));

  let mut session = launcher
    .launch(options(home.path(), CommandTransport::Ipc), Arc::new(MessageLog::new()))
    .await
    .unwrap();

  let error = session.await_connection(LONG).await.unwrap_err();
  assert!(matches!(error, LaunchError::DaemonExited(ref status) if status.contains('3')));
  session.shutdown(SHORT).await;
}

#[tokio::test]
async fn test_unusable_home_fails_before_spawning() {
  let home = TempDir::new().unwrap();
  let blocker = home.path().join("not-a-dir");
  std::fs::write(&blocker, "").unwrap();
  let starter = Arc::new(ShellStarter::new("exit 0"));
  let launcher = Launcher::new().with_process_starter(starter.clone());

  let result = launcher
    .launch(options(&blocker, CommandTransport::Ipc), Arc::new(MessageLog::new()))
    .await;

  assert!(matches!(result, Err(LaunchError::Resource(_))));
  assert_eq!(starter.started.load(Ordering::SeqCst), 0);
}

async fn run_against_fake_daemon(transport: CommandTransport) {
  let home = TempDir::new().unwrap();
  let starter = Arc::new(FakeDaemonStarter::default());
  let launcher = Launcher::new().with_process_starter(starter.clone());
  let results = MessageLog::<SuiteEvent>::new();

  let mut session = launcher
    .launch(options(home.path(), transport), Arc::new(results.clone()))
    .await
    .unwrap();
  session.await_connection(LONG).await.unwrap();

  let config = SuiteConfiguration {
    include_pattern: "*_check".into(),
    ..Default::default()
  };
  session.run_tests(config.clone()).unwrap();
  assert!(wait_until(|| results.len() == 3).await);
  assert_eq!(
    results.messages(),
    vec![
      SuiteEvent::SuiteStarted,
      SuiteEvent::AllTestFilesFound,
      SuiteEvent::SuiteFinished
    ]
  );

  tokio::time::timeout(LONG, session.shutdown(SHORT)).await.unwrap();
  assert!(wait_until(|| starter.commands.len() == 2).await);
  assert_eq!(
    starter.commands.messages(),
    vec![CommandEvent::RunTests(config), CommandEvent::Shutdown]
  );
}

#[tokio::test]
async fn test_commands_over_the_command_directory() {
  run_against_fake_daemon(CommandTransport::Ipc).await;
}

#[tokio::test]
async fn test_commands_over_the_network() {
  run_against_fake_daemon(CommandTransport::Network).await;
}
