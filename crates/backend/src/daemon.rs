//! The daemon process: runs suites on behalf of a launcher.
//!
//! # Architecture
//!
//! ```text
//! launcher ──TCP──▶ LauncherConnection ──CommandEvent──▶ DaemonCommands (actor)
//!    ▲       command dir ─▶ IpcCommandReader ──┘               │ run_tests
//!    │                                                         ▼
//!    └──────────── SuiteEvent (NetworkSender) ◀──────── SuiteRunner (actor) + drivers
//! ```
//!
//! # Lifecycle
//!
//! 1. Connect to the launcher's port; failing to do so ends the daemon
//! 2. Bind the command actor and start reading commands from both transports
//! 3. Run until shutdown is requested, the launcher disconnects, or ctrl-c
//! 4. Shut down in reverse: command reader, actor thread (drains), connection
//!    (flushes queued results)

use std::{
  collections::BTreeMap,
  net::{Ipv4Addr, SocketAddr},
  path::PathBuf,
  sync::Arc,
  time::Duration,
};

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
  actor::{ActorRef, ActorThread, ActorThreadConfig, BlockingExecutor, MessageSender},
  domain::{
    config::Config,
    suite::{StackTrace, SuiteConfiguration},
  },
  events::{CommandEvent, CommandListener, CommandListenerProxy, SuiteEvent, SuiteListener, SuiteListenerProxy, SuiteSink},
  ipc::{CommandDir, IpcCommandReader, IpcError},
  lifecycle::{ActorThreadHook, Lifecycle, LifecycleError, TaskHook},
  network::{NetworkError, NetworkEvent, connect},
  suite::{CommandDriverFactory, GlobTestFileFinder, SuiteHandle, SuitePhase, SuiteRunner},
};

/// How long shutdown waits for each background task
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
  #[error("Failed to connect to launcher: {0}")]
  Connect(#[from] NetworkError),
  #[error("Failed to open command directory: {0}")]
  CommandDir(#[from] IpcError),
  #[error(transparent)]
  Lifecycle(#[from] LifecycleError),
}

/// Daemon parameters, as passed on its command line
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
  pub launcher_port: u16,
  pub command_dir: Option<PathBuf>,
  pub log_actor_messages: bool,
  /// Exported to every test file as environment variables
  pub properties: BTreeMap<String, String>,
  pub config: Config,
}

pub struct Daemon {
  options: DaemonOptions,
}

impl Daemon {
  pub fn new(options: DaemonOptions) -> Self {
    Self { options }
  }

  /// Run until shut down. Returns once every background task has stopped.
  pub async fn run(self) -> Result<(), DaemonError> {
    let options = self.options;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, options.launcher_port));
    info!(launcher = %addr, command_dir = ?options.command_dir, "Starting daemon");

    // Opened before connecting so a bad directory never looks like a connection
    let command_dir = options.command_dir.as_ref().map(CommandDir::open).transpose()?;
    let pending = connect::<CommandEvent, SuiteEvent>(addr).await?;
    let results: SuiteSink = Arc::new(pending.sender());

    // Stop requested (shutdown command, launcher gone, ctrl-c)
    let cancel = CancellationToken::new();
    // Closes the connection; fired last so queued results are flushed
    let connection_cancel = CancellationToken::new();

    let (actor_thread, mut failures) = ActorThread::spawn_with_failures(
      ActorThreadConfig::new("daemon")
        .with_drain_policy(options.config.daemon.drain_policy)
        .with_message_logging(options.log_actor_messages || options.config.launcher.log_actor_messages),
    );
    tokio::spawn(async move {
      while let Some(failure) = failures.recv().await {
        error!(actor = %failure.actor, kind = %failure.kind, "Actor failure");
      }
    });

    let commands = actor_thread.bind::<CommandEvent>(
      Box::new(DaemonCommands {
        thread: actor_thread.clone(),
        results: Arc::clone(&results),
        properties: options.properties.clone(),
        suite: None,
        cancel: cancel.clone(),
      }),
      "daemon-commands",
    );

    let connection = pending.run(
      Arc::new(LauncherConnection {
        commands: commands.clone(),
        cancel: cancel.clone(),
      }),
      connection_cancel.clone(),
    );
    let connection = tokio::spawn(async move {
      match connection.await {
        Ok(Ok(())) => debug!("Launcher connection closed"),
        Ok(Err(e)) => warn!(error = %e, "Launcher connection failed"),
        Err(e) => warn!(error = %e, "Launcher connection task ended abnormally"),
      }
    });

    let mut lifecycle = Lifecycle::new()
      .with_hook(Arc::new(TaskHook::new(
        "launcher-connection",
        connection_cancel,
        connection,
        TASK_SHUTDOWN_TIMEOUT,
      )))
      .with_hook(Arc::new(ActorThreadHook::new(actor_thread)));

    if let Some(dir) = command_dir {
      let reader_cancel = cancel.child_token();
      let reader = IpcCommandReader::new(&dir, options.config.ipc.poll_interval())?;
      let task = tokio::spawn(read_commands(reader, commands, reader_cancel.clone(), cancel.clone()));
      lifecycle = lifecycle.with_hook(Arc::new(TaskHook::new(
        "command-reader",
        reader_cancel,
        task,
        TASK_SHUTDOWN_TIMEOUT,
      )));
    }

    lifecycle.startup().await?;

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
      tokio::select! {
        result = signal::ctrl_c() => match result {
          Ok(()) => {
            info!("Received ctrl-c, shutting down...");
            cancel_for_signal.cancel();
          }
          Err(e) => warn!("Failed to listen for ctrl-c: {}", e),
        },
        _ = cancel_for_signal.cancelled() => {}
      }
    });

    cancel.cancelled().await;
    info!("Shutting down...");
    lifecycle.shutdown().await;
    info!("Daemon shutdown complete");
    Ok(())
  }
}

async fn read_commands(
  reader: IpcCommandReader,
  commands: ActorRef<CommandEvent>,
  reader_cancel: CancellationToken,
  daemon_cancel: CancellationToken,
) {
  let mut target = CommandListenerProxy::new(commands);
  match reader.run(&mut target, &reader_cancel).await {
    Ok(count) => debug!(commands = count, "Command reader finished"),
    Err(e) => {
      // Corrupt command input leaves the daemon unable to follow the launcher
      error!(error = %e, "Command directory unreadable, shutting down");
      daemon_cancel.cancel();
    }
  }
}

// ============================================================================
// Launcher connection
// ============================================================================

/// Forwards commands from the network into the command actor.
struct LauncherConnection {
  commands: ActorRef<CommandEvent>,
  cancel: CancellationToken,
}

impl MessageSender<NetworkEvent<CommandEvent, SuiteEvent>> for LauncherConnection {
  fn send(&self, event: NetworkEvent<CommandEvent, SuiteEvent>) {
    match event {
      NetworkEvent::Connected { connection, .. } => debug!(peer = %connection.peer, "Serving launcher"),
      NetworkEvent::Message(command) => self.commands.tell(command),
      NetworkEvent::Disconnected => {
        info!("Launcher disconnected");
        self.cancel.cancel();
      }
    }
  }
}

// ============================================================================
// Command actor
// ============================================================================

struct DaemonCommands {
  thread: ActorThread,
  results: SuiteSink,
  properties: BTreeMap<String, String>,
  suite: Option<SuiteHandle>,
  cancel: CancellationToken,
}

impl CommandListener for DaemonCommands {
  fn run_tests(&mut self, config: SuiteConfiguration) {
    if let Some(suite) = &self.suite
      && suite.phase() != SuitePhase::Done
    {
      let message = "A suite is already running; ignoring run request";
      warn!("{}", message);
      SuiteListenerProxy::new(Arc::clone(&self.results))
        .on_internal_error(message, &StackTrace::new("DaemonError", Some(message.to_string())));
      return;
    }

    let drivers = CommandDriverFactory::new(config.test_args.clone()).with_env(self.properties.clone());
    let runner = SuiteRunner::new(
      Arc::new(drivers),
      Arc::clone(&self.results),
      self.thread.clone(),
      Arc::new(BlockingExecutor::current()),
    );
    self.suite = Some(runner.start(config, Arc::new(GlobTestFileFinder)));
  }

  fn shutdown(&mut self) {
    match self.suite.clone() {
      Some(mut suite) if suite.phase() != SuitePhase::Done => {
        info!("Shutdown requested, waiting for the running suite");
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
          suite.finished().await;
          cancel.cancel();
        });
      }
      _ => {
        info!("Shutdown requested");
        self.cancel.cancel();
      }
    }
  }
}

#[cfg(all(test, unix))]
mod tests {
  use std::os::unix::fs::PermissionsExt;

  use pretty_assertions::assert_eq;
  use tempfile::TempDir;
  use tokio::{process::Child, sync::mpsc};

  use super::*;
  use crate::{
    actor::Envelope,
    domain::config::{CommandTransport, IpcConfig, LauncherConfig},
    launcher::{DaemonCommand, LaunchError, LaunchOptions, Launcher, ProcessStarter},
    suite::SuiteSummary,
  };

  /// Runs the daemon in this process; the child is only a stand-in.
  struct InProcessDaemon {
    done: mpsc::UnboundedSender<Result<(), String>>,
  }

  impl ProcessStarter for InProcessDaemon {
    fn start(&self, command: &DaemonCommand) -> Result<Child, LaunchError> {
      let options = DaemonOptions {
        launcher_port: command.launcher_port,
        command_dir: command.command_dir.clone(),
        log_actor_messages: command.log_actor_messages,
        properties: command.properties.clone(),
        config: Config::default(),
      };
      let done = self.done.clone();
      tokio::spawn(async move {
        let result = Daemon::new(options).run().await.map_err(|e| e.to_string());
        let _ = done.send(result);
      });
      tokio::process::Command::new("sleep")
        .arg("30")
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| LaunchError::Spawn(e.to_string()))
    }
  }

  fn script(dir: &TempDir, name: &str, body: &str) {
    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  }

  async fn run_suite(transport: CommandTransport) {
    let tests = TempDir::new().unwrap();
    script(&tests, "pass_test", "exit 0");
    script(&tests, "fail_test", "echo \"mode was $VOLLEY_MODE\" >&2\nexit 1");
    script(&tests, "helper.sh", "exit 1");
    let home = TempDir::new().unwrap();

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let launcher = Launcher::new().with_process_starter(Arc::new(InProcessDaemon { done: done_tx }));
    let options = LaunchOptions {
      executable: "volley".into(),
      working_dir: tests.path().to_path_buf(),
      home_dir: home.path().to_path_buf(),
      launcher: LauncherConfig {
        command_transport: transport,
        properties: BTreeMap::from([("VOLLEY_MODE".to_string(), "strict".to_string())]),
        ..LauncherConfig::default()
      },
      ipc: IpcConfig {
        poll_interval_ms: 1,
        ..IpcConfig::default()
      },
      args: vec![],
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SuiteEvent>();
    let mut session = launcher.launch(options, Arc::new(events_tx)).await.unwrap();
    session.await_connection(Duration::from_secs(5)).await.unwrap();
    session
      .run_tests(SuiteConfiguration {
        base_dir: tests.path().to_path_buf(),
        include_pattern: "*_test".into(),
        test_args: vec![],
      })
      .unwrap();

    let mut summary = SuiteSummary::new();
    let collect = async {
      while let Some(event) = events_rx.recv().await {
        let last = event == SuiteEvent::SuiteFinished;
        event.deliver(&mut summary);
        if last {
          break;
        }
      }
    };
    tokio::time::timeout(Duration::from_secs(10), collect).await.unwrap();

    assert_eq!(summary.summary_line(), "Pass: 1, Fail: 1, Total: 2");
    assert_eq!(summary.files_finished(), 2);
    assert_eq!(summary.failures()[0].trace.frames, vec!["mode was strict".to_string()]);

    session.shutdown(Duration::from_secs(1)).await;
    let daemon_result = tokio::time::timeout(Duration::from_secs(10), done_rx.recv()).await.unwrap();
    assert_eq!(daemon_result, Some(Ok(())));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_suite_over_the_command_directory() {
    run_suite(CommandTransport::Ipc).await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_suite_over_the_network() {
    run_suite(CommandTransport::Network).await;
  }

  #[tokio::test]
  async fn test_missing_launcher_is_a_connect_error() {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = Daemon::new(DaemonOptions {
      launcher_port: port,
      ..DaemonOptions::default()
    })
    .run()
    .await;

    assert!(matches!(result, Err(DaemonError::Connect(_))));
  }
}
