//! Test helpers for launcher scenarios.

use std::{
  net::{Ipv4Addr, SocketAddr},
  path::Path,
  process::Stdio,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::{
  actor::{MessageLog, MessageSender},
  domain::{
    config::{CommandTransport, IpcConfig, LauncherConfig},
    suite::SuiteConfiguration,
  },
  events::{CommandEvent, CommandListener, SuiteEvent},
  ipc::{CommandDir, IpcCommandReader},
  launcher::{DaemonCommand, LaunchError, LaunchOptions, ProcessStarter},
  network::{NetworkEvent, NetworkSender, connect},
};

pub fn options(home: &Path, transport: CommandTransport) -> LaunchOptions {
  LaunchOptions {
    executable: "volley".into(),
    working_dir: home.to_path_buf(),
    home_dir: home.to_path_buf(),
    launcher: LauncherConfig {
      command_transport: transport,
      ..LauncherConfig::default()
    },
    ipc: IpcConfig {
      segment_capacity: 1024,
      poll_interval_ms: 1,
      ..IpcConfig::default()
    },
    args: vec![],
  }
}

/// A child process that stays alive until killed.
pub fn idle_child() -> Result<Child, LaunchError> {
  Command::new("sleep")
    .arg("30")
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .spawn()
    .map_err(|e| LaunchError::Spawn(e.to_string()))
}

/// Starts a shell snippet instead of a daemon, counting invocations.
pub struct ShellStarter {
  pub script: &'static str,
  pub started: Arc<AtomicUsize>,
}

impl ShellStarter {
  pub fn new(script: &'static str) -> Self {
    Self {
      script,
      started: Arc::new(AtomicUsize::new(0)),
    }
  }
}

impl ProcessStarter for ShellStarter {
  fn start(&self, _command: &DaemonCommand) -> Result<Child, LaunchError> {
    self.started.fetch_add(1, Ordering::SeqCst);
    Command::new("sh")
      .args(["-c", self.script])
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| LaunchError::Spawn(e.to_string()))
  }
}

// ============================================================================
// In-process daemon double
// ============================================================================

/// Answers commands the way a daemon would, without running anything.
struct FakeCommands {
  log: MessageLog<CommandEvent>,
  results: NetworkSender<SuiteEvent>,
  cancel: CancellationToken,
}

impl CommandListener for FakeCommands {
  fn run_tests(&mut self, config: SuiteConfiguration) {
    self.log.send(CommandEvent::RunTests(config));
    self.results.send(SuiteEvent::SuiteStarted);
    self.results.send(SuiteEvent::AllTestFilesFound);
    self.results.send(SuiteEvent::SuiteFinished);
  }

  fn shutdown(&mut self) {
    self.log.send(CommandEvent::Shutdown);
    self.cancel.cancel();
  }
}

/// Network endpoint feeding [`FakeCommands`].
struct FakeEndpoint {
  commands: std::sync::Mutex<FakeCommands>,
}

impl MessageSender<NetworkEvent<CommandEvent, SuiteEvent>> for FakeEndpoint {
  fn send(&self, event: NetworkEvent<CommandEvent, SuiteEvent>) {
    if let NetworkEvent::Message(command) = event {
      let mut commands = self.commands.lock().unwrap();
      match command {
        CommandEvent::RunTests(config) => commands.run_tests(config),
        CommandEvent::Shutdown => commands.shutdown(),
      }
    }
  }
}

/// Connects back in-process and records the commands it receives over
/// either transport.
#[derive(Default)]
pub struct FakeDaemonStarter {
  pub commands: MessageLog<CommandEvent>,
}

impl ProcessStarter for FakeDaemonStarter {
  fn start(&self, command: &DaemonCommand) -> Result<Child, LaunchError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, command.launcher_port));
    let command_dir = command.command_dir.clone();
    let log = self.commands.clone();

    tokio::spawn(async move {
      let pending = connect::<CommandEvent, SuiteEvent>(addr).await.unwrap();
      let cancel = CancellationToken::new();
      let make_commands = || FakeCommands {
        log: log.clone(),
        results: pending.sender(),
        cancel: cancel.clone(),
      };

      if let Some(dir) = command_dir {
        let mut commands = make_commands();
        let cancel = cancel.clone();
        tokio::spawn(async move {
          let dir = CommandDir::open(dir).unwrap();
          let reader = IpcCommandReader::new(&dir, Duration::from_millis(1)).unwrap();
          reader.run(&mut commands, &cancel).await.unwrap();
        });
      }

      let endpoint = Arc::new(FakeEndpoint {
        commands: std::sync::Mutex::new(make_commands()),
      });
      pending.run(endpoint, cancel).await
    });

    idle_child()
  }
}
