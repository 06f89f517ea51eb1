//! Launcher side: start a daemon, wait for it to connect, drive a run
//!
//! # Lifecycle
//!
//! 1. Create `<home>/runs/<uuid>/` and, for the IPC transport, its command
//!    directory. Any failure here aborts before a process exists.
//! 2. Bind the daemon listener actor and listen on an ephemeral port that
//!    accepts exactly one connection.
//! 3. Spawn the daemon with the port on its command line and relay its output.
//! 4. [`DaemonSession::await_connection`] distinguishes a daemon that never
//!    connects from one that exits or disconnects.
//! 5. [`DaemonSession::shutdown`] asks the daemon to stop, waits (then kills),
//!    and tears down the relay, the listener and the actor thread.

mod process;

use std::{path::PathBuf, process::ExitStatus, sync::Arc, time::Duration};

use tokio::{process::Child, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use process::{
  DaemonCommand, LogOutputSink, OutputCopier, OutputLine, OutputStream, ProcessStarter, SystemProcessStarter,
};

use crate::{
  actor::{ActorThread, ActorThreadConfig, MessageSender},
  dirs,
  domain::{
    config::{CommandTransport, IpcConfig, LauncherConfig},
    suite::SuiteConfiguration,
  },
  events::{CommandEvent, SuiteEvent, SuiteSink},
  ipc::{ChannelOptions, CommandDir, IpcError, IpcSender},
  network::{
    NetworkConnection, NetworkEndpoint, NetworkError, NetworkEvent, NetworkSender, OneTimeEndpointFactory,
    listen_on_any_port,
  },
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
  #[error("Failed to prepare run directory: {0}")]
  Resource(String),
  #[error("Failed to start daemon: {0}")]
  Spawn(String),
  #[error("Daemon did not connect within {0:?}")]
  NeverConnected(Duration),
  #[error("Daemon exited before connecting ({0})")]
  DaemonExited(String),
  #[error("Daemon disconnected")]
  DaemonDisconnected,
  #[error(transparent)]
  Network(#[from] NetworkError),
  #[error(transparent)]
  Ipc(#[from] IpcError),
}

/// What the launcher knows about the daemon's connection
#[derive(Debug, Clone)]
pub enum ConnectionState {
  Waiting,
  Connected(NetworkSender<CommandEvent>),
  Disconnected,
}

/// Parameters of one launch
#[derive(Debug, Clone)]
pub struct LaunchOptions {
  /// Binary that understands the `daemon` subcommand
  pub executable: PathBuf,
  pub working_dir: PathBuf,
  /// Run directories are created under `<home>/runs`
  pub home_dir: PathBuf,
  pub launcher: LauncherConfig,
  pub ipc: IpcConfig,
  /// Extra arguments after the daemon flags
  pub args: Vec<String>,
}

impl LaunchOptions {
  /// Launch the current executable from the current directory.
  pub fn current_exe(launcher: LauncherConfig, ipc: IpcConfig) -> Result<Self, LaunchError> {
    let executable = std::env::current_exe().map_err(|e| LaunchError::Spawn(e.to_string()))?;
    let working_dir = std::env::current_dir().map_err(|e| LaunchError::Spawn(e.to_string()))?;
    Ok(Self {
      executable,
      working_dir,
      home_dir: dirs::default_home_dir(),
      launcher,
      ipc,
      args: Vec::new(),
    })
  }
}

// ============================================================================
// Daemon listener actor
// ============================================================================

/// Launcher's endpoint on the rendezvous connection.
///
/// Publishes the connection state and forwards every suite event to the
/// caller's sink.
struct DaemonListener {
  results: SuiteSink,
  state: watch::Sender<ConnectionState>,
}

impl NetworkEndpoint<SuiteEvent, CommandEvent> for DaemonListener {
  fn on_connected(&mut self, connection: NetworkConnection, sender: NetworkSender<CommandEvent>) {
    info!(peer = %connection.peer, "Daemon connection established");
    self.state.send_replace(ConnectionState::Connected(sender));
  }

  fn on_message(&mut self, message: SuiteEvent) {
    self.results.send(message);
  }

  fn on_disconnected(&mut self) {
    info!("Daemon connection closed");
    self.state.send_replace(ConnectionState::Disconnected);
  }
}

// ============================================================================
// Launcher
// ============================================================================

pub struct Launcher {
  starter: Arc<dyn ProcessStarter>,
  output: Arc<dyn MessageSender<OutputLine>>,
}

impl Default for Launcher {
  fn default() -> Self {
    Self::new()
  }
}

impl Launcher {
  pub fn new() -> Self {
    Self {
      starter: Arc::new(SystemProcessStarter),
      output: Arc::new(LogOutputSink),
    }
  }

  pub fn with_process_starter(mut self, starter: Arc<dyn ProcessStarter>) -> Self {
    self.starter = starter;
    self
  }

  pub fn with_output_sink(mut self, output: Arc<dyn MessageSender<OutputLine>>) -> Self {
    self.output = output;
    self
  }

  /// Start a daemon whose suite events go to `results`.
  pub async fn launch(&self, options: LaunchOptions, results: SuiteSink) -> Result<DaemonSession, LaunchError> {
    let run_dir = dirs::create_run_dir(&options.home_dir)
      .map_err(|e| LaunchError::Resource(format!("{:?}: {}", options.home_dir.join("runs"), e)))?;
    let transport = options.launcher.command_transport;
    let command_dir = match transport {
      CommandTransport::Ipc => Some(
        CommandDir::create(run_dir.join("commands"), options.ipc.segment_capacity)
          .map_err(|e| LaunchError::Resource(e.to_string()))?,
      ),
      CommandTransport::Network => None,
    };
    let commands = match &command_dir {
      Some(dir) => {
        let writer = dir
          .command_writer(ChannelOptions {
            max_segments: options.ipc.max_segments(),
          })
          .map_err(|e| LaunchError::Resource(e.to_string()))?;
        Some(IpcSender::new(writer))
      }
      None => None,
    };

    let actor_thread = ActorThread::spawn(
      ActorThreadConfig::new("launcher").with_message_logging(options.launcher.log_actor_messages),
    );
    let (state_tx, state_rx) = watch::channel(ConnectionState::Waiting);
    let listener = actor_thread.bind::<NetworkEvent<SuiteEvent, CommandEvent>>(
      Box::new(DaemonListener {
        results,
        state: state_tx,
      }),
      "daemon-listener",
    );

    let cancel = CancellationToken::new();
    let factory = Arc::new(OneTimeEndpointFactory::new(Arc::new(listener)));
    let addr = match listen_on_any_port::<SuiteEvent, CommandEvent>(factory, cancel.clone()).await {
      Ok(addr) => addr,
      Err(e) => {
        actor_thread.shutdown().await;
        return Err(e.into());
      }
    };

    let command = DaemonCommand {
      executable: options.executable.clone(),
      working_dir: options.working_dir.clone(),
      runtime_options: options.launcher.runtime_options.clone(),
      properties: options.launcher.properties.clone(),
      launcher_port: addr.port(),
      command_dir: command_dir.as_ref().map(|d| d.path().to_path_buf()),
      log_actor_messages: options.launcher.log_actor_messages,
      args: options.args.clone(),
    };
    let mut child = match self.starter.start(&command) {
      Ok(child) => child,
      Err(e) => {
        cancel.cancel();
        actor_thread.shutdown().await;
        return Err(e);
      }
    };
    let copier = OutputCopier::start(&mut child, Arc::clone(&self.output));

    info!(run_dir = ?run_dir, port = addr.port(), ?transport, "Daemon launched");
    Ok(DaemonSession {
      child,
      copier: Some(copier),
      state: state_rx,
      commands,
      transport,
      cancel,
      actor_thread,
      run_dir,
    })
  }
}

// ============================================================================
// Session
// ============================================================================

/// A launched daemon.
pub struct DaemonSession {
  child: Child,
  copier: Option<OutputCopier>,
  state: watch::Receiver<ConnectionState>,
  commands: Option<IpcSender<CommandEvent>>,
  transport: CommandTransport,
  cancel: CancellationToken,
  actor_thread: ActorThread,
  run_dir: PathBuf,
}

impl DaemonSession {
  pub fn run_dir(&self) -> &std::path::Path {
    &self.run_dir
  }

  pub fn pid(&self) -> Option<u32> {
    self.child.id()
  }

  pub fn state(&self) -> ConnectionState {
    self.state.borrow().clone()
  }

  /// Wait until the daemon connects back.
  ///
  /// Fails with `NeverConnected` when the window elapses, `DaemonExited` when
  /// the process ends first, and `DaemonDisconnected` when the connection
  /// opened and closed (or failed its handshake).
  pub async fn await_connection(&mut self, timeout: Duration) -> Result<(), LaunchError> {
    tokio::select! {
      biased;

      state = self.state.wait_for(|s| !matches!(s, ConnectionState::Waiting)) => {
        match state.as_deref() {
          Ok(ConnectionState::Connected(_)) => {
            debug!("Daemon connected");
            Ok(())
          }
          _ => Err(LaunchError::DaemonDisconnected),
        }
      }

      status = self.child.wait() => {
        let status = status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string());
        warn!(%status, "Daemon exited before connecting");
        Err(LaunchError::DaemonExited(status))
      }

      _ = tokio::time::sleep(timeout) => {
        warn!(?timeout, "Daemon never connected");
        Err(LaunchError::NeverConnected(timeout))
      }
    }
  }

  fn send(&self, command: CommandEvent) -> Result<(), LaunchError> {
    match self.transport {
      CommandTransport::Ipc => {
        let commands = self.commands.as_ref().ok_or(LaunchError::Ipc(IpcError::Closed))?;
        commands.send(command);
        match commands.last_error() {
          Some(e) => Err(e.into()),
          None => Ok(()),
        }
      }
      CommandTransport::Network => match &*self.state.borrow() {
        ConnectionState::Connected(sender) if !sender.is_closed() => {
          sender.send(command);
          Ok(())
        }
        _ => Err(LaunchError::DaemonDisconnected),
      },
    }
  }

  /// Ask the daemon to run a suite.
  pub fn run_tests(&self, config: SuiteConfiguration) -> Result<(), LaunchError> {
    info!(base_dir = ?config.base_dir, pattern = %config.include_pattern, "Requesting test run");
    self.send(CommandEvent::RunTests(config))
  }

  /// Wait until no connection is open: it closed, or never opened.
  pub async fn closed(&mut self) {
    let _ = self
      .state
      .wait_for(|s| !matches!(s, ConnectionState::Connected(_)))
      .await;
  }

  /// Stop the daemon and release everything the launch created.
  ///
  /// Never blocks for longer than about twice `timeout`: a daemon that does
  /// not exit in time is killed.
  pub async fn shutdown(mut self, timeout: Duration) -> Option<ExitStatus> {
    if let Err(e) = self.send(CommandEvent::Shutdown) {
      debug!(error = %e, "Could not send shutdown command");
    }
    if let Some(commands) = self.commands.take()
      && let Err(e) = commands.close()
    {
      warn!(error = %e, "Failed to close command channel");
    }

    let status = match tokio::time::timeout(timeout, self.child.wait()).await {
      Ok(Ok(status)) => Some(status),
      Ok(Err(e)) => {
        warn!(error = %e, "Failed to wait for daemon");
        None
      }
      Err(_) => {
        warn!(?timeout, "Daemon did not exit in time, killing it");
        if let Err(e) = self.child.kill().await {
          warn!(error = %e, "Failed to kill daemon");
        }
        self.child.try_wait().ok().flatten()
      }
    };
    info!(status = ?status, "Daemon stopped");

    // Let the connection deliver what the daemon flushed before exiting
    if tokio::time::timeout(timeout, self.closed()).await.is_err() {
      debug!("Connection still open after daemon exit");
    }
    if let Some(copier) = self.copier.take() {
      copier.join(timeout).await;
    }
    self.cancel.cancel();
    self.actor_thread.shutdown().await;
    status
  }
}

#[cfg(test)]
mod __tests__;
