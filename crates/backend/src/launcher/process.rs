//! Daemon process: command line, spawning and output relay

use std::{
  collections::BTreeMap,
  path::PathBuf,
  process::Stdio,
  sync::Arc,
  time::Duration,
};

use tokio::{
  io::{AsyncBufReadExt, AsyncRead, BufReader},
  process::{Child, Command},
  task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use super::LaunchError;
use crate::actor::MessageSender;

// ============================================================================
// Command line
// ============================================================================

/// Everything needed to start a daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonCommand {
  pub executable: PathBuf,
  pub working_dir: PathBuf,
  /// Placed before the `daemon` subcommand
  pub runtime_options: Vec<String>,
  pub properties: BTreeMap<String, String>,
  pub launcher_port: u16,
  pub command_dir: Option<PathBuf>,
  pub log_actor_messages: bool,
  /// Appended after all daemon flags
  pub args: Vec<String>,
}

impl DaemonCommand {
  /// `<runtime options> daemon --launcher-port N [--command-dir D]
  /// [--log-actor-messages] [--property K=V]... [args]...`
  pub fn to_args(&self) -> Vec<String> {
    let mut args = self.runtime_options.clone();
    args.push("daemon".into());
    args.push("--launcher-port".into());
    args.push(self.launcher_port.to_string());
    if let Some(dir) = &self.command_dir {
      args.push("--command-dir".into());
      args.push(dir.to_string_lossy().into_owned());
    }
    if self.log_actor_messages {
      args.push("--log-actor-messages".into());
    }
    for (key, value) in &self.properties {
      args.push("--property".into());
      args.push(format!("{}={}", key, value));
    }
    args.extend(self.args.iter().cloned());
    args
  }
}

// ============================================================================
// Process starting
// ============================================================================

/// Starts daemon processes.
pub trait ProcessStarter: Send + Sync {
  fn start(&self, command: &DaemonCommand) -> Result<Child, LaunchError>;
}

/// Runs the daemon as a child process with piped output.
///
/// The child is killed if its handle is dropped, so a launcher that goes
/// away never leaves a daemon behind.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessStarter;

impl ProcessStarter for SystemProcessStarter {
  fn start(&self, command: &DaemonCommand) -> Result<Child, LaunchError> {
    let args = command.to_args();
    debug!(executable = ?command.executable, ?args, "Spawning daemon");

    let child = Command::new(&command.executable)
      .args(&args)
      .current_dir(&command.working_dir)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| LaunchError::Spawn(format!("{:?}: {}", command.executable, e)))?;

    info!(pid = ?child.id(), port = command.launcher_port, "Daemon process started");
    Ok(child)
  }
}

// ============================================================================
// Output relay
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
  Stdout,
  Stderr,
}

/// One line of daemon output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
  pub stream: OutputStream,
  pub line: String,
}

/// Relays daemon output into the launcher's log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOutputSink;

impl MessageSender<OutputLine> for LogOutputSink {
  fn send(&self, output: OutputLine) {
    match output.stream {
      OutputStream::Stdout => info!(target: "volley::daemon", "{}", output.line),
      OutputStream::Stderr => warn!(target: "volley::daemon", "{}", output.line),
    }
  }
}

/// Background tasks copying a child's stdout and stderr, line by line.
///
/// Each task ends when its stream closes, which happens when the child exits.
pub struct OutputCopier {
  tasks: Vec<JoinHandle<u64>>,
}

impl OutputCopier {
  /// Take the child's piped streams and start copying them into `sink`.
  pub fn start(child: &mut Child, sink: Arc<dyn MessageSender<OutputLine>>) -> Self {
    let mut tasks = Vec::new();
    if let Some(stdout) = child.stdout.take() {
      tasks.push(tokio::spawn(copy_lines(stdout, OutputStream::Stdout, Arc::clone(&sink))));
    }
    if let Some(stderr) = child.stderr.take() {
      tasks.push(tokio::spawn(copy_lines(stderr, OutputStream::Stderr, sink)));
    }
    Self { tasks }
  }

  /// Wait for the copiers to reach end of stream; abort them after `timeout`.
  pub async fn join(self, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    for mut task in self.tasks {
      match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(Ok(lines)) => trace!(lines, "Output copier finished"),
        Ok(Err(e)) => warn!(error = %e, "Output copier failed"),
        Err(_) => {
          warn!("Output copier did not finish in time, aborting");
          task.abort();
        }
      }
    }
  }
}

async fn copy_lines<R>(reader: R, stream: OutputStream, sink: Arc<dyn MessageSender<OutputLine>>) -> u64
where
  R: AsyncRead + Unpin,
{
  let mut lines = BufReader::new(reader).lines();
  let mut copied = 0u64;
  loop {
    match lines.next_line().await {
      Ok(Some(line)) => {
        copied += 1;
        sink.send(OutputLine { stream, line });
      }
      Ok(None) => break,
      Err(e) => {
        warn!(?stream, error = %e, "Failed to read daemon output");
        break;
      }
    }
  }
  copied
}
