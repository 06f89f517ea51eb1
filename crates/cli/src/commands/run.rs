//! Run command: launch a daemon, run the suite in it, report

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow};
use tokio::sync::mpsc;
use tracing::{error, warn};
use volley::{
  actor::Envelope,
  config::{CommandTransport, Config},
  events::{SuiteEvent, SuiteListener},
  launcher::{LaunchOptions, Launcher},
};

use crate::report::ConsoleReporter;

/// Overrides given on the command line
pub struct RunArgs {
  pub base_dir: Option<PathBuf>,
  pub include: Option<String>,
  pub transport: Option<String>,
  pub log_actor_messages: bool,
  pub log_level: Option<String>,
  pub test_args: Vec<String>,
}

impl RunArgs {
  fn apply(self, config: &mut Config) -> Result<()> {
    if let Some(base_dir) = self.base_dir {
      config.suite.base_dir = base_dir;
    }
    if let Some(include) = self.include {
      config.suite.include_pattern = include;
    }
    if let Some(transport) = self.transport {
      config.launcher.command_transport = transport.parse::<CommandTransport>().map_err(|e| anyhow!(e))?;
    }
    if self.log_actor_messages {
      config.launcher.log_actor_messages = true;
    }
    if let Some(level) = self.log_level {
      // The daemon gets the same verbosity as the launcher
      config.launcher.runtime_options.push("--log-level".into());
      config.launcher.runtime_options.push(level);
    }
    if !self.test_args.is_empty() {
      config.suite.test_args = self.test_args;
    }
    Ok(())
  }
}

/// Run the configured suite in a fresh daemon
pub async fn cmd_run(args: RunArgs) -> Result<()> {
  let cwd = std::env::current_dir()?;
  let mut config = Config::load_for_project(&cwd);
  args.apply(&mut config)?;
  config.validate()?;

  let options = LaunchOptions::current_exe(config.launcher.clone(), config.ipc.clone())?;
  let (tx, mut rx) = mpsc::unbounded_channel::<SuiteEvent>();

  let mut session = Launcher::new()
    .launch(options, Arc::new(tx))
    .await
    .context("Failed to launch daemon")?;

  if let Err(e) = session.await_connection(config.launcher.connect_timeout()).await {
    session.shutdown(config.launcher.shutdown_timeout()).await;
    return Err(e).context("Daemon did not start");
  }

  session.run_tests(config.suite.to_suite_configuration())?;

  let mut reporter = ConsoleReporter::new();
  let mut interrupted = false;
  loop {
    tokio::select! {
      event = rx.recv() => match event {
        Some(event) => {
          let done = event == SuiteEvent::SuiteFinished;
          event.deliver(&mut reporter as &mut dyn SuiteListener);
          if done {
            break;
          }
        }
        None => break,
      },
      _ = session.closed() => {
        // Events forwarded before the disconnect are still queued
        while let Ok(event) = rx.try_recv() {
          event.deliver(&mut reporter as &mut dyn SuiteListener);
        }
        if !reporter.summary().is_finished() {
          error!("Daemon disconnected before the suite finished");
        }
        break;
      }
      _ = tokio::signal::ctrl_c() => {
        warn!("Interrupted, stopping daemon");
        interrupted = true;
        break;
      }
    }
  }

  if let Some(status) = session.shutdown(config.launcher.shutdown_timeout()).await
    && !status.success()
  {
    warn!(%status, "Daemon exited abnormally");
  }

  reporter.print_summary();

  let summary = reporter.summary();
  if interrupted || !summary.is_finished() || summary.has_failures() {
    std::process::exit(1);
  }
  Ok(())
}
