//! Daemon command

use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};
use volley::{Daemon, DaemonOptions, config::Config};

/// Arguments the launcher puts on the daemon's command line
pub struct DaemonArgs {
  pub launcher_port: u16,
  pub command_dir: Option<PathBuf>,
  pub log_actor_messages: bool,
  pub properties: BTreeMap<String, String>,
  pub args: Vec<String>,
}

/// Start the daemon and connect back to the launcher
pub async fn cmd_daemon(args: DaemonArgs) -> Result<()> {
  let cwd = std::env::current_dir()?;
  let config = Config::load_for_project(&cwd);

  if !args.args.is_empty() {
    warn!(args = ?args.args, "Ignoring extra daemon arguments");
  }

  info!(
    pid = std::process::id(),
    launcher_port = args.launcher_port,
    command_dir = ?args.command_dir,
    "Starting daemon"
  );

  Daemon::new(DaemonOptions {
    launcher_port: args.launcher_port,
    command_dir: args.command_dir,
    log_actor_messages: args.log_actor_messages,
    properties: args.properties,
    config,
  })
  .run()
  .await
  .context("Daemon failed")?;

  info!("Daemon stopped");
  Ok(())
}
