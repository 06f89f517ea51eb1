//! volley CLI - distributed test runner

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod logging;
mod report;

use commands::{DaemonArgs, RunArgs, cmd_config_init, cmd_config_reset, cmd_config_show, cmd_daemon, cmd_run};
use logging::{init_cli_logging, init_daemon_logging};

#[derive(Parser)]
#[command(name = "volley")]
#[command(about = "Run test files in a supervised worker daemon")]
#[command(after_help = "\
QUICK START:
  volley config init              # Initialize project config
  volley run                      # Run tests/**/*_test in a daemon
  volley run --include 'bin/*'    # Run a different set of files")]
struct Cli {
  /// Log level (error, warn, info, debug, trace)
  #[arg(long, global = true, value_name = "LEVEL")]
  log_level: Option<String>,

  #[command(subcommand)]
  command: Commands,
}

/// Subcommands for `volley config`
#[derive(Subcommand)]
pub enum ConfigCommand {
  /// Show effective configuration
  Show,
  /// Create .volley.toml in the current directory
  Init,
  /// Reset user configuration to defaults
  Reset,
}

#[derive(Subcommand)]
enum Commands {
  /// Launch a daemon and run the test suite in it
  Run {
    /// Directory test files are searched in
    #[arg(long)]
    base_dir: Option<PathBuf>,
    /// Glob selecting test files, relative to the base directory
    #[arg(short, long)]
    include: Option<String>,
    /// How commands reach the daemon (ipc or network)
    #[arg(long)]
    transport: Option<String>,
    /// Log every actor message inside the daemon
    #[arg(long)]
    log_actor_messages: bool,
    /// Arguments passed to every test file
    #[arg(last = true)]
    test_args: Vec<String>,
  },

  /// Run as a daemon connected to a launcher (started by `volley run`)
  #[command(hide = true)]
  Daemon {
    /// Launcher port on the loopback interface
    #[arg(long)]
    launcher_port: u16,
    /// Command directory to read launcher commands from
    #[arg(long)]
    command_dir: Option<PathBuf>,
    #[arg(long)]
    log_actor_messages: bool,
    /// Property exported to test files, as KEY=VALUE
    #[arg(long = "property", value_parser = parse_property)]
    properties: Vec<(String, String)>,
    /// Extra arguments from the launcher
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
  },

  /// Manage configuration
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
  match raw.split_once('=') {
    Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
    _ => Err(format!("expected KEY=VALUE, got {:?}", raw)),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let log_level = cli.log_level.as_deref();

  // Use file logging for daemon, console-only for other commands
  let _guard = match &cli.command {
    Commands::Daemon { .. } => {
      let cwd = std::env::current_dir()?;
      let config = volley::config::Config::load_for_project(&cwd);
      init_daemon_logging(&config.daemon, log_level)
    }
    _ => {
      init_cli_logging(log_level);
      None
    }
  };

  match cli.command {
    Commands::Run {
      base_dir,
      include,
      transport,
      log_actor_messages,
      test_args,
    } => {
      cmd_run(RunArgs {
        base_dir,
        include,
        transport,
        log_actor_messages,
        log_level: cli.log_level,
        test_args,
      })
      .await
    }
    Commands::Daemon {
      launcher_port,
      command_dir,
      log_actor_messages,
      properties,
      args,
    } => {
      cmd_daemon(DaemonArgs {
        launcher_port,
        command_dir,
        log_actor_messages,
        properties: properties.into_iter().collect(),
        args,
      })
      .await
    }
    Commands::Config { command } => match command {
      ConfigCommand::Show => cmd_config_show().await,
      ConfigCommand::Init => cmd_config_init().await,
      ConfigCommand::Reset => cmd_config_reset().await,
    },
  }
}
