//! Configuration system for volley with per-project overrides.
//!
//! Config priority: project-relative (.volley.toml) > user (~/.config/volley/config.toml)

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{actor::DrainPolicy, domain::suite::SuiteConfiguration};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed to read config {path:?}: {message}")]
  Io { path: PathBuf, message: String },
  #[error("Failed to parse config {path:?}: {message}")]
  Parse { path: PathBuf, message: String },
  #[error("Failed to render config: {0}")]
  Render(String),
  #[error("Invalid config: {0}")]
  Invalid(String),
}

// ============================================================================
// Launcher Configuration
// ============================================================================

/// How the launcher sends commands to the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandTransport {
  /// Segmented channel files in the run's command directory
  #[default]
  Ipc,
  /// The rendezvous TCP connection
  Network,
}

impl std::str::FromStr for CommandTransport {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "ipc" => Ok(CommandTransport::Ipc),
      "network" => Ok(CommandTransport::Network),
      _ => Err(format!("Invalid command transport: {}. Use ipc or network", s)),
    }
  }
}

/// Launcher-side process supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
  /// How long to wait for the daemon to connect back
  /// Default: 30
  pub connect_timeout_secs: u64,

  /// How long to wait for the daemon to exit after shutdown before killing it
  /// Default: 10
  pub shutdown_timeout_secs: u64,

  /// Transport for launcher → daemon commands: "ipc" or "network"
  pub command_transport: CommandTransport,

  /// Options placed before the daemon subcommand (e.g. ["--log-level", "debug"])
  pub runtime_options: Vec<String>,

  /// Properties handed to the daemon; exported to every test file as env vars
  pub properties: BTreeMap<String, String>,

  /// Ask the daemon to log every actor message
  pub log_actor_messages: bool,
}

impl Default for LauncherConfig {
  fn default() -> Self {
    Self {
      connect_timeout_secs: 30,
      shutdown_timeout_secs: 10,
      command_transport: CommandTransport::default(),
      runtime_options: Vec::new(),
      properties: BTreeMap::new(),
      log_actor_messages: false,
    }
  }
}

impl LauncherConfig {
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }

  pub fn shutdown_timeout(&self) -> Duration {
    Duration::from_secs(self.shutdown_timeout_secs)
  }
}

// ============================================================================
// IPC Configuration
// ============================================================================

/// Segmented channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
  /// Bytes per segment; fixed for the lifetime of a channel
  /// Default: 65536
  pub segment_capacity: usize,

  /// Maximum segments per channel (0 = unbounded)
  /// Default: 1024
  pub max_segments: usize,

  /// Reader poll interval while the channel is empty
  /// Default: 10
  pub poll_interval_ms: u64,
}

impl Default for IpcConfig {
  fn default() -> Self {
    Self {
      segment_capacity: 64 * 1024,
      max_segments: 1024,
      poll_interval_ms: 10,
    }
  }
}

impl IpcConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms.max(1))
  }

  pub fn max_segments(&self) -> Option<usize> {
    (self.max_segments > 0).then_some(self.max_segments)
  }
}

// ============================================================================
// Daemon Configuration
// ============================================================================

/// Daemon process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  /// Default: "info"
  #[serde(default = "default_log_level")]
  pub log_level: String,

  /// Log file rotation: "daily", "hourly", "never"
  /// Default: "daily"
  #[serde(default = "default_log_rotation")]
  pub log_rotation: String,

  /// What happens to queued actor messages on shutdown: "drain" or "discard"
  pub drain_policy: DrainPolicy,
}

fn default_log_level() -> String {
  "info".to_string()
}
fn default_log_rotation() -> String {
  "daily".to_string()
}

impl Default for DaemonConfig {
  fn default() -> Self {
    Self {
      log_level: default_log_level(),
      log_rotation: default_log_rotation(),
      drain_policy: DrainPolicy::default(),
    }
  }
}

// ============================================================================
// Suite Configuration
// ============================================================================

/// Default suite selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
  /// Directory test files are searched from
  pub base_dir: PathBuf,
  /// Glob pattern, relative to base_dir
  pub include_pattern: String,
  /// Arguments passed to every test file
  pub test_args: Vec<String>,
}

impl Default for SuiteConfig {
  fn default() -> Self {
    let defaults = SuiteConfiguration::default();
    Self {
      base_dir: defaults.base_dir,
      include_pattern: defaults.include_pattern,
      test_args: defaults.test_args,
    }
  }
}

impl SuiteConfig {
  pub fn to_suite_configuration(&self) -> SuiteConfiguration {
    SuiteConfiguration {
      base_dir: self.base_dir.clone(),
      include_pattern: self.include_pattern.clone(),
      test_args: self.test_args.clone(),
    }
  }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub launcher: LauncherConfig,
  pub ipc: IpcConfig,
  pub daemon: DaemonConfig,
  pub suite: SuiteConfig,
}

impl Config {
  /// Load config for a project, with fallback to user config.
  ///
  /// Unreadable or invalid files are logged and skipped.
  pub fn load_for_project(project_path: &Path) -> Self {
    let project_config = Self::project_config_path(project_path);
    if project_config.exists() {
      match Self::load_file(&project_config) {
        Ok(config) => return config,
        Err(e) => warn!("Ignoring project config: {}", e),
      }
    }

    if let Some(user_config_path) = Self::user_config_path()
      && user_config_path.exists()
    {
      match Self::load_file(&user_config_path) {
        Ok(config) => return config,
        Err(e) => warn!("Ignoring user config: {}", e),
      }
    }

    Self::default()
  }

  /// Load and validate a single config file
  pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
      path: path.to_path_buf(),
      message: e.to_string(),
    })?;
    let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
      path: path.to_path_buf(),
      message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    Some(crate::dirs::default_config_dir().join("config.toml"))
  }

  /// Get the project-relative config path
  pub fn project_config_path(project_path: &Path) -> PathBuf {
    project_path.join(".volley.toml")
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    // Header record plus framing overhead must fit in a segment
    if self.ipc.segment_capacity < 256 {
      return Err(ConfigError::Invalid(format!(
        "ipc.segment_capacity must be at least 256 bytes, got {}",
        self.ipc.segment_capacity
      )));
    }
    if self.launcher.connect_timeout_secs == 0 {
      return Err(ConfigError::Invalid("launcher.connect_timeout_secs must be positive".into()));
    }
    if self.suite.include_pattern.trim().is_empty() {
      return Err(ConfigError::Invalid("suite.include_pattern must not be empty".into()));
    }
    Ok(())
  }

  /// Render the effective configuration as TOML
  pub fn to_toml(&self) -> Result<String, ConfigError> {
    toml::to_string_pretty(self).map_err(|e| ConfigError::Render(e.to_string()))
  }

  /// Generate a default config file as a string
  pub fn generate_template() -> String {
    let defaults = Self::default();
    format!(
      r#"# volley configuration
# Place in .volley.toml (project) or ~/.config/volley/config.toml (user)

# ============================================================================
# Launcher
# ============================================================================

[launcher]
# Seconds to wait for the daemon to connect back before giving up
connect_timeout_secs = {connect_timeout}

# Seconds to wait for the daemon to exit after shutdown before killing it
shutdown_timeout_secs = {shutdown_timeout}

# Command transport: ipc (command directory) or network (rendezvous socket)
command_transport = "ipc"

# Options placed before the daemon subcommand
# runtime_options = ["--log-level", "debug"]

# Log every actor message inside the daemon (very verbose)
log_actor_messages = false

# Properties exported to every test file as environment variables
# [launcher.properties]
# DATABASE_URL = "postgres://localhost/test"

# ============================================================================
# IPC
# ============================================================================

[ipc]
# Bytes per channel segment
segment_capacity = {segment_capacity}

# Upper bound on segments per channel (0 = unbounded)
max_segments = {max_segments}

# Reader poll interval in milliseconds
poll_interval_ms = {poll_interval}

# ============================================================================
# Daemon
# ============================================================================

[daemon]
# Log level: off, error, warn, info, debug, trace
log_level = "info"

# Log file rotation: daily, hourly, never
log_rotation = "daily"

# Queued actor messages on shutdown: drain or discard
drain_policy = "drain"

# ============================================================================
# Suite
# ============================================================================

[suite]
base_dir = "."
include_pattern = "{include_pattern}"
# test_args = ["--quiet"]
"#,
      connect_timeout = defaults.launcher.connect_timeout_secs,
      shutdown_timeout = defaults.launcher.shutdown_timeout_secs,
      segment_capacity = defaults.ipc.segment_capacity,
      max_segments = defaults.ipc.max_segments,
      poll_interval = defaults.ipc.poll_interval_ms,
      include_pattern = defaults.suite.include_pattern,
    )
  }
}
