//! CLI command implementations

mod config;
mod daemon;
mod run;

pub use config::{cmd_config_init, cmd_config_reset, cmd_config_show};
pub use daemon::{DaemonArgs, cmd_daemon};
pub use run::{RunArgs, cmd_run};
