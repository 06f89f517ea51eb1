pub mod actor;
pub mod domain;
pub use domain::config;

pub mod dirs;
pub mod events;
pub mod ipc;
pub mod launcher;
pub mod lifecycle;
pub mod network;
pub mod suite;

mod daemon;
pub use daemon::{Daemon, DaemonError, DaemonOptions};
