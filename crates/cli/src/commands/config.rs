//! Configuration commands

use anyhow::{Context, Result};
use tracing::error;
use volley::config::Config;

/// Show effective configuration
pub async fn cmd_config_show() -> Result<()> {
  let cwd = std::env::current_dir()?;
  let config = Config::load_for_project(&cwd);

  // Check which config file is being used
  let project_config = Config::project_config_path(&cwd);
  let user_config = Config::user_config_path();

  println!("Effective configuration for: {:?}", cwd);
  println!();

  if project_config.exists() {
    println!("Using project config: {:?}", project_config);
  } else if let Some(ref user_path) = user_config
    && user_path.exists()
  {
    println!("Using user config: {:?}", user_path);
  } else {
    println!("Using default configuration (no config file found)");
  }
  println!();

  println!("{}", config.to_toml()?);

  Ok(())
}

/// Initialize project configuration file
pub async fn cmd_config_init() -> Result<()> {
  let cwd = std::env::current_dir()?;
  let config_path = Config::project_config_path(&cwd);

  if config_path.exists() {
    error!("Config file already exists: {:?}", config_path);
    println!("Delete it first if you want to regenerate");
    std::process::exit(1);
  }

  std::fs::write(&config_path, Config::generate_template())
    .with_context(|| format!("Failed to write {:?}", config_path))?;

  println!("Created project config: {:?}", config_path);
  println!("Edit the file to customize settings.");

  Ok(())
}

/// Reset user configuration to defaults
pub async fn cmd_config_reset() -> Result<()> {
  let Some(user_config_path) = Config::user_config_path() else {
    error!("Could not determine user config path");
    std::process::exit(1);
  };

  if let Some(parent) = user_config_path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  std::fs::write(&user_config_path, Config::generate_template())?;
  println!("Reset user config to defaults: {:?}", user_config_path);

  Ok(())
}
