use std::path::{Path, PathBuf};

/// Get the default home directory for volley data (run directories, logs)
///
/// Respects the following environment variables (in order of precedence):
/// 1. VOLLEY_HOME - explicit home directory override
/// 2. XDG_DATA_HOME - standard XDG data home directory
/// 3. dirs::data_local_dir() - platform default
pub fn default_home_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("VOLLEY_HOME") {
    return PathBuf::from(dir);
  }

  if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
    return PathBuf::from(xdg_data).join("volley");
  }

  dirs::data_local_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("volley")
}

/// Get the default config directory
///
/// Respects the following environment variables (in order of precedence):
/// 1. CONFIG_DIR - explicit config directory override
/// 2. XDG_CONFIG_HOME - standard XDG config home directory
/// 3. dirs::config_dir() - platform default
pub fn default_config_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("CONFIG_DIR") {
    return PathBuf::from(dir);
  }

  if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
    return PathBuf::from(xdg_config).join("volley");
  }

  dirs::config_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("volley")
}

/// Directory for daemon log files
pub fn default_log_dir() -> PathBuf {
  default_home_dir().join("logs")
}

/// Create a fresh `<home>/runs/<uuid>` directory for one launch.
pub fn create_run_dir(home: &Path) -> std::io::Result<PathBuf> {
  let dir = home.join("runs").join(uuid::Uuid::new_v4().to_string());
  std::fs::create_dir_all(&dir)?;
  Ok(dir)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_run_dirs_are_unique() {
    let home = tempfile::TempDir::new().unwrap();

    let first = create_run_dir(home.path()).unwrap();
    let second = create_run_dir(home.path()).unwrap();

    assert!(first.is_dir());
    assert!(second.is_dir());
    assert_ne!(first, second);
    assert_eq!(first.parent(), Some(home.path().join("runs").as_path()));
  }

  #[test]
  fn test_run_dir_under_a_file_fails() {
    let home = tempfile::TempDir::new().unwrap();
    let blocker = home.path().join("blocker");
    std::fs::write(&blocker, "").unwrap();

    assert!(create_run_dir(&blocker).is_err());
  }
}
