//! Test file discovery

use glob::{MatchOptions, Pattern};
use tracing::{debug, trace};
use walkdir::WalkDir;

use super::SuiteError;
use crate::{
  domain::suite::{SuiteConfiguration, TestFile},
  events::TestFileFinderListener,
};

/// Reports the test files of a suite.
///
/// Implementations must call `on_all_test_files_found` exactly once when they
/// return `Ok`; on error the runner closes discovery itself.
pub trait TestFileFinder: Send + Sync {
  fn find_test_files(
    &self,
    config: &SuiteConfiguration,
    listener: &mut dyn TestFileFinderListener,
  ) -> Result<(), SuiteError>;
}

/// Walks `base_dir` and reports regular files whose path relative to it
/// matches the include pattern, in lexicographic order.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobTestFileFinder;

impl TestFileFinder for GlobTestFileFinder {
  fn find_test_files(
    &self,
    config: &SuiteConfiguration,
    listener: &mut dyn TestFileFinderListener,
  ) -> Result<(), SuiteError> {
    let pattern = Pattern::new(&config.include_pattern).map_err(|e| SuiteError::Pattern {
      pattern: config.include_pattern.clone(),
      message: e.to_string(),
    })?;
    let options = MatchOptions {
      require_literal_separator: true,
      ..MatchOptions::default()
    };

    let mut found = 0usize;
    for entry in WalkDir::new(&config.base_dir).follow_links(true).sort_by_file_name() {
      let entry = entry.map_err(|e| SuiteError::Walk(e.to_string()))?;
      if !entry.file_type().is_file() {
        continue;
      }

      let relative = entry.path().strip_prefix(&config.base_dir).unwrap_or(entry.path());
      if pattern.matches_path_with(relative, options) {
        trace!(path = ?entry.path(), "Found test file");
        listener.on_test_file_found(TestFile::from_path(entry.path()));
        found += 1;
      }
    }

    debug!(base_dir = ?config.base_dir, pattern = %config.include_pattern, found, "Test file discovery complete");
    listener.on_all_test_files_found();
    Ok(())
  }
}
