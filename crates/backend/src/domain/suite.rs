//! Suite domain types - test files, test ids, stack traces, suite configuration

use std::{
  backtrace::Backtrace,
  fmt,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Test files
// ============================================================================

/// A discovered unit of work, identified by its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestFile(String);

impl TestFile {
  pub fn new(path: impl Into<String>) -> Self {
    Self(path.into())
  }

  pub fn from_path(path: &Path) -> Self {
    Self(path.to_string_lossy().into_owned())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn to_path(&self) -> PathBuf {
    PathBuf::from(&self.0)
  }

  /// File name without directories, for display
  pub fn short_name(&self) -> &str {
    Path::new(&self.0)
      .file_name()
      .and_then(|n| n.to_str())
      .unwrap_or(&self.0)
  }
}

impl fmt::Display for TestFile {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

// ============================================================================
// Test ids
// ============================================================================

/// Position of a test inside its test file's test tree.
///
/// The root test is the empty path; `[0, 1]` is the second child of the first
/// child of the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TestId(Vec<u32>);

impl TestId {
  pub const ROOT: TestId = TestId(Vec::new());

  pub fn of(path: &[u32]) -> Self {
    Self(path.to_vec())
  }

  pub fn path(&self) -> &[u32] {
    &self.0
  }

  pub fn is_root(&self) -> bool {
    self.0.is_empty()
  }

  pub fn depth(&self) -> usize {
    self.0.len()
  }

  pub fn child(&self, index: u32) -> Self {
    let mut path = self.0.clone();
    path.push(index);
    Self(path)
  }

  pub fn parent(&self) -> Option<Self> {
    let (_, parent) = self.0.split_last()?;
    Some(Self(parent.to_vec()))
  }

  /// True if `self` is a strict ancestor of `other`
  pub fn is_ancestor_of(&self, other: &TestId) -> bool {
    other.0.len() > self.0.len() && other.0.starts_with(&self.0)
  }
}

impl fmt::Display for TestId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "TestId(")?;
    for (i, index) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{}", index)?;
    }
    write!(f, ")")
  }
}

// ============================================================================
// Stack traces
// ============================================================================

/// A failure description that can cross process boundaries.
///
/// Causes nest arbitrarily deep, like exception chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTrace {
  /// Error type, e.g. `panic` or `ExitStatus`
  pub kind: String,
  pub message: Option<String>,
  pub frames: Vec<String>,
  pub cause: Option<Box<StackTrace>>,
}

impl StackTrace {
  pub fn new(kind: impl Into<String>, message: Option<String>) -> Self {
    Self {
      kind: kind.into(),
      message,
      frames: Vec::new(),
      cause: None,
    }
  }

  /// Capture the current call stack as frames.
  pub fn capture(kind: impl Into<String>, message: Option<String>) -> Self {
    let frames = Backtrace::force_capture()
      .to_string()
      .lines()
      .map(|line| line.trim().to_string())
      .filter(|line| !line.is_empty())
      .collect();
    Self {
      frames,
      ..Self::new(kind, message)
    }
  }

  pub fn with_frames(mut self, frames: Vec<String>) -> Self {
    self.frames = frames;
    self
  }

  pub fn with_cause(mut self, cause: StackTrace) -> Self {
    self.cause = Some(Box::new(cause));
    self
  }

  /// Length of the cause chain, including `self`
  pub fn chain_len(&self) -> usize {
    1 + self.cause.as_ref().map_or(0, |c| c.chain_len())
  }
}

impl fmt::Display for StackTrace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.message {
      Some(message) => writeln!(f, "{}: {}", self.kind, message)?,
      None => writeln!(f, "{}", self.kind)?,
    }
    for frame in &self.frames {
      writeln!(f, "\tat {}", frame)?;
    }
    if let Some(cause) = &self.cause {
      write!(f, "Caused by: {}", cause)?;
    }
    Ok(())
  }
}

// ============================================================================
// Suite configuration
// ============================================================================

/// What the daemon should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteConfiguration {
  /// Directory the include pattern is relative to
  pub base_dir: PathBuf,
  /// Glob pattern selecting test files
  pub include_pattern: String,
  /// Extra arguments passed to every test file
  pub test_args: Vec<String>,
}

impl Default for SuiteConfiguration {
  fn default() -> Self {
    Self {
      base_dir: PathBuf::from("."),
      include_pattern: "**/*_test".to_string(),
      test_args: Vec::new(),
    }
  }
}
