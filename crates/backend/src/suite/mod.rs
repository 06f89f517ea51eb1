//! Suite orchestration - discovery, per-file workers, completion, summary
//!
//! # Architecture
//!
//! ```text
//! TestFileFinder (worker) ──FinderEvent──▶ SuiteRunner (actor)
//!                                            │ per file
//!                                            ▼
//!                  file WorkerCounter ─▶ InternalErrorReportingExecutor ─▶ suite WorkerCounter ─▶ blocking pool
//!                          │                                                      │
//!                   FireTestFileFinished (actor)                        FireSuiteFinished (actor)
//! ```
//!
//! Every listener that reports completion lives on the same actor thread as
//! the runner, so a file's "finished" event is always queued before the
//! suite's.

mod driver;
mod executor;
mod finder;
mod runner;
mod summary;

#[cfg(test)]
mod __tests__;

pub use driver::{CommandDriverFactory, DriverFactory};
pub use executor::InternalErrorReportingExecutor;
pub use finder::{GlobTestFileFinder, TestFileFinder};
pub use runner::{SuiteHandle, SuitePhase, SuiteRunner};
pub use summary::{ReportedFailure, SuiteSummary, TestOutcome};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SuiteError {
  #[error("Invalid include pattern '{pattern}': {message}")]
  Pattern { pattern: String, message: String },
  #[error("Failed to search for test files: {0}")]
  Walk(String),
}
