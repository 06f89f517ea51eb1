//! Launcher-side result accounting

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::{
  domain::suite::{StackTrace, TestFile, TestId},
  events::SuiteListener,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
  Passed,
  Failed,
}

#[derive(Debug, Default)]
struct TestRecord {
  name: String,
  failures: Vec<StackTrace>,
  started: bool,
  finished: bool,
}

/// A failure ready for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedFailure {
  pub file: TestFile,
  pub id: TestId,
  pub name: String,
  pub trace: StackTrace,
}

/// Counts results as they arrive.
///
/// Each distinct `(file, id)` is one test no matter how often it is reported.
/// A test counts towards the totals when it is a leaf of its file's test tree
/// or when it failed itself; a parent whose only problem is a failing child
/// is not counted a second time.
#[derive(Debug, Default)]
pub struct SuiteSummary {
  tests: BTreeMap<(TestFile, TestId), TestRecord>,
  parents: BTreeSet<(TestFile, TestId)>,
  failures: Vec<ReportedFailure>,
  internal_errors: Vec<(String, StackTrace)>,
  files_found: usize,
  files_finished: usize,
  suite_started: bool,
  suite_finished: bool,
}

impl SuiteSummary {
  pub fn new() -> Self {
    Self::default()
  }

  fn counted(&self) -> impl Iterator<Item = &TestRecord> {
    self
      .tests
      .iter()
      .filter(|(key, record)| !self.parents.contains(*key) || !record.failures.is_empty())
      .map(|(_, record)| record)
  }

  pub fn pass_count(&self) -> usize {
    self.counted().filter(|r| r.failures.is_empty()).count()
  }

  pub fn fail_count(&self) -> usize {
    self.counted().filter(|r| !r.failures.is_empty()).count()
  }

  pub fn total(&self) -> usize {
    self.counted().count()
  }

  pub fn summary_line(&self) -> String {
    format!(
      "Pass: {}, Fail: {}, Total: {}",
      self.pass_count(),
      self.fail_count(),
      self.total()
    )
  }

  pub fn outcome(&self, file: &TestFile, id: &TestId) -> Option<TestOutcome> {
    self.tests.get(&(file.clone(), id.clone())).map(|r| {
      if r.failures.is_empty() {
        TestOutcome::Passed
      } else {
        TestOutcome::Failed
      }
    })
  }

  /// Failures in the order their tests finished
  pub fn failures(&self) -> &[ReportedFailure] {
    &self.failures
  }

  pub fn internal_errors(&self) -> &[(String, StackTrace)] {
    &self.internal_errors
  }

  /// True when something failed, including problems outside of any test
  pub fn has_failures(&self) -> bool {
    self.fail_count() > 0 || !self.internal_errors.is_empty()
  }

  pub fn files_found(&self) -> usize {
    self.files_found
  }

  pub fn files_finished(&self) -> usize {
    self.files_finished
  }

  pub fn is_started(&self) -> bool {
    self.suite_started
  }

  pub fn is_finished(&self) -> bool {
    self.suite_finished
  }

  fn record(&mut self, file: &TestFile, id: &TestId) -> &mut TestRecord {
    self.tests.entry((file.clone(), id.clone())).or_default()
  }
}

impl SuiteListener for SuiteSummary {
  fn on_suite_started(&mut self) {
    self.suite_started = true;
  }

  fn on_internal_error(&mut self, message: &str, trace: &StackTrace) {
    self.internal_errors.push((message.to_string(), trace.clone()));
  }

  fn on_test_file_found(&mut self, _file: &TestFile) {
    self.files_found += 1;
  }

  fn on_all_test_files_found(&mut self) {}

  fn on_test_found(&mut self, file: &TestFile, id: &TestId, name: &str) {
    if let Some(parent) = id.parent() {
      self.parents.insert((file.clone(), parent));
    }
    let record = self.record(file, id);
    if record.name.is_empty() {
      record.name = name.to_string();
    }
  }

  fn on_test_started(&mut self, file: &TestFile, id: &TestId) {
    self.record(file, id).started = true;
  }

  fn on_failure(&mut self, file: &TestFile, id: &TestId, trace: &StackTrace) {
    self.record(file, id).failures.push(trace.clone());
  }

  fn on_test_finished(&mut self, file: &TestFile, id: &TestId) {
    let record = self.record(file, id);
    if record.finished {
      debug!(file = %file, id = %id, "Test finished more than once");
      return;
    }
    if !record.started {
      warn!(file = %file, id = %id, "Test finished without being started");
    }
    record.finished = true;

    let name = record.name.clone();
    let traces = record.failures.clone();
    for trace in traces {
      self.failures.push(ReportedFailure {
        file: file.clone(),
        id: id.clone(),
        name: name.clone(),
        trace,
      });
    }
  }

  fn on_test_file_finished(&mut self, _file: &TestFile) {
    self.files_finished += 1;
  }

  fn on_suite_finished(&mut self) {
    self.suite_finished = true;
  }
}
