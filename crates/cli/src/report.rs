//! Console output for suite results

use std::{
  collections::BTreeSet,
  io::{self, Write},
};

use volley::{
  domain::suite::{StackTrace, TestFile, TestId},
  events::SuiteListener,
  suite::{ReportedFailure, SuiteSummary},
};

/// Prints results as they arrive and keeps the running totals.
///
/// A failure is printed once its test has finished, so every trace of a
/// test appears together.
pub struct ConsoleReporter<W: Write + Send = io::Stdout> {
  out: W,
  summary: SuiteSummary,
  printed_failures: usize,
  failed_files: BTreeSet<TestFile>,
}

impl ConsoleReporter {
  pub fn new() -> Self {
    Self::with_writer(io::stdout())
  }
}

impl<W: Write + Send> ConsoleReporter<W> {
  pub fn with_writer(out: W) -> Self {
    Self {
      out,
      summary: SuiteSummary::new(),
      printed_failures: 0,
      failed_files: BTreeSet::new(),
    }
  }

  pub fn summary(&self) -> &SuiteSummary {
    &self.summary
  }

  /// Print the final totals
  pub fn print_summary(&mut self) {
    let errors = self.summary.internal_errors().len();
    let _ = writeln!(self.out);
    if errors > 0 {
      let _ = writeln!(self.out, "{} internal error(s)", errors);
    }
    if !self.summary.is_finished() {
      let _ = writeln!(self.out, "Suite did not finish");
    }
    let _ = writeln!(self.out, "{}", self.summary.summary_line());
  }

  fn print_new_failures(&mut self) {
    let new: Vec<ReportedFailure> = self.summary.failures()[self.printed_failures..].to_vec();
    self.printed_failures += new.len();
    for failure in new {
      self.failed_files.insert(failure.file.clone());
      let _ = writeln!(self.out, "FAILED {} {} [{}]", failure.file, failure.name, failure.id);
      let _ = write!(self.out, "{}", indent(&failure.trace));
    }
  }
}

impl<W: Write + Send> SuiteListener for ConsoleReporter<W> {
  fn on_suite_started(&mut self) {
    self.summary.on_suite_started();
  }

  fn on_internal_error(&mut self, message: &str, trace: &StackTrace) {
    self.summary.on_internal_error(message, trace);
    let _ = writeln!(self.out, "INTERNAL ERROR {}", message);
    let _ = write!(self.out, "{}", indent(trace));
  }

  fn on_test_file_found(&mut self, file: &TestFile) {
    self.summary.on_test_file_found(file);
  }

  fn on_all_test_files_found(&mut self) {
    self.summary.on_all_test_files_found();
    let _ = writeln!(self.out, "Running {} test file(s)", self.summary.files_found());
  }

  fn on_test_found(&mut self, file: &TestFile, id: &TestId, name: &str) {
    self.summary.on_test_found(file, id, name);
  }

  fn on_test_started(&mut self, file: &TestFile, id: &TestId) {
    self.summary.on_test_started(file, id);
  }

  fn on_failure(&mut self, file: &TestFile, id: &TestId, trace: &StackTrace) {
    self.summary.on_failure(file, id, trace);
  }

  fn on_test_finished(&mut self, file: &TestFile, id: &TestId) {
    self.summary.on_test_finished(file, id);
    self.print_new_failures();
  }

  fn on_test_file_finished(&mut self, file: &TestFile) {
    self.summary.on_test_file_finished(file);
    let status = if self.failed_files.contains(file) { "FAIL" } else { "PASS" };
    let _ = writeln!(self.out, "{} {}", status, file);
  }

  fn on_suite_finished(&mut self) {
    self.summary.on_suite_finished();
  }
}

fn indent(trace: &StackTrace) -> String {
  trace.to_string().lines().map(|line| format!("    {}\n", line)).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn output(reporter: ConsoleReporter<Vec<u8>>) -> String {
    String::from_utf8(reporter.out).unwrap()
  }

  #[test]
  fn test_failures_print_after_the_test_finishes() {
    let file = TestFile::new("tests/a_test");
    let root = TestId::of(&[]);
    let mut reporter = ConsoleReporter::with_writer(Vec::new());

    reporter.on_suite_started();
    reporter.on_test_file_found(&file);
    reporter.on_all_test_files_found();
    reporter.on_test_found(&file, &root, "a_test");
    reporter.on_test_started(&file, &root);
    reporter.on_failure(&file, &root, &StackTrace::new("ExitStatus", Some("exit status: 1".into())));
    assert!(!String::from_utf8_lossy(&reporter.out).contains("FAILED"));

    reporter.on_test_finished(&file, &root);
    reporter.on_test_file_finished(&file);
    reporter.on_suite_finished();
    reporter.print_summary();

    let out = output(reporter);
    assert!(out.contains("Running 1 test file(s)"));
    assert!(out.contains("FAILED tests/a_test a_test"));
    assert!(out.contains("    ExitStatus: exit status: 1"));
    assert!(out.contains("FAIL tests/a_test"));
    assert!(out.ends_with("Pass: 0, Fail: 1, Total: 1\n"));
  }

  #[test]
  fn test_unfinished_suite_is_reported() {
    let mut reporter = ConsoleReporter::with_writer(Vec::new());
    reporter.on_suite_started();
    reporter.on_internal_error("Uncaught panic in worker: boom", &StackTrace::new("panic", None));
    reporter.print_summary();

    let out = output(reporter);
    assert!(out.contains("INTERNAL ERROR Uncaught panic in worker: boom"));
    assert!(out.contains("1 internal error(s)"));
    assert!(out.contains("Suite did not finish"));
  }
}
