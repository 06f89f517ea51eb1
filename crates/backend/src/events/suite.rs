//! Suite results interface

use std::sync::Arc;

use crate::{
  actor::{Envelope, MessageSender},
  domain::suite::{StackTrace, TestFile, TestId},
};

/// Receives everything that happens while a suite runs.
pub trait SuiteListener: Send {
  fn on_suite_started(&mut self);

  /// Something went wrong outside of any test, e.g. a driver panicked
  fn on_internal_error(&mut self, message: &str, trace: &StackTrace);

  fn on_test_file_found(&mut self, file: &TestFile);

  fn on_all_test_files_found(&mut self);

  fn on_test_found(&mut self, file: &TestFile, id: &TestId, name: &str);

  fn on_test_started(&mut self, file: &TestFile, id: &TestId);

  fn on_failure(&mut self, file: &TestFile, id: &TestId, trace: &StackTrace);

  fn on_test_finished(&mut self, file: &TestFile, id: &TestId);

  fn on_test_file_finished(&mut self, file: &TestFile);

  fn on_suite_finished(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuiteEvent {
  SuiteStarted,
  InternalError { message: String, trace: StackTrace },
  TestFileFound(TestFile),
  AllTestFilesFound,
  TestFound { file: TestFile, id: TestId, name: String },
  TestStarted { file: TestFile, id: TestId },
  Failure { file: TestFile, id: TestId, trace: StackTrace },
  TestFinished { file: TestFile, id: TestId },
  TestFileFinished(TestFile),
  SuiteFinished,
}

impl Envelope for SuiteEvent {
  type Target = dyn SuiteListener;

  fn deliver(self, target: &mut Self::Target) {
    match self {
      SuiteEvent::SuiteStarted => target.on_suite_started(),
      SuiteEvent::InternalError { message, trace } => target.on_internal_error(&message, &trace),
      SuiteEvent::TestFileFound(file) => target.on_test_file_found(&file),
      SuiteEvent::AllTestFilesFound => target.on_all_test_files_found(),
      SuiteEvent::TestFound { file, id, name } => target.on_test_found(&file, &id, &name),
      SuiteEvent::TestStarted { file, id } => target.on_test_started(&file, &id),
      SuiteEvent::Failure { file, id, trace } => target.on_failure(&file, &id, &trace),
      SuiteEvent::TestFinished { file, id } => target.on_test_finished(&file, &id),
      SuiteEvent::TestFileFinished(file) => target.on_test_file_finished(&file),
      SuiteEvent::SuiteFinished => target.on_suite_finished(),
    }
  }
}

/// Shared destination for suite events
pub type SuiteSink = Arc<dyn MessageSender<SuiteEvent>>;

/// Implements [`SuiteListener`] by sending [`SuiteEvent`]s.
#[derive(Clone)]
pub struct SuiteListenerProxy<S> {
  sender: S,
}

impl<S: MessageSender<SuiteEvent>> SuiteListenerProxy<S> {
  pub fn new(sender: S) -> Self {
    Self { sender }
  }
}

impl<S: MessageSender<SuiteEvent>> SuiteListener for SuiteListenerProxy<S> {
  fn on_suite_started(&mut self) {
    self.sender.send(SuiteEvent::SuiteStarted);
  }

  fn on_internal_error(&mut self, message: &str, trace: &StackTrace) {
    self.sender.send(SuiteEvent::InternalError {
      message: message.to_string(),
      trace: trace.clone(),
    });
  }

  fn on_test_file_found(&mut self, file: &TestFile) {
    self.sender.send(SuiteEvent::TestFileFound(file.clone()));
  }

  fn on_all_test_files_found(&mut self) {
    self.sender.send(SuiteEvent::AllTestFilesFound);
  }

  fn on_test_found(&mut self, file: &TestFile, id: &TestId, name: &str) {
    self.sender.send(SuiteEvent::TestFound {
      file: file.clone(),
      id: id.clone(),
      name: name.to_string(),
    });
  }

  fn on_test_started(&mut self, file: &TestFile, id: &TestId) {
    self.sender.send(SuiteEvent::TestStarted {
      file: file.clone(),
      id: id.clone(),
    });
  }

  fn on_failure(&mut self, file: &TestFile, id: &TestId, trace: &StackTrace) {
    self.sender.send(SuiteEvent::Failure {
      file: file.clone(),
      id: id.clone(),
      trace: trace.clone(),
    });
  }

  fn on_test_finished(&mut self, file: &TestFile, id: &TestId) {
    self.sender.send(SuiteEvent::TestFinished {
      file: file.clone(),
      id: id.clone(),
    });
  }

  fn on_test_file_finished(&mut self, file: &TestFile) {
    self.sender.send(SuiteEvent::TestFileFinished(file.clone()));
  }

  fn on_suite_finished(&mut self) {
    self.sender.send(SuiteEvent::SuiteFinished);
  }
}
