//! Test discovery → suite runner interface

use crate::{
  actor::{Envelope, MessageSender},
  domain::suite::TestFile,
};

pub trait TestFileFinderListener: Send {
  fn on_test_file_found(&mut self, file: TestFile);

  /// No more files will be reported
  fn on_all_test_files_found(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinderEvent {
  TestFileFound(TestFile),
  AllTestFilesFound,
}

impl Envelope for FinderEvent {
  type Target = dyn TestFileFinderListener;

  fn deliver(self, target: &mut Self::Target) {
    match self {
      FinderEvent::TestFileFound(file) => target.on_test_file_found(file),
      FinderEvent::AllTestFilesFound => target.on_all_test_files_found(),
    }
  }
}

/// Implements [`TestFileFinderListener`] by sending [`FinderEvent`]s.
///
/// Remembers whether the end of discovery was signalled, so a finder that
/// fails halfway can still be closed off.
#[derive(Clone)]
pub struct TestFileFinderListenerProxy<S> {
  sender: S,
  all_found_sent: bool,
}

impl<S: MessageSender<FinderEvent>> TestFileFinderListenerProxy<S> {
  pub fn new(sender: S) -> Self {
    Self {
      sender,
      all_found_sent: false,
    }
  }

  pub fn all_found_sent(&self) -> bool {
    self.all_found_sent
  }
}

impl<S: MessageSender<FinderEvent>> TestFileFinderListener for TestFileFinderListenerProxy<S> {
  fn on_test_file_found(&mut self, file: TestFile) {
    self.sender.send(FinderEvent::TestFileFound(file));
  }

  fn on_all_test_files_found(&mut self) {
    self.all_found_sent = true;
    self.sender.send(FinderEvent::AllTestFilesFound);
  }
}
