//! Test helpers for suite runner scenarios.

use std::{
  collections::BTreeSet,
  sync::{Arc, Condvar, Mutex},
  time::Duration,
};

use crate::{
  actor::{ActorThread, ActorThreadConfig, BlockingExecutor, Executor, MessageLog, Work},
  domain::suite::{SuiteConfiguration, TestFile},
  events::{SuiteEvent, SuiteListenerProxy, SuiteSink, TestFileFinderListener},
  suite::{DriverFactory, SuiteError, SuiteHandle, SuiteRunner, TestFileFinder},
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if condition() {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
}

/// Reports a fixed list of files, optionally failing afterwards.
pub struct ListFinder {
  pub files: Vec<&'static str>,
  pub fail: bool,
}

impl ListFinder {
  pub fn of(files: &[&'static str]) -> Arc<Self> {
    Arc::new(Self {
      files: files.to_vec(),
      fail: false,
    })
  }
}

impl TestFileFinder for ListFinder {
  fn find_test_files(
    &self,
    _config: &SuiteConfiguration,
    listener: &mut dyn TestFileFinderListener,
  ) -> Result<(), SuiteError> {
    for file in &self.files {
      listener.on_test_file_found(TestFile::new(*file));
    }
    if self.fail {
      return Err(SuiteError::Walk("disk went away".into()));
    }
    listener.on_all_test_files_found();
    Ok(())
  }
}

/// Reports its files, waits for a gate, then ends discovery.
///
/// Lets a scenario finish some files while discovery is still running.
pub struct StagedFinder {
  pub files: Vec<&'static str>,
  pub gates: Gates,
  pub before_all_found: &'static str,
  pub settle: Duration,
}

impl TestFileFinder for StagedFinder {
  fn find_test_files(
    &self,
    _config: &SuiteConfiguration,
    listener: &mut dyn TestFileFinderListener,
  ) -> Result<(), SuiteError> {
    for file in &self.files {
      listener.on_test_file_found(TestFile::new(*file));
    }
    self.gates.wait(self.before_all_found);
    std::thread::sleep(self.settle);
    listener.on_all_test_files_found();
    Ok(())
  }
}

/// Named gates that blocked workers wait on.
#[derive(Clone, Default)]
pub struct Gates {
  inner: Arc<(Mutex<BTreeSet<String>>, Condvar)>,
}

impl Gates {
  pub fn open(&self, name: &str) {
    let (opened, cv) = &*self.inner;
    opened.lock().unwrap().insert(name.to_string());
    cv.notify_all();
  }

  pub fn wait(&self, name: &str) {
    let (opened, cv) = &*self.inner;
    let mut guard = opened.lock().unwrap();
    while !guard.contains(name) {
      guard = cv.wait(guard).unwrap();
    }
  }
}

/// What a scripted driver does for its file.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Script {
  /// Wait for the gate named after the file
  Gated,
  Panic,
  /// Start a nested worker that waits for the gate `<file>/nested`
  Nested,
  /// Open the gate `<file>/ran` and return at once
  Signal,
}

pub struct ScriptedDrivers {
  pub gates: Gates,
  pub script: fn(&TestFile) -> Script,
}

impl DriverFactory for ScriptedDrivers {
  fn create_driver(
    &self,
    file: &TestFile,
    _listener: SuiteListenerProxy<SuiteSink>,
    executor: Arc<dyn Executor>,
  ) -> Work {
    let gates = self.gates.clone();
    let name = file.to_string();
    match (self.script)(file) {
      Script::Gated => Box::new(move || gates.wait(&name)),
      Script::Panic => Box::new(move || panic!("driver for {} exploded", name)),
      Script::Nested => Box::new(move || {
        executor.execute(Box::new(move || gates.wait(&format!("{}/nested", name))));
      }),
      Script::Signal => Box::new(move || gates.open(&format!("{}/ran", name))),
    }
  }
}

/// A runner wired to an event log.
pub struct SuiteContext {
  pub thread: ActorThread,
  pub log: MessageLog<SuiteEvent>,
  pub gates: Gates,
}

impl SuiteContext {
  pub fn new() -> Self {
    Self {
      thread: ActorThread::spawn(ActorThreadConfig::new("suite-test")),
      log: MessageLog::new(),
      gates: Gates::default(),
    }
  }

  pub fn start(&self, finder: Arc<dyn TestFileFinder>, script: fn(&TestFile) -> Script) -> SuiteHandle {
    let drivers = ScriptedDrivers {
      gates: self.gates.clone(),
      script,
    };
    let runner = SuiteRunner::new(
      Arc::new(drivers),
      Arc::new(self.log.clone()),
      self.thread.clone(),
      Arc::new(BlockingExecutor::current()),
    );
    runner.start(SuiteConfiguration::default(), finder)
  }

  pub fn contains(&self, event: &SuiteEvent) -> bool {
    self.log.messages().contains(event)
  }
}

pub fn found(file: &str) -> SuiteEvent {
  SuiteEvent::TestFileFound(TestFile::new(file))
}

pub fn finished(file: &str) -> SuiteEvent {
  SuiteEvent::TestFileFinished(TestFile::new(file))
}
