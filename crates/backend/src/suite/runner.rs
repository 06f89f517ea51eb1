//! The suite runner actor

use std::{
  panic::{AssertUnwindSafe, catch_unwind},
  sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{DriverFactory, InternalErrorReportingExecutor, TestFileFinder};
use crate::{
  actor::{ActorRef, ActorThread, Executor, WorkerCounter, WorkerEvent, WorkerListener, thread::panic_message},
  domain::suite::{StackTrace, SuiteConfiguration, TestFile},
  events::{
    FinderEvent, SuiteListener, SuiteListenerProxy, SuiteSink, TestFileFinderListener, TestFileFinderListenerProxy,
  },
};

/// Where a suite is in its lifecycle.
///
/// Moves forward only: `AwaitingFiles → Collecting → AllFound → Draining → Done`.
/// `Collecting` is skipped for an empty suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SuitePhase {
  AwaitingFiles,
  Collecting,
  AllFound,
  Draining,
  Done,
}

/// Observes a started suite.
#[derive(Debug, Clone)]
pub struct SuiteHandle {
  phase: watch::Receiver<SuitePhase>,
}

impl SuiteHandle {
  pub fn phase(&self) -> SuitePhase {
    *self.phase.borrow()
  }

  /// Wait until the suite finished event has been sent.
  ///
  /// Returns `false` if the runner went away without finishing.
  pub async fn finished(&mut self) -> bool {
    self.phase.wait_for(|p| *p == SuitePhase::Done).await.is_ok()
  }
}

/// Turns discovered test files into running drivers and reports completion.
///
/// Lives on an actor thread; the finder reaches it through [`FinderEvent`]s.
/// Each file gets its own [`WorkerCounter`] whose workers are in turn
/// workers of the suite counter, so the suite cannot finish while any file
/// (or anything a file's driver started) is still running.
///
/// Listeners see all files found before any file finished: a file that
/// completes while discovery is still running has its finished event held
/// back until the all files found event has been sent.
pub struct SuiteRunner {
  driver_factory: Arc<dyn DriverFactory>,
  sink: SuiteSink,
  actor_thread: ActorThread,
  executor: Arc<dyn Executor>,
  suite_counter: WorkerCounter,
  phase: Arc<watch::Sender<SuitePhase>>,
  finished_files: Arc<Mutex<FinishedFiles>>,
  files_found: usize,
}

/// Test files that finished before discovery ended
#[derive(Default)]
struct FinishedFiles {
  all_found: bool,
  held: Vec<TestFile>,
}

impl SuiteRunner {
  /// `executor` runs the finder and, through the counters, every driver.
  pub fn new(
    driver_factory: Arc<dyn DriverFactory>,
    sink: SuiteSink,
    actor_thread: ActorThread,
    executor: Arc<dyn Executor>,
  ) -> Self {
    let suite_counter = WorkerCounter::new("suite", Arc::clone(&executor));
    let (phase, _) = watch::channel(SuitePhase::AwaitingFiles);
    Self {
      driver_factory,
      sink,
      actor_thread,
      executor,
      suite_counter,
      phase: Arc::new(phase),
      finished_files: Arc::new(Mutex::new(FinishedFiles::default())),
      files_found: 0,
    }
  }

  /// Report suite started, move the runner onto its actor thread and start
  /// discovery.
  pub fn start(self, config: SuiteConfiguration, finder: Arc<dyn TestFileFinder>) -> SuiteHandle {
    let handle = SuiteHandle {
      phase: self.phase.subscribe(),
    };
    info!(base_dir = ?config.base_dir, pattern = %config.include_pattern, "Starting suite");
    self.listener().on_suite_started();

    let executor = Arc::clone(&self.executor);
    let sink = Arc::clone(&self.sink);
    let thread = self.actor_thread.clone();
    let runner = thread.bind::<FinderEvent>(Box::new(self), "suite-runner");

    executor.execute(Box::new(move || run_finder(finder, config, runner, sink)));
    handle
  }

  fn listener(&self) -> SuiteListenerProxy<SuiteSink> {
    SuiteListenerProxy::new(Arc::clone(&self.sink))
  }

  fn phase(&self) -> SuitePhase {
    *self.phase.borrow()
  }

  fn internal_error(&self, message: String) {
    error!(%message, "Suite internal error");
    let trace = StackTrace::capture("SuiteError", Some(message.clone()));
    self.listener().on_internal_error(&message, &trace);
  }

  fn start_test_file(&mut self, file: &TestFile) {
    let executor = InternalErrorReportingExecutor::new(Arc::new(self.suite_counter.clone()), Arc::clone(&self.sink));
    let file_counter = WorkerCounter::new(format!("file {}", file), Arc::new(executor));

    let driver = self
      .driver_factory
      .create_driver(file, self.listener(), Arc::new(file_counter.clone()));
    if let Err(e) = file_counter.start_worker(driver) {
      self.internal_error(format!("Failed to start driver for {}: {}", file, e));
    }

    let fire = self.actor_thread.bind::<WorkerEvent>(
      Box::new(FireTestFileFinished {
        file: file.clone(),
        sink: Arc::clone(&self.sink),
        finished_files: Arc::clone(&self.finished_files),
      }),
      format!("file-finished {}", file),
    );
    if let Err(e) = file_counter.after_previous_workers_finished(fire) {
      self.internal_error(format!("Failed to watch {}: {}", file, e));
    }
  }
}

impl SuiteRunner {
  fn release_held_files(&self) {
    let held = {
      let mut finished = self.finished_files.lock().unwrap_or_else(PoisonError::into_inner);
      finished.all_found = true;
      std::mem::take(&mut finished.held)
    };
    for file in held {
      debug!(file = %file, "Test file finished");
      self.listener().on_test_file_finished(&file);
    }
  }
}

impl TestFileFinderListener for SuiteRunner {
  fn on_test_file_found(&mut self, file: TestFile) {
    if self.phase() >= SuitePhase::AllFound {
      self.internal_error(format!("Test file {} was found after all test files were reported", file));
      return;
    }

    self.phase.send_replace(SuitePhase::Collecting);
    self.files_found += 1;
    debug!(file = %file, "Test file found");
    self.listener().on_test_file_found(&file);
    self.start_test_file(&file);
  }

  fn on_all_test_files_found(&mut self) {
    if self.phase() >= SuitePhase::AllFound {
      warn!("All test files were reported more than once");
      return;
    }

    self.phase.send_replace(SuitePhase::AllFound);
    info!(files = self.files_found, "All test files found");
    self.listener().on_all_test_files_found();
    self.release_held_files();

    let fire = self.actor_thread.bind::<WorkerEvent>(
      Box::new(FireSuiteFinished {
        sink: Arc::clone(&self.sink),
        phase: Arc::clone(&self.phase),
      }),
      "suite-finished",
    );
    self.phase.send_replace(SuitePhase::Draining);
    if let Err(e) = self.suite_counter.after_previous_workers_finished(fire) {
      self.internal_error(format!("Failed to watch suite completion: {}", e));
    }
  }
}

fn run_finder(
  finder: Arc<dyn TestFileFinder>,
  config: SuiteConfiguration,
  runner: ActorRef<FinderEvent>,
  sink: SuiteSink,
) {
  let mut listener = TestFileFinderListenerProxy::new(runner);
  let failure = match catch_unwind(AssertUnwindSafe(|| finder.find_test_files(&config, &mut listener))) {
    Ok(Ok(())) => None,
    Ok(Err(e)) => Some((
      format!("Test file discovery failed: {}", e),
      StackTrace::new("SuiteError", Some(e.to_string())),
    )),
    Err(payload) => {
      let message = panic_message(&*payload);
      Some((
        format!("Test file discovery panicked: {}", message),
        StackTrace::capture("panic", Some(message)),
      ))
    }
  };

  if let Some((message, trace)) = failure {
    error!(%message, "Test file discovery failed");
    SuiteListenerProxy::new(sink).on_internal_error(&message, &trace);
  }
  // A failed finder still ends discovery, otherwise the suite never finishes
  if !listener.all_found_sent() {
    listener.on_all_test_files_found();
  }
}

// ============================================================================
// Completion listeners
// ============================================================================

struct FireTestFileFinished {
  file: TestFile,
  sink: SuiteSink,
  finished_files: Arc<Mutex<FinishedFiles>>,
}

impl WorkerListener for FireTestFileFinished {
  fn on_all_workers_finished(&mut self) {
    {
      let mut finished = self.finished_files.lock().unwrap_or_else(PoisonError::into_inner);
      if !finished.all_found {
        debug!(file = %self.file, "Test file finished during discovery");
        finished.held.push(self.file.clone());
        return;
      }
    }
    debug!(file = %self.file, "Test file finished");
    SuiteListenerProxy::new(Arc::clone(&self.sink)).on_test_file_finished(&self.file);
  }
}

struct FireSuiteFinished {
  sink: SuiteSink,
  phase: Arc<watch::Sender<SuitePhase>>,
}

impl WorkerListener for FireSuiteFinished {
  fn on_all_workers_finished(&mut self) {
    info!("Suite finished");
    SuiteListenerProxy::new(Arc::clone(&self.sink)).on_suite_finished();
    self.phase.send_replace(SuitePhase::Done);
  }
}
