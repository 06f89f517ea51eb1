//! Drivers - the code that actually runs one test file

use std::{
  collections::BTreeMap,
  process::{Command, Output, Stdio},
  sync::Arc,
};

use tracing::{debug, warn};

use crate::{
  actor::{Executor, Work},
  domain::suite::{StackTrace, TestFile, TestId},
  events::{SuiteListener, SuiteListenerProxy, SuiteSink},
};

/// Frames of process output kept in a failure trace
const MAX_OUTPUT_FRAMES: usize = 20;

/// Creates the work that runs one test file.
///
/// The returned work runs as a worker of the file's counter. Anything it
/// passes to `executor` also counts towards the file, so the file is only
/// finished once all of it has returned.
pub trait DriverFactory: Send + Sync {
  fn create_driver(&self, file: &TestFile, listener: SuiteListenerProxy<SuiteSink>, executor: Arc<dyn Executor>)
  -> Work;
}

/// Runs each test file as an executable.
///
/// The whole file is reported as a single root test; a non-zero exit status
/// is its failure.
#[derive(Debug, Clone, Default)]
pub struct CommandDriverFactory {
  args: Vec<String>,
  env: BTreeMap<String, String>,
}

impl CommandDriverFactory {
  pub fn new(args: Vec<String>) -> Self {
    Self {
      args,
      env: BTreeMap::new(),
    }
  }

  pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
    self.env = env;
    self
  }
}

impl DriverFactory for CommandDriverFactory {
  fn create_driver(
    &self,
    file: &TestFile,
    listener: SuiteListenerProxy<SuiteSink>,
    _executor: Arc<dyn Executor>,
  ) -> Work {
    let file = file.clone();
    let args = self.args.clone();
    let env = self.env.clone();
    Box::new(move || run_test_file(file, args, env, listener))
  }
}

fn run_test_file(
  file: TestFile,
  args: Vec<String>,
  env: BTreeMap<String, String>,
  mut listener: SuiteListenerProxy<SuiteSink>,
) {
  let id = TestId::ROOT;
  listener.on_test_found(&file, &id, file.short_name());
  listener.on_test_started(&file, &id);

  let result = Command::new(file.to_path())
    .args(&args)
    .envs(&env)
    .stdin(Stdio::null())
    .output();

  match result {
    Ok(output) if output.status.success() => {
      debug!(file = %file, "Test file passed");
    }
    Ok(output) => {
      debug!(file = %file, status = %output.status, "Test file failed");
      listener.on_failure(&file, &id, &exit_trace(&output));
    }
    Err(e) => {
      warn!(file = %file, error = %e, "Failed to run test file");
      let trace = StackTrace::new("SpawnError", Some(format!("Failed to run {}: {}", file, e)));
      listener.on_failure(&file, &id, &trace);
    }
  }

  listener.on_test_finished(&file, &id);
}

/// Failure trace for a process that exited unsuccessfully: the exit status
/// plus the tail of stderr (or stdout when stderr is empty).
fn exit_trace(output: &Output) -> StackTrace {
  let stream = if output.stderr.iter().any(|b| !b.is_ascii_whitespace()) {
    &output.stderr
  } else {
    &output.stdout
  };
  let text = String::from_utf8_lossy(stream);
  let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
  let frames = lines[lines.len().saturating_sub(MAX_OUTPUT_FRAMES)..]
    .iter()
    .map(|l| l.to_string())
    .collect();

  StackTrace::new("ExitStatus", Some(output.status.to_string())).with_frames(frames)
}
