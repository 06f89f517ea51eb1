//! Executor wrapper that turns worker panics into suite events

use std::{
  panic::{AssertUnwindSafe, catch_unwind},
  sync::Arc,
};

use tracing::error;

use crate::{
  actor::{Executor, Work, thread::panic_message},
  domain::suite::StackTrace,
  events::{SuiteListener, SuiteListenerProxy, SuiteSink},
};

/// Runs work on `inner`, reporting panics as internal errors.
///
/// A panicking driver must not take sibling files down with it, and its
/// worker counters must still be released; the counters' drop guards take
/// care of the latter while this wrapper stops the unwind.
pub struct InternalErrorReportingExecutor {
  inner: Arc<dyn Executor>,
  sink: SuiteSink,
}

impl InternalErrorReportingExecutor {
  pub fn new(inner: Arc<dyn Executor>, sink: SuiteSink) -> Self {
    Self { inner, sink }
  }
}

impl Executor for InternalErrorReportingExecutor {
  fn execute(&self, work: Work) {
    let sink = Arc::clone(&self.sink);
    self.inner.execute(Box::new(move || {
      if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
        let message = panic_message(&*payload);
        error!(panic = %message, "Uncaught panic in worker");
        let trace = StackTrace::capture("panic", Some(message.clone()));
        SuiteListenerProxy::new(sink).on_internal_error(&format!("Uncaught panic in worker: {}", message), &trace);
      }
    }));
  }
}
