//! Launcher → daemon command interface

use crate::{
  actor::{Envelope, MessageSender},
  domain::suite::SuiteConfiguration,
};

/// The command surface a daemon exposes to its launcher.
pub trait CommandListener: Send {
  fn run_tests(&mut self, config: SuiteConfiguration);

  fn shutdown(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
  RunTests(SuiteConfiguration),
  Shutdown,
}

impl Envelope for CommandEvent {
  type Target = dyn CommandListener;

  fn deliver(self, target: &mut Self::Target) {
    match self {
      CommandEvent::RunTests(config) => target.run_tests(config),
      CommandEvent::Shutdown => target.shutdown(),
    }
  }
}

/// Implements [`CommandListener`] by sending [`CommandEvent`]s.
#[derive(Clone)]
pub struct CommandListenerProxy<S> {
  sender: S,
}

impl<S: MessageSender<CommandEvent>> CommandListenerProxy<S> {
  pub fn new(sender: S) -> Self {
    Self { sender }
  }
}

impl<S: MessageSender<CommandEvent>> CommandListener for CommandListenerProxy<S> {
  fn run_tests(&mut self, config: SuiteConfiguration) {
    self.sender.send(CommandEvent::RunTests(config));
  }

  fn shutdown(&mut self) {
    self.sender.send(CommandEvent::Shutdown);
  }
}
