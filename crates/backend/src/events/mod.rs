//! Listener interfaces and their envelopes
//!
//! Each interface that crosses an actor, channel or socket boundary has three
//! parts: the listener trait, a closed event enum with one variant per method
//! (the [`Envelope`](crate::actor::Envelope)), and a proxy that implements the
//! trait by sending events to any [`MessageSender`](crate::actor::MessageSender).
//!
//! | Interface | Direction |
//! |---|---|
//! | [`SuiteListener`] | daemon → launcher (results) |
//! | [`CommandListener`] | launcher → daemon (commands) |
//! | [`TestFileFinderListener`] | finder → suite runner (inside the daemon) |

pub mod command;
pub mod finder;
pub mod suite;

pub use command::{CommandEvent, CommandListener, CommandListenerProxy};
pub use finder::{FinderEvent, TestFileFinderListener, TestFileFinderListenerProxy};
pub use suite::{SuiteEvent, SuiteListener, SuiteListenerProxy, SuiteSink};
