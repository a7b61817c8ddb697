//! In-process message bus connecting every component.
//!
//! Components never call each other. They publish [`Message`]s on a
//! [`Topic`] and the [`Router`] forwards each one to the listeners that
//! registered for that topic.
//!
//! ```text
//!  Messenger(docker) ──┐
//!  Messenger(env) ─────┼──► inbound queue ──► route loop ──┬──► inbox(reconcile)
//!  main (init/stop) ───┘      (bounded)       (one task)   ├──► inbox(tcp health)
//!                                                          ├──► inbox(vulcan)
//!                                                          └──► inbox(log sink)
//! ```

pub mod log;
pub mod message;
pub mod router;

pub use log::LogSink;
pub use message::{Level, Message, Status, Topic};
pub use router::{Inbox, Messenger, Publisher, Router};
