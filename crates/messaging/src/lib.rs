//! Store-backed distributed messaging.
//!
//! Independent processes that already share a document store use it as
//! both durable log and coordination medium: point-to-point and broadcast
//! messages, request/answer correlation, and exclusive messages consumed
//! by exactly one competing node. Mutual exclusion rests solely on the
//! store's atomic conditional updates; there is no lock server.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod correlator;
mod engine;
mod error;
mod listener;
mod message;

pub use engine::{EngineSettings, MessagingEngine, ReceiveAnswers};
pub use error::Error;
pub use listener::{ListenerContext, ListenerError, ListenerId, MessageListener};
pub use message::{DEFAULT_PRIORITY, DEFAULT_TTL_MS, Message, OPEN_SENTINEL};
