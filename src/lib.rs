//! A bridge letting a readiness-based reactor drive a multi-transfer fetch
//! engine without blocking the single control thread.
//!
//! The engine stays opaque: it consumes "socket ready" and "timer fired"
//! events and answers with "watch this socket" and "arm a timeout"
//! instructions plus a stream of completion notifications. This crate keeps
//! the two state machines in sync:
//!
//! - [`reactor`]: readiness reactor over `mio::Poll` with one-shot timers and
//!   two-phase watch teardown
//! - [`engine`]: the engine boundary (trait, interest codes, messages)
//! - [`driver`]: the session gluing them together, including the shared
//!   timeout and the completion drain

pub mod driver;
pub mod engine;
pub mod reactor;

pub use driver::{Finished, Observer, Session};
pub use engine::{Action, Engine, InterestChange, InterestSink, Message, MessageKind, Select,
    SocketId, TransferError};
pub use reactor::{Handler, Reactor, Readiness, TimerId, WatchId};
