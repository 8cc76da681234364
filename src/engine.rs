//! The engine boundary: an opaque multi-transfer state machine.
//!
//! The engine schedules any number of concurrent transfers over sockets it
//! opens itself. This crate never looks inside it; the whole contract is the
//! [`Engine`] trait plus the [`InterestSink`] the engine talks back through.
//! Every entry point that can shift the engine's interest in a socket or its
//! next deadline takes a sink, because the engine is allowed to invoke those
//! callbacks reentrantly from inside any action call.

use std::os::fd::RawFd;

use thiserror::Error;

/// Socket identifier as the engine reports it: a bare descriptor.
pub type SocketId = RawFd;

/// Wire-level interest-change code.
///
/// This stays a raw code rather than a closed enum so a version-skewed engine
/// can hand over a value this build does not know; the bridge treats that as a
/// fatal protocol violation rather than guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestChange(u8);

impl InterestChange {
    /// Wait for the socket to become readable.
    pub const IN: Self = Self(1);
    /// Wait for the socket to become writable.
    pub const OUT: Self = Self(2);
    /// Wait for either condition.
    pub const INOUT: Self = Self(3);
    /// Stop watching the socket entirely.
    pub const REMOVE: Self = Self(4);

    pub const fn from_raw(code: u8) -> Self {
        Self(code)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }
}

bitflags::bitflags! {
    /// Selector bits telling the engine which conditions a socket reported.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Select: u8 {
        const IN = 0b01;
        const OUT = 0b10;
    }
}

/// What a socket-action call is about: a socket that reported readiness, or
/// the shared timeout (a time-based check with no selector bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Socket(SocketId, Select),
    Timeout,
}

/// Receiver for the engine's interest and deadline updates.
///
/// The engine does not get a status back; the protocol fixes the result of
/// both callbacks to success.
pub trait InterestSink {
    /// The engine's interest in `socket` changed.
    fn socket_interest(&mut self, socket: SocketId, change: InterestChange);

    /// The engine's minimum deadline across all transfers changed. Negative
    /// disarms the shared timeout; zero means "due immediately".
    fn deadline_changed(&mut self, timeout_ms: i64);
}

/// Why a transfer finished without a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transfer timed out")]
    TimedOut,
    #[error("transfer aborted: {0}")]
    Aborted(String),
}

/// One notification pulled out of the engine's message queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<T> {
    pub transfer: T,
    pub kind: MessageKind,
}

/// Message payloads. Anything other than `Done` is unexpected but tolerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Done(Result<(), TransferError>),
    Other(u32),
}

/// The multi-transfer engine driven by [`crate::driver::Session`].
pub trait Engine {
    /// Opaque per-transfer handle. The engine owns the transfer; the driver
    /// only passes the handle back for bookkeeping calls.
    type Transfer: Copy + Eq + std::fmt::Debug;

    /// Hands a prepared transfer to the engine. The engine may immediately
    /// request socket watches or a deadline through the sink.
    fn register(&mut self, transfer: Self::Transfer, sink: &mut dyn InterestSink);

    /// Drives engine state for one event. Returns the number of transfers
    /// still running.
    fn socket_action(&mut self, action: Action, sink: &mut dyn InterestSink) -> usize;

    /// Pulls one pending notification, or `None` when the queue is empty.
    /// The engine may buffer several notifications behind one action call.
    fn take_message(&mut self) -> Option<Message<Self::Transfer>>;

    /// The effective URL of a transfer, for reporting.
    fn transfer_url(&self, transfer: Self::Transfer) -> String;

    /// Detaches a finished transfer. Removal may itself change socket
    /// interest, so the sink is live here too.
    fn unregister(&mut self, transfer: Self::Transfer, sink: &mut dyn InterestSink);

    /// Releases the transfer's resources. Must come after `unregister`.
    fn dispose(&mut self, transfer: Self::Transfer);
}
