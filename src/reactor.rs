//! Readiness-based reactor for socket and timer events.
//!
//! The reactor uses system-level event notification (epoll on Linux, kqueue on
//! macOS) through `mio::Poll` to wait for socket readiness and timer deadlines,
//! then dispatches them to a [`Handler`] on the single thread that called
//! [`Reactor::run`]. Nothing in here spawns threads or takes locks; suspension
//! happens only inside the poll call.
//!
//! Watches are torn down in two phases. [`Reactor::close`] deregisters the
//! descriptor and tags the entry as closing, but the entry is only freed (and
//! [`Handler::on_closed`] invoked) after the current event batch has been fully
//! dispatched. An event that was already fetched for a closing watch is dropped
//! instead of reaching the handler with a dead handle.

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use metrics::gauge;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::trace;

bitflags::bitflags! {
    /// Readiness conditions a watch waits for or reports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u8 {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

/// Handle to one registered watch.
///
/// Ids carry a generation tag so an id that outlives its watch is detectably
/// stale rather than silently hitting whatever reused the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchId {
    key: usize,
    gen: u32,
}

/// Handle to one one-shot timer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(usize);

enum WatchState {
    /// Registered with poll, waiting for the given conditions.
    Polling(Readiness),
    /// Deregistered but still alive; may be restarted.
    Stopped,
    /// Teardown requested, waiting for the event batch to drain.
    Closing,
}

struct WatchEntry {
    fd: RawFd,
    gen: u32,
    state: WatchState,
}

/// Receives reactor dispatches.
///
/// The reactor hands itself back on every call so the handler can mutate the
/// watch and timer sets mid-dispatch (register new watches, rearm the timer,
/// close the watch that just fired).
pub trait Handler {
    /// A watch reported readiness.
    fn on_ready(&mut self, reactor: &mut Reactor, watch: WatchId, fd: RawFd, ready: Readiness);

    /// A one-shot timer expired. Its deadline is already cleared; rearming
    /// from inside this call is allowed.
    fn on_timer(&mut self, reactor: &mut Reactor, timer: TimerId);

    /// A closed watch has been fully torn down; no further event can reference it.
    fn on_closed(&mut self, reactor: &mut Reactor, fd: RawFd) {
        let _ = (reactor, fd);
    }
}

/// Single-threaded readiness reactor over `mio::Poll`.
pub struct Reactor {
    poll: Poll,
    watches: Slab<WatchEntry>,
    timers: Slab<Option<Instant>>,
    /// Slab keys of closing watches, freed once the current batch has drained.
    pending_close: Vec<usize>,
    next_gen: u32,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            watches: Slab::new(),
            timers: Slab::new(),
            pending_close: Vec::new(),
            next_gen: 0,
        })
    }

    /// Starts watching a descriptor for the given readiness conditions.
    pub fn watch(&mut self, fd: RawFd, ready: Readiness) -> io::Result<WatchId> {
        self.next_gen = self.next_gen.wrapping_add(1);
        let gen = self.next_gen;
        let entry = self.watches.vacant_entry();
        let key = entry.key();
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token(key, gen), interest_of(ready))?;
        entry.insert(WatchEntry {
            fd,
            gen,
            state: WatchState::Polling(ready),
        });
        gauge!("multifetch_watches_active").increment(1.0);
        trace!(fd, "watch started");
        Ok(WatchId { key, gen })
    }

    /// Restarts a watch with a new set of conditions.
    ///
    /// The new conditions replace the old ones outright; repeated calls do not
    /// accumulate. A stopped watch is registered again.
    pub fn rewatch(&mut self, id: WatchId, ready: Readiness) -> io::Result<()> {
        let Some(entry) = self.watches.get_mut(id.key).filter(|e| e.gen == id.gen) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "watch is gone"));
        };
        let tok = token(id.key, id.gen);
        match entry.state {
            WatchState::Polling(_) => {
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&entry.fd), tok, interest_of(ready))?;
            }
            WatchState::Stopped => {
                self.poll
                    .registry()
                    .register(&mut SourceFd(&entry.fd), tok, interest_of(ready))?;
            }
            WatchState::Closing => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "watch is closing"));
            }
        }
        entry.state = WatchState::Polling(ready);
        Ok(())
    }

    /// Stops readiness delivery without tearing the watch down.
    pub fn unwatch(&mut self, id: WatchId) -> io::Result<()> {
        let Some(entry) = self.watches.get_mut(id.key).filter(|e| e.gen == id.gen) else {
            return Ok(());
        };
        if let WatchState::Polling(_) = entry.state {
            self.poll.registry().deregister(&mut SourceFd(&entry.fd))?;
            entry.state = WatchState::Stopped;
        }
        Ok(())
    }

    /// Requests teardown of a watch.
    ///
    /// Teardown is asynchronous: an event for this watch may already sit in the
    /// fetched batch, so the entry is only freed after the batch has drained,
    /// at which point [`Handler::on_closed`] runs. Closing twice is a no-op.
    pub fn close(&mut self, id: WatchId) {
        let Some(entry) = self.watches.get_mut(id.key).filter(|e| e.gen == id.gen) else {
            return;
        };
        if let WatchState::Polling(_) = entry.state {
            // Best effort; the descriptor may already be gone.
            let _ = self.poll.registry().deregister(&mut SourceFd(&entry.fd));
        }
        if !matches!(entry.state, WatchState::Closing) {
            entry.state = WatchState::Closing;
            self.pending_close.push(id.key);
        }
    }

    /// Allocates a one-shot timer slot, initially disarmed.
    pub fn timer(&mut self) -> TimerId {
        TimerId(self.timers.insert(None))
    }

    /// Arms a timer to fire once after `delay`. Rearming overwrites any
    /// pending deadline, so repeated calls with the same delay are harmless.
    pub fn arm_timer(&mut self, id: TimerId, delay: Duration) {
        if let Some(slot) = self.timers.get_mut(id.0) {
            *slot = Some(Instant::now() + delay);
        }
    }

    /// Cancels a pending deadline, if any.
    pub fn disarm_timer(&mut self, id: TimerId) {
        if let Some(slot) = self.timers.get_mut(id.0) {
            *slot = None;
        }
    }

    /// Runs the event loop until no watches exist and no timer is armed.
    ///
    /// Each turn waits for readiness or the earliest deadline, dispatches the
    /// fetched events, fires due timers, then confirms any pending closes.
    pub fn run<H: Handler>(&mut self, handler: &mut H) -> io::Result<()> {
        let mut events = Events::with_capacity(256);
        let mut fired: Vec<(WatchId, RawFd, Readiness)> = Vec::new();

        loop {
            self.reap_closed(handler);
            if self.watches.is_empty() && !self.any_timer_armed() {
                return Ok(());
            }

            let timeout = self
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()));
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            fired.clear();
            for event in events.iter() {
                let (key, gen) = split(event.token());
                let Some(entry) = self.watches.get(key) else {
                    continue;
                };
                if entry.gen != gen {
                    continue;
                }
                let mut ready = Readiness::empty();
                if event.is_readable() || event.is_read_closed() {
                    ready |= Readiness::READABLE;
                }
                if event.is_writable() || event.is_write_closed() {
                    ready |= Readiness::WRITABLE;
                }
                if event.is_error() {
                    // Error-only events still need to reach the handler so the
                    // failure surfaces through a read/write attempt.
                    if let WatchState::Polling(want) = entry.state {
                        ready |= want;
                    }
                }
                if ready.is_empty() {
                    continue;
                }
                fired.push((WatchId { key, gen }, entry.fd, ready));
            }

            for &(id, fd, ready) in &fired {
                // A dispatch earlier in this batch may have closed the watch.
                if self.is_polling(id) {
                    handler.on_ready(self, id, fd, ready);
                }
            }

            let now = Instant::now();
            let due: Vec<usize> = self
                .timers
                .iter()
                .filter_map(|(key, deadline)| match deadline {
                    Some(d) if *d <= now => Some(key),
                    _ => None,
                })
                .collect();
            for key in due {
                // One-shot: clear before dispatch so the handler may rearm.
                self.timers[key] = None;
                handler.on_timer(self, TimerId(key));
            }
        }
    }

    fn reap_closed<H: Handler>(&mut self, handler: &mut H) {
        while let Some(key) = self.pending_close.pop() {
            let entry = self.watches.remove(key);
            gauge!("multifetch_watches_active").decrement(1.0);
            trace!(fd = entry.fd, "watch torn down");
            handler.on_closed(self, entry.fd);
        }
    }

    fn is_polling(&self, id: WatchId) -> bool {
        self.watches
            .get(id.key)
            .is_some_and(|e| e.gen == id.gen && matches!(e.state, WatchState::Polling(_)))
    }

    fn any_timer_armed(&self) -> bool {
        self.timers.iter().any(|(_, deadline)| deadline.is_some())
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().filter_map(|(_, deadline)| *deadline).min()
    }

    #[cfg(test)]
    pub(crate) fn watch_count(&self) -> usize {
        self.watches.len()
    }

    #[cfg(test)]
    pub(crate) fn watch_flags(&self, id: WatchId) -> Option<Readiness> {
        self.watches
            .get(id.key)
            .filter(|e| e.gen == id.gen)
            .and_then(|e| match e.state {
                WatchState::Polling(ready) => Some(ready),
                _ => None,
            })
    }

    #[cfg(test)]
    pub(crate) fn timer_deadline(&self, id: TimerId) -> Option<Instant> {
        self.timers.get(id.0).copied().flatten()
    }
}

// Tokens pack the slab key in the low half and the generation in the high
// half, so stale events can be matched against the entry that owns the slot.
fn token(key: usize, gen: u32) -> Token {
    Token(key | (gen as usize) << 32)
}

fn split(token: Token) -> (usize, u32) {
    (token.0 & u32::MAX as usize, (token.0 >> 32) as u32)
}

fn interest_of(ready: Readiness) -> Interest {
    match (
        ready.contains(Readiness::READABLE),
        ready.contains(Readiness::WRITABLE),
    ) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        _ => Interest::READABLE,
    }
}
