//! The bridge between a readiness reactor and a multi-transfer engine.
//!
//! A [`Session`] owns one reactor, one engine, and the single timeout slot all
//! transfers share. Engine interest changes become watch lifecycle operations,
//! reactor dispatches become engine action calls, and every action call is
//! followed by one exhaustive drain of the engine's completion queue.
//!
//! Everything runs on the one thread inside [`Session::run`]; the engine may
//! re-enter its callbacks from any action call and the borrow structure here
//! is shaped so that is always legal.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use metrics::{counter, gauge};
use tracing::{debug, error, trace, warn};

use crate::engine::{Action, Engine, InterestChange, InterestSink, MessageKind, Select, SocketId};
use crate::engine::TransferError;
use crate::reactor::{Handler, Reactor, Readiness, TimerId, WatchId};

/// A finished transfer as handed to the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub url: String,
    pub result: Result<(), TransferError>,
}

/// Caller-supplied sink for completion reports.
pub type Observer = Box<dyn FnMut(Finished)>;

/// One engine, one reactor, one shared timeout.
pub struct Session<E: Engine> {
    reactor: Reactor,
    driver: Driver<E>,
}

impl<E: Engine> Session<E> {
    pub fn new(engine: E, observer: Observer) -> io::Result<Self> {
        let mut reactor = Reactor::new()?;
        let timer = reactor.timer();
        Ok(Self {
            reactor,
            driver: Driver {
                engine,
                sockets: HashMap::new(),
                timer,
                observer,
            },
        })
    }

    /// Hands a prepared transfer to the engine, which may immediately request
    /// watches or arm the shared timeout.
    pub fn add_transfer(&mut self, transfer: E::Transfer) {
        let Driver { engine, sockets, timer, .. } = &mut self.driver;
        let mut sink = ReactorSink {
            reactor: &mut self.reactor,
            sockets,
            timer: *timer,
        };
        engine.register(transfer, &mut sink);
    }

    /// Runs the reactor until no watches or timers remain armed, i.e. until
    /// the engine has let go of every socket and deadline.
    pub fn run(&mut self) -> io::Result<()> {
        self.reactor.run(&mut self.driver)
    }

    /// Releases the engine, e.g. to read accumulated responses after `run`.
    pub fn into_engine(self) -> E {
        self.driver.engine
    }

    #[cfg(test)]
    pub(crate) fn parts(&self) -> (&Reactor, &Driver<E>) {
        (&self.reactor, &self.driver)
    }
}

pub(crate) struct Driver<E: Engine> {
    pub(crate) engine: E,
    /// Socket registry: one watch per socket the engine currently cares
    /// about. Doubles as the engine's opaque per-socket slot.
    pub(crate) sockets: HashMap<SocketId, WatchId>,
    /// The one timeout slot shared by all transfers; the engine multiplexes
    /// every per-transfer deadline into it.
    pub(crate) timer: TimerId,
    observer: Observer,
}

impl<E: Engine> Driver<E> {
    /// Feeds one event to the engine, then drains completions exactly once.
    fn dispatch(&mut self, reactor: &mut Reactor, action: Action) {
        let Driver { engine, sockets, timer, .. } = self;
        let mut sink = ReactorSink {
            reactor,
            sockets,
            timer: *timer,
        };
        let running = engine.socket_action(action, &mut sink);
        gauge!("multifetch_transfers_running").set(running as f64);

        self.drain_completions(reactor);
    }

    /// Pulls every pending notification out of the engine. Finished transfers
    /// are reported, detached, and released; anything else is logged and
    /// skipped.
    fn drain_completions(&mut self, reactor: &mut Reactor) {
        while let Some(message) = self.engine.take_message() {
            match message.kind {
                MessageKind::Done(result) => {
                    let url = self.engine.transfer_url(message.transfer);
                    debug!(%url, ok = result.is_ok(), "transfer finished");
                    counter!("multifetch_transfers_completed_total").increment(1);
                    (self.observer)(Finished { url, result });

                    let Driver { engine, sockets, timer, .. } = self;
                    let mut sink = ReactorSink {
                        reactor,
                        sockets,
                        timer: *timer,
                    };
                    engine.unregister(message.transfer, &mut sink);
                    engine.dispose(message.transfer);
                }
                MessageKind::Other(code) => {
                    warn!(code, "unexpected engine message");
                }
            }
        }
    }
}

impl<E: Engine> Handler for Driver<E> {
    fn on_ready(&mut self, reactor: &mut Reactor, _watch: WatchId, fd: RawFd, ready: Readiness) {
        let mut select = Select::empty();
        if ready.contains(Readiness::READABLE) {
            select |= Select::IN;
        }
        if ready.contains(Readiness::WRITABLE) {
            select |= Select::OUT;
        }
        self.dispatch(reactor, Action::Socket(fd, select));
    }

    fn on_timer(&mut self, reactor: &mut Reactor, _timer: TimerId) {
        self.dispatch(reactor, Action::Timeout);
    }

    fn on_closed(&mut self, _reactor: &mut Reactor, fd: RawFd) {
        trace!(fd, "socket context released");
    }
}

/// The two engine-facing callbacks, closing over the session pieces they are
/// allowed to touch. Built fresh around every engine call.
struct ReactorSink<'a> {
    reactor: &'a mut Reactor,
    sockets: &'a mut HashMap<SocketId, WatchId>,
    timer: TimerId,
}

impl InterestSink for ReactorSink<'_> {
    fn socket_interest(&mut self, socket: SocketId, change: InterestChange) {
        match change {
            InterestChange::IN | InterestChange::OUT | InterestChange::INOUT => {
                // A single-direction request excludes the other condition.
                let mut ready = Readiness::empty();
                if change != InterestChange::IN {
                    ready |= Readiness::WRITABLE;
                }
                if change != InterestChange::OUT {
                    ready |= Readiness::READABLE;
                }

                if let Some(&watch) = self.sockets.get(&socket) {
                    if let Err(e) = self.reactor.rewatch(watch, ready) {
                        error!(socket, %e, "failed to restart socket watch");
                    }
                } else {
                    match self.reactor.watch(socket, ready) {
                        Ok(watch) => {
                            self.sockets.insert(socket, watch);
                        }
                        // Leave the slot empty so the registry stays consistent.
                        Err(e) => error!(socket, %e, "failed to register socket watch"),
                    }
                }
            }
            InterestChange::REMOVE => {
                if let Some(watch) = self.sockets.remove(&socket) {
                    // Stop delivery first, then the deferred close; the watch
                    // is freed once the reactor confirms no queued event still
                    // references it.
                    let _ = self.reactor.unwatch(watch);
                    self.reactor.close(watch);
                }
            }
            other => {
                // The engine and this bridge disagree on the protocol; there
                // is no safe way to continue.
                error!(code = other.raw(), "engine requested an unknown interest change");
                std::process::abort();
            }
        }
    }

    fn deadline_changed(&mut self, timeout_ms: i64) {
        if timeout_ms < 0 {
            self.reactor.disarm_timer(self.timer);
            return;
        }
        // Zero means the action is due right now, but the engine forbids
        // reentrant action calls, so fire on the next reactor turn instead.
        let delay = if timeout_ms == 0 { 1 } else { timeout_ms as u64 };
        self.reactor.arm_timer(self.timer, Duration::from_millis(delay));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Message;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::time::Instant;

    /// One scripted upcall into the sink, or a message queued for draining.
    enum Cmd {
        Interest(SocketId, InterestChange),
        Deadline(i64),
        Queue(Message<u32>),
    }

    /// Engine double that replays canned sinks calls and records everything
    /// the driver does to it.
    #[derive(Default)]
    struct ScriptedEngine {
        register_script: Vec<Cmd>,
        action_scripts: VecDeque<Vec<Cmd>>,
        inbox: VecDeque<Message<u32>>,
        actions_seen: Vec<Action>,
        unregistered: Vec<u32>,
        disposed: Vec<u32>,
    }

    impl ScriptedEngine {
        fn apply(&mut self, cmds: Vec<Cmd>, sink: &mut dyn InterestSink) {
            for cmd in cmds {
                match cmd {
                    Cmd::Interest(socket, change) => sink.socket_interest(socket, change),
                    Cmd::Deadline(ms) => sink.deadline_changed(ms),
                    Cmd::Queue(message) => self.inbox.push_back(message),
                }
            }
        }
    }

    impl Engine for ScriptedEngine {
        type Transfer = u32;

        fn register(&mut self, _transfer: u32, sink: &mut dyn InterestSink) {
            let cmds = std::mem::take(&mut self.register_script);
            self.apply(cmds, sink);
        }

        fn socket_action(&mut self, action: Action, sink: &mut dyn InterestSink) -> usize {
            self.actions_seen.push(action);
            if let Some(cmds) = self.action_scripts.pop_front() {
                self.apply(cmds, sink);
            }
            self.action_scripts.len()
        }

        fn take_message(&mut self) -> Option<Message<u32>> {
            self.inbox.pop_front()
        }

        fn transfer_url(&self, transfer: u32) -> String {
            format!("test://{transfer}")
        }

        fn unregister(&mut self, transfer: u32, _sink: &mut dyn InterestSink) {
            self.unregistered.push(transfer);
        }

        fn dispose(&mut self, transfer: u32) {
            self.disposed.push(transfer);
        }
    }

    fn session_with(engine: ScriptedEngine) -> (Session<ScriptedEngine>, Rc<RefCell<Vec<Finished>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let session = Session::new(engine, Box::new(move |f| sink.borrow_mut().push(f))).unwrap();
        (session, seen)
    }

    #[test]
    fn interest_codes_map_to_the_expected_flags() {
        let cases = [
            (InterestChange::IN, Readiness::READABLE),
            (InterestChange::OUT, Readiness::WRITABLE),
            (InterestChange::INOUT, Readiness::READABLE | Readiness::WRITABLE),
        ];
        for (change, expected) in cases {
            let (sock, _peer) = UnixStream::pair().unwrap();
            let fd = sock.as_raw_fd();
            let engine = ScriptedEngine {
                register_script: vec![Cmd::Interest(fd, change)],
                ..Default::default()
            };
            let (mut session, _seen) = session_with(engine);
            session.add_transfer(1);

            let (reactor, driver) = session.parts();
            let watch = driver.sockets[&fd];
            assert_eq!(reactor.watch_flags(watch), Some(expected));
        }
    }

    #[test]
    fn widening_interest_restarts_the_watch_instead_of_stacking() {
        let (sock, _peer) = UnixStream::pair().unwrap();
        let fd = sock.as_raw_fd();
        let engine = ScriptedEngine {
            register_script: vec![
                Cmd::Interest(fd, InterestChange::IN),
                Cmd::Interest(fd, InterestChange::INOUT),
            ],
            ..Default::default()
        };
        let (mut session, _seen) = session_with(engine);
        session.add_transfer(1);

        let (reactor, driver) = session.parts();
        assert_eq!(driver.sockets.len(), 1);
        assert_eq!(reactor.watch_count(), 1);
        let watch = driver.sockets[&fd];
        assert_eq!(
            reactor.watch_flags(watch),
            Some(Readiness::READABLE | Readiness::WRITABLE)
        );
    }

    #[test]
    fn remove_clears_the_slot_and_teardown_completes() {
        let (sock, _peer) = UnixStream::pair().unwrap();
        let fd = sock.as_raw_fd();
        let engine = ScriptedEngine {
            register_script: vec![
                Cmd::Interest(fd, InterestChange::IN),
                Cmd::Interest(fd, InterestChange::REMOVE),
            ],
            ..Default::default()
        };
        let (mut session, _seen) = session_with(engine);
        session.add_transfer(1);

        {
            let (reactor, driver) = session.parts();
            // Slot cleared immediately; the watch lingers until the reactor
            // confirms teardown on its next turn.
            assert!(driver.sockets.is_empty());
            assert_eq!(reactor.watch_count(), 1);
        }

        session.run().unwrap();
        let (reactor, _driver) = session.parts();
        assert_eq!(reactor.watch_count(), 0);
    }

    #[test]
    fn zero_deadline_arms_the_minimum_delay() {
        let engine = ScriptedEngine {
            register_script: vec![Cmd::Deadline(0)],
            ..Default::default()
        };
        let (mut session, _seen) = session_with(engine);
        session.add_transfer(1);

        let (reactor, driver) = session.parts();
        let deadline = reactor.timer_deadline(driver.timer).unwrap();
        assert!(deadline <= Instant::now() + Duration::from_millis(5));
    }

    #[test]
    fn last_deadline_in_a_turn_wins() {
        let engine = ScriptedEngine {
            register_script: vec![Cmd::Deadline(0), Cmd::Deadline(50)],
            ..Default::default()
        };
        let (mut session, _seen) = session_with(engine);
        session.add_transfer(1);

        let (reactor, driver) = session.parts();
        let deadline = reactor.timer_deadline(driver.timer).unwrap();
        let remaining = deadline.saturating_duration_since(Instant::now());
        // 50ms, not the 1ms substituted for the zero request.
        assert!(remaining > Duration::from_millis(10));
        assert!(remaining <= Duration::from_millis(50));
    }

    #[test]
    fn negative_deadline_disarms_regardless_of_prior_state() {
        let engine = ScriptedEngine {
            register_script: vec![Cmd::Deadline(25), Cmd::Deadline(-1)],
            ..Default::default()
        };
        let (mut session, _seen) = session_with(engine);
        session.add_transfer(1);

        let (reactor, driver) = session.parts();
        assert!(reactor.timer_deadline(driver.timer).is_none());
    }

    #[test]
    fn timer_dispatch_drains_every_completion() {
        let engine = ScriptedEngine {
            register_script: vec![Cmd::Deadline(1)],
            action_scripts: VecDeque::from([vec![
                Cmd::Queue(Message { transfer: 7, kind: MessageKind::Done(Ok(())) }),
                Cmd::Queue(Message { transfer: 0, kind: MessageKind::Other(3) }),
                Cmd::Queue(Message {
                    transfer: 8,
                    kind: MessageKind::Done(Err(TransferError::TimedOut)),
                }),
            ]]),
            ..Default::default()
        };
        let (mut session, seen) = session_with(engine);
        session.add_transfer(1);
        session.run().unwrap();

        let reports = seen.borrow();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0], Finished { url: "test://7".into(), result: Ok(()) });
        assert_eq!(
            reports[1],
            Finished { url: "test://8".into(), result: Err(TransferError::TimedOut) }
        );

        drop(reports);
        let mut engine = session.into_engine();
        assert_eq!(engine.actions_seen, vec![Action::Timeout]);
        assert_eq!(engine.unregistered, vec![7, 8]);
        assert_eq!(engine.disposed, vec![7, 8]);
        // Exhaustive: nothing left behind after the drain.
        assert!(engine.take_message().is_none());
    }

    #[test]
    fn readiness_is_translated_into_selector_bits() {
        let (sock, mut peer) = UnixStream::pair().unwrap();
        sock.set_nonblocking(true).unwrap();
        let fd = sock.as_raw_fd();

        use std::io::Write;
        peer.write_all(b"x").unwrap();

        let engine = ScriptedEngine {
            register_script: vec![Cmd::Interest(fd, InterestChange::IN)],
            // First dispatch: let go of the socket so the loop can exit.
            action_scripts: VecDeque::from([vec![Cmd::Interest(fd, InterestChange::REMOVE)]]),
            ..Default::default()
        };
        let (mut session, _seen) = session_with(engine);
        session.add_transfer(1);
        session.run().unwrap();

        let engine = session.into_engine();
        assert_eq!(engine.actions_seen, vec![Action::Socket(fd, Select::IN)]);
    }
}
