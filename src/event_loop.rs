//! The event loop: readiness dispatch, timers, and cross-thread task
//! injection.
//!
//! # Overview
//!
//! - [`EventLoop`]: single-threaded driver owning the poller, the handler
//!   registry, the timer heap, and the receiving end of the injection
//!   queue.
//! - [`EventHandler`]: the callback interface a registered descriptor
//!   implements; dispatched on the loop thread.
//! - [`LoopHandle`]: the `Send + Sync` face of a loop. Other threads use it
//!   to stop the loop or inject closures; the first closure into an idle
//!   queue also writes the wakeup descriptor to interrupt a blocked poll.
//! - [`Token`] / [`TimeoutToken`]: generational identifiers for handler and
//!   timer registrations.
//!
//! Exactly one thread drives a loop at a time. Handler callbacks, timer
//! callbacks, and injected tasks all run on that thread, to completion; the
//! only suspension point is the poll itself. Everything except the
//! injection queue and the stop rendezvous is loop-thread-only state.

use crate::error::Error;
use crate::interest::Interest;
use crate::mpsc;
use crate::poller::{PollEvent, Poller, Wakeup, EVENTS_CAPACITY};
use crate::timer::TimerHeap;
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Re-arm period for the internal timer that keeps a `Forever` run polling
/// even when nothing else is registered.
const FOREVER_GUARD_PERIOD: Duration = Duration::from_secs(3600);

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_ID: usize = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Process-unique identifier of the calling thread; never zero, so zero can
/// mean "no thread is driving the loop".
fn current_thread_id() -> usize {
    THREAD_ID.with(|id| *id)
}

/// How long [`EventLoop::run`] keeps iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Run one poll pass and return.
    Once,
    /// Iterate until no external handlers or timers remain registered.
    UntilEmpty,
    /// Iterate until [`stop`](EventLoop::stop) is called.
    Forever,
}

/// Callback interface for a registered descriptor.
///
/// `ready` is invoked on the loop thread with the readiness that was both
/// watched and observed. Implementations keep their mutable state in
/// `Cell`/`RefCell` fields; the loop never re-enters a handler that is
/// already running.
pub trait EventHandler {
    /// The watched descriptor.
    fn fd(&self) -> RawFd;

    /// Invoked when the descriptor is ready.
    fn ready(&self, events: Interest);
}

/// Identifier of a handler registration.
///
/// Tokens are generational: once a registration is removed its token goes
/// stale, and updating through a stale token is a fail-fast error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    index: u32,
    generation: u32,
}

impl Token {
    fn as_bits(self) -> u64 {
        u64::from(self.index) | (u64::from(self.generation) << 32)
    }

    fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

/// Identifier of a pending one-shot timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutToken(u64);

/// A closure injected from another thread, or the stop request.
enum Task {
    User(Box<dyn FnOnce() + Send>),
    Stop,
}

struct LoopShared {
    sender: mpsc::Sender<Task>,
    wakeup: Wakeup,
    terminate: AtomicBool,
    /// Thread currently driving the loop; 0 when idle.
    loop_thread: AtomicUsize,
    finished: Mutex<bool>,
    finished_cv: Condvar,
}

impl LoopShared {
    fn in_loop_thread(&self) -> bool {
        let id = self.loop_thread.load(Ordering::Acquire);
        id == 0 || id == current_thread_id()
    }

    fn enqueue(&self, task: Task) {
        if self.sender.push(task) {
            self.wakeup.notify();
        }
    }

    fn stop(&self) {
        // Going through the injection queue orders the stop after any user
        // work already submitted.
        self.enqueue(Task::Stop);
        if self.loop_thread.load(Ordering::Acquire) == current_thread_id() {
            // Called from inside a callback; the loop exits once the
            // current iteration finishes. Waiting here would deadlock.
            return;
        }
        let mut finished = self.finished.lock();
        self.finished_cv.wait_while(&mut finished, |done| !*done);
    }
}

/// Cheap, cloneable, `Send + Sync` handle onto an event loop.
///
/// This is the only way other threads interact with a loop: the loop itself
/// is single-threaded and stays on the thread that drives it.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Signals termination and waits for the loop to exit.
    ///
    /// Safe to call when the loop is not running; safe (but non-blocking)
    /// from inside a callback on the loop thread.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Returns true if the calling thread may operate on loop state: it is
    /// the driving thread, or no thread is driving the loop.
    #[must_use]
    pub fn in_loop_thread(&self) -> bool {
        self.shared.in_loop_thread()
    }

    /// Runs `op` on the loop thread.
    ///
    /// Runs inline when the caller already satisfies
    /// [`in_loop_thread`](Self::in_loop_thread); otherwise enqueues it and
    /// wakes the loop if it may be idle. Injected closures run in FIFO
    /// order before the next poll pass.
    pub fn run_on_event_loop<F>(&self, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.in_loop_thread() {
            op();
        } else {
            self.shared.enqueue(Task::User(Box::new(op)));
        }
    }

    /// Like [`run_on_event_loop`](Self::run_on_event_loop), but blocks the
    /// caller until `op` has completed on the loop thread.
    pub fn run_on_event_loop_and_wait<F>(&self, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.in_loop_thread() {
            op();
            return;
        }
        let rendezvous = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&rendezvous);
        self.shared.enqueue(Task::User(Box::new(move || {
            op();
            let (lock, cv) = &*signal;
            *lock.lock() = true;
            cv.notify_all();
        })));
        let (lock, cv) = &*rendezvous;
        let mut done = lock.lock();
        cv.wait_while(&mut done, |done| !*done);
    }
}

struct Registration {
    fd: RawFd,
    interest: Interest,
    internal: bool,
    handler: Rc<dyn EventHandler>,
}

struct Slot {
    generation: u32,
    registration: Option<Registration>,
}

#[derive(Default)]
struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Live registrations that count toward `UntilEmpty` liveness.
    external: usize,
}

impl Registry {
    fn insert(&mut self, registration: Registration) -> Token {
        if !registration.internal {
            self.external += 1;
        }
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.registration = Some(registration);
                Token {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    registration: Some(registration),
                });
                Token {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn get(&self, token: Token) -> Option<&Registration> {
        self.slots
            .get(token.index as usize)
            .filter(|slot| slot.generation == token.generation)
            .and_then(|slot| slot.registration.as_ref())
    }

    fn get_mut(&mut self, token: Token) -> Option<&mut Registration> {
        self.slots
            .get_mut(token.index as usize)
            .filter(|slot| slot.generation == token.generation)
            .and_then(|slot| slot.registration.as_mut())
    }

    fn remove(&mut self, token: Token) -> Option<Registration> {
        let slot = self.slots.get_mut(token.index as usize)?;
        if slot.generation != token.generation {
            return None;
        }
        let registration = slot.registration.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(token.index);
        if !registration.internal {
            self.external -= 1;
        }
        Some(registration)
    }
}

/// Internal handler that drains the wakeup descriptor and immediately
/// re-drains the injection queue; the queue, not the wakeup payload, is the
/// source of truth.
struct WakeupHandler {
    fd: RawFd,
    event_loop: Weak<EventLoop>,
}

impl EventHandler for WakeupHandler {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn ready(&self, _events: Interest) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.shared.wakeup.drain();
            event_loop.drain_injected();
        }
    }
}

/// A single-threaded readiness event loop.
///
/// Create with [`EventLoop::new`], register handlers and timeouts, then
/// drive it with [`run`](Self::run). The loop is `!Send`; hand a
/// [`LoopHandle`] to other threads instead.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    receiver: RefCell<mpsc::Receiver<Task>>,
    poller: Poller,
    registry: RefCell<Registry>,
    timers: RefCell<TimerHeap>,
    events: RefCell<Vec<PollEvent>>,
    running: Cell<bool>,
}

impl EventLoop {
    /// Creates a loop with its poller and wakeup descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller or the wakeup descriptor cannot be
    /// created (for example, out of file descriptors).
    pub fn new() -> Result<Rc<Self>, Error> {
        let poller = Poller::new().map_err(|e| Error::io("create poller", e))?;
        let wakeup = Wakeup::new().map_err(|e| Error::io("create wakeup descriptor", e))?;
        let wakeup_fd = wakeup.read_fd();
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(LoopShared {
            sender,
            wakeup,
            terminate: AtomicBool::new(false),
            loop_thread: AtomicUsize::new(0),
            finished: Mutex::new(true),
            finished_cv: Condvar::new(),
        });
        let event_loop = Rc::new(Self {
            shared,
            receiver: RefCell::new(receiver),
            poller,
            registry: RefCell::new(Registry::default()),
            timers: RefCell::new(TimerHeap::new()),
            events: RefCell::new(Vec::with_capacity(EVENTS_CAPACITY)),
            running: Cell::new(false),
        });
        let handler = Rc::new(WakeupHandler {
            fd: wakeup_fd,
            event_loop: Rc::downgrade(&event_loop),
        });
        event_loop.register_with(handler, Interest::READABLE, true)?;
        Ok(event_loop)
    }

    /// Returns a `Send + Sync` handle for other threads.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// See [`LoopHandle::in_loop_thread`].
    #[must_use]
    pub fn in_loop_thread(&self) -> bool {
        self.shared.in_loop_thread()
    }

    /// See [`LoopHandle::stop`].
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// See [`LoopHandle::run_on_event_loop`].
    pub fn run_on_event_loop<F>(&self, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle().run_on_event_loop(op);
    }

    /// See [`LoopHandle::run_on_event_loop_and_wait`].
    pub fn run_on_event_loop_and_wait<F>(&self, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle().run_on_event_loop_and_wait(op);
    }

    /// Registers a handler for `interest` on its descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller rejects the descriptor.
    ///
    /// # Panics
    ///
    /// Panics when called off the loop thread, or with empty interest, or
    /// for a handler without a descriptor.
    pub fn register_handler(
        &self,
        handler: Rc<dyn EventHandler>,
        interest: Interest,
    ) -> Result<Token, Error> {
        self.register_with(handler, interest, false)
    }

    fn register_with(
        &self,
        handler: Rc<dyn EventHandler>,
        interest: Interest,
        internal: bool,
    ) -> Result<Token, Error> {
        assert!(
            self.shared.in_loop_thread(),
            "handlers must be registered from the loop thread"
        );
        assert!(
            !interest.is_empty(),
            "registering with no interest; use unregister_handler"
        );
        let fd = handler.fd();
        assert!(fd >= 0, "handler has no descriptor");
        let token = self.registry.borrow_mut().insert(Registration {
            fd,
            interest,
            internal,
            handler,
        });
        if let Err(err) = self.poller.register(fd, token.as_bits(), interest) {
            self.registry.borrow_mut().remove(token);
            return Err(Error::io("register descriptor with poller", err));
        }
        tracing::trace!(fd, %interest, internal, "handler registered");
        Ok(token)
    }

    /// Changes the watched set of an existing registration.
    /// [`Interest::NONE`] unregisters the handler instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller rejects the change.
    ///
    /// # Panics
    ///
    /// Panics when called off the loop thread, or with a stale token and a
    /// non-empty interest.
    pub fn update_handler(&self, token: Token, interest: Interest) -> Result<(), Error> {
        assert!(
            self.shared.in_loop_thread(),
            "handlers must be updated from the loop thread"
        );
        if interest.is_empty() {
            self.unregister_handler(token);
            return Ok(());
        }
        let mut registry = self.registry.borrow_mut();
        let registration = registry
            .get_mut(token)
            .expect("update through a stale handler token");
        if registration.interest == interest {
            return Ok(());
        }
        self.poller
            .update(registration.fd, token.as_bits(), interest)
            .map_err(|e| Error::io("update poller registration", e))?;
        registration.interest = interest;
        Ok(())
    }

    /// Removes a registration. Idempotent: a stale token is a no-op.
    ///
    /// # Panics
    ///
    /// Panics when called off the loop thread.
    pub fn unregister_handler(&self, token: Token) {
        assert!(
            self.shared.in_loop_thread(),
            "handlers must be unregistered from the loop thread"
        );
        let removed = self.registry.borrow_mut().remove(token);
        if let Some(registration) = removed {
            if let Err(err) = self.poller.deregister(registration.fd) {
                tracing::warn!(fd = registration.fd, error = %err, "poller deregistration failed");
            }
            tracing::trace!(fd = registration.fd, "handler unregistered");
        }
    }

    /// Returns the watched set of a registration, or
    /// [`Interest::NONE`] for a stale token.
    #[must_use]
    pub fn watched(&self, token: Token) -> Interest {
        self.registry
            .borrow()
            .get(token)
            .map_or(Interest::NONE, |registration| registration.interest)
    }

    /// Schedules a one-shot callback after `delay`.
    ///
    /// # Panics
    ///
    /// Panics when called off the loop thread.
    pub fn register_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimeoutToken {
        assert!(
            self.shared.in_loop_thread(),
            "timeouts must be registered from the loop thread"
        );
        let id = self
            .timers
            .borrow_mut()
            .insert(Instant::now() + delay, callback, false);
        TimeoutToken(id)
    }

    /// Cancels a pending timeout. Returns false if it already fired or was
    /// cancelled.
    ///
    /// # Panics
    ///
    /// Panics when called off the loop thread.
    pub fn unregister_timeout(&self, token: TimeoutToken) -> bool {
        assert!(
            self.shared.in_loop_thread(),
            "timeouts must be cancelled from the loop thread"
        );
        self.timers.borrow_mut().cancel(token.0)
    }

    /// Drives the loop in the given mode.
    ///
    /// Every iteration first drains the injection queue, then runs one poll
    /// pass delivering readiness to handlers and expirations to timers, then
    /// checks the mode's exit condition. `Once` returns after a single poll
    /// pass; `UntilEmpty` returns when no external handlers or timers
    /// remain; `Forever` returns when stopped.
    ///
    /// # Panics
    ///
    /// Panics on re-entrant use: the loop is already running.
    pub fn run(&self, mode: LoopMode) {
        assert!(
            !self.running.replace(true),
            "event loop is already running"
        );
        let previous = self
            .shared
            .loop_thread
            .swap(current_thread_id(), Ordering::AcqRel);
        debug_assert_eq!(previous, 0, "loop thread identity leaked");
        *self.shared.finished.lock() = false;
        tracing::debug!(?mode, "event loop entered");

        let mut guard_timer: Option<u64> = None;
        loop {
            if mode == LoopMode::Forever {
                // Keep a long-period internal timer pending so the poll
                // always has something to wait for; re-arm it if it fired.
                let alive = guard_timer.is_some_and(|id| self.timers.borrow().contains(id));
                if !alive {
                    guard_timer = Some(self.timers.borrow_mut().insert(
                        Instant::now() + FOREVER_GUARD_PERIOD,
                        Box::new(|| {}),
                        true,
                    ));
                }
            }

            self.drain_injected();
            if self.shared.terminate.load(Ordering::Acquire) {
                break;
            }
            if mode == LoopMode::UntilEmpty && self.external_work() == 0 {
                break;
            }

            // With nothing external registered, Once must not block on the
            // internal wakeup handler: collect whatever is already ready
            // and return. Forever still blocks; its guard timer bounds the
            // wait.
            let block = mode == LoopMode::Forever || self.external_work() > 0;
            self.poll_pass(block);

            if self.shared.terminate.load(Ordering::Acquire) {
                break;
            }
            if mode == LoopMode::Once {
                break;
            }
            if mode == LoopMode::UntilEmpty && self.external_work() == 0 {
                break;
            }
        }

        if let Some(id) = guard_timer {
            self.timers.borrow_mut().cancel(id);
        }

        self.shared.terminate.store(false, Ordering::Release);
        self.shared.loop_thread.store(0, Ordering::Release);
        self.running.set(false);
        let mut finished = self.shared.finished.lock();
        *finished = true;
        self.shared.finished_cv.notify_all();
        tracing::debug!(?mode, "event loop exited");
    }

    /// Live registrations and timers that keep `UntilEmpty` alive.
    fn external_work(&self) -> usize {
        self.registry.borrow().external + self.timers.borrow().external_count()
    }

    fn drain_injected(&self) {
        loop {
            // The borrow is released between pops: a task may enqueue more
            // work (which lands behind us in the queue) or stop the loop.
            let task = self.receiver.borrow_mut().pop();
            match task {
                Some(Task::User(op)) => op(),
                Some(Task::Stop) => self.shared.terminate.store(true, Ordering::Release),
                None => break,
            }
        }
    }

    fn poll_pass(&self, block: bool) {
        let timeout = if block {
            self.timers
                .borrow_mut()
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        } else {
            Some(Duration::ZERO)
        };
        let mut events = self.events.take();
        events.clear();
        if let Err(err) = self.poller.poll(&mut events, timeout) {
            tracing::warn!(error = %err, "poll pass failed");
        }
        tracing::trace!(count = events.len(), "poll pass delivered events");
        for event in events.drain(..) {
            let token = Token::from_bits(event.token);
            // Clone the handler out and release the registry before the
            // callback: handlers re-register and unregister from within
            // `ready`, and a handler removed earlier in this batch must be
            // skipped here.
            let dispatch = {
                let registry = self.registry.borrow();
                registry.get(token).map(|registration| {
                    (
                        Rc::clone(&registration.handler),
                        event.readiness.intersection(registration.interest),
                    )
                })
            };
            if let Some((handler, readiness)) = dispatch {
                if !readiness.is_empty() {
                    handler.ready(readiness);
                }
            }
        }
        self.events.replace(events);
        self.dispatch_timers();
    }

    fn dispatch_timers(&self) {
        let expired = self.timers.borrow_mut().pop_expired(Instant::now());
        for (_, callback) in expired {
            callback();
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.running.get())
            .field("registrations", &self.registry.borrow().external)
            .finish_non_exhaustive()
    }
}
