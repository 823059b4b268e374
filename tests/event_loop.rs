//! Event loop integration tests: modes, stop rendezvous, cross-thread
//! injection, and handler/timeout registration.

use netloop::net::socket;
use netloop::{EventHandler, EventLoop, Interest, LoopMode};
use std::cell::Cell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Spawns a loop on its own thread running `mode`, returning its handle
/// once the loop thread is actually driving it.
fn spawn_loop(mode: LoopMode) -> (netloop::LoopHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let worker = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("create loop");
        tx.send(event_loop.handle()).expect("send handle");
        event_loop.run(mode);
    });
    let handle = rx.recv().expect("receive handle");
    while handle.in_loop_thread() {
        thread::yield_now();
    }
    (handle, worker)
}

#[test]
fn stop_terminates_a_forever_loop() {
    let (handle, worker) = spawn_loop(LoopMode::Forever);
    handle.stop();
    worker.join().expect("loop thread exits");
}

#[test]
fn stop_terminates_a_blocked_until_empty_loop() {
    let (tx, rx) = mpsc::channel();
    let worker = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("create loop");
        // Pending external work keeps until-empty alive indefinitely.
        event_loop.register_timeout(Duration::from_secs(3600), Box::new(|| {}));
        tx.send(event_loop.handle()).expect("send handle");
        event_loop.run(LoopMode::UntilEmpty);
    });
    let handle = rx.recv().expect("receive handle");
    while handle.in_loop_thread() {
        thread::yield_now();
    }
    handle.stop();
    worker.join().expect("loop thread exits");
}

#[test]
fn stop_is_safe_when_the_loop_is_not_running() {
    let event_loop = EventLoop::new().expect("create loop");
    let start = Instant::now();
    event_loop.stop();
    assert!(start.elapsed() < Duration::from_secs(5), "stop hung");
}

#[test]
fn once_returns_promptly_when_nothing_is_registered() {
    // Only the internal wakeup handler exists; it must not keep a poll
    // pass blocked.
    let event_loop = EventLoop::new().expect("create loop");
    event_loop.run(LoopMode::Once);
}

#[test]
fn until_empty_ignores_internal_handlers() {
    let event_loop = EventLoop::new().expect("create loop");
    let start = Instant::now();
    event_loop.run(LoopMode::UntilEmpty);
    assert!(start.elapsed() < Duration::from_secs(5), "until-empty hung");
}

#[test]
fn run_on_event_loop_is_inline_while_idle() {
    let event_loop = EventLoop::new().expect("create loop");
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    event_loop.run_on_event_loop(move || flag.store(true, Ordering::SeqCst));
    assert!(ran.load(Ordering::SeqCst), "idle-loop task must run inline");
}

#[test]
fn run_on_event_loop_is_inline_from_loop_thread() {
    let event_loop = EventLoop::new().expect("create loop");
    let handle = event_loop.handle();
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = Arc::clone(&order);
    let nested = Arc::clone(&order);
    event_loop.register_timeout(
        Duration::from_millis(5),
        Box::new(move || {
            first.lock().unwrap().push(1);
            let inner = Arc::clone(&nested);
            handle.run_on_event_loop(move || inner.lock().unwrap().push(2));
            nested.lock().unwrap().push(3);
        }),
    );
    event_loop.run(LoopMode::UntilEmpty);

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn run_on_event_loop_and_wait_observes_completion() {
    let (handle, worker) = spawn_loop(LoopMode::Forever);

    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    handle.run_on_event_loop_and_wait(move || {
        thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::SeqCst);
    });
    assert!(done.load(Ordering::SeqCst), "op must finish before the wait returns");

    handle.stop();
    worker.join().expect("loop thread exits");
}

#[test]
fn injected_tasks_keep_per_producer_order() {
    const PRODUCERS: usize = 3;
    const PER_PRODUCER: usize = 200;

    let (handle, worker) = spawn_loop(LoopMode::Forever);
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut producers = Vec::new();
    for producer in 0..PRODUCERS {
        let handle = handle.clone();
        let log = Arc::clone(&log);
        producers.push(thread::spawn(move || {
            for seq in 0..PER_PRODUCER {
                let log = Arc::clone(&log);
                handle.run_on_event_loop(move || log.lock().unwrap().push((producer, seq)));
            }
        }));
    }
    for producer in producers {
        producer.join().expect("producer exits");
    }
    // A final synchronous task flushes everything enqueued before it.
    handle.run_on_event_loop_and_wait(|| {});

    let log = log.lock().unwrap();
    assert_eq!(log.len(), PRODUCERS * PER_PRODUCER);
    let mut next = [0usize; PRODUCERS];
    for (producer, seq) in log.iter() {
        assert_eq!(*seq, next[*producer], "per-producer order violated");
        next[*producer] += 1;
    }

    handle.stop();
    worker.join().expect("loop thread exits");
}

struct CountingHandler {
    fd: RawFd,
    hits: Cell<u32>,
    saw_readable: Cell<bool>,
}

impl EventHandler for CountingHandler {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn ready(&self, events: Interest) {
        self.hits.set(self.hits.get() + 1);
        if events.is_readable() {
            self.saw_readable.set(true);
        }
    }
}

#[test]
fn readable_descriptor_dispatches_its_handler() {
    let event_loop = EventLoop::new().expect("create loop");
    let (a, b) = socket::socketpair_stream().expect("socketpair");
    socket::set_nonblocking(b).expect("nonblocking");

    let handler = Rc::new(CountingHandler {
        fd: b,
        hits: Cell::new(0),
        saw_readable: Cell::new(false),
    });
    let token = event_loop
        .register_handler(handler.clone(), Interest::READABLE)
        .expect("register");
    assert_eq!(event_loop.watched(token), Interest::READABLE);

    socket::write(a, b"x").expect("send");
    event_loop.run(LoopMode::Once);

    assert!(handler.hits.get() >= 1, "handler did not run");
    assert!(handler.saw_readable.get());

    event_loop.unregister_handler(token);
    assert_eq!(event_loop.watched(token), Interest::NONE);
    // Idempotent on a stale token.
    event_loop.unregister_handler(token);

    socket::close(a);
    socket::close(b);
}

#[test]
fn update_handler_switches_the_watched_set() {
    let event_loop = EventLoop::new().expect("create loop");
    let (a, b) = socket::socketpair_stream().expect("socketpair");
    socket::set_nonblocking(b).expect("nonblocking");

    let handler = Rc::new(CountingHandler {
        fd: b,
        hits: Cell::new(0),
        saw_readable: Cell::new(false),
    });
    let token = event_loop
        .register_handler(handler, Interest::WRITABLE)
        .expect("register");
    event_loop
        .update_handler(token, Interest::BOTH)
        .expect("update");
    assert_eq!(event_loop.watched(token), Interest::BOTH);

    event_loop.unregister_handler(token);
    socket::close(a);
    socket::close(b);
}

#[test]
fn timeout_fires_and_keeps_until_empty_alive() {
    let event_loop = EventLoop::new().expect("create loop");
    let fired = Rc::new(Cell::new(false));
    let flag = Rc::clone(&fired);
    event_loop.register_timeout(Duration::from_millis(20), Box::new(move || flag.set(true)));

    let start = Instant::now();
    event_loop.run(LoopMode::UntilEmpty);

    assert!(fired.get(), "timeout did not fire");
    assert!(start.elapsed() >= Duration::from_millis(15), "fired far too early");
}

#[test]
fn cancelled_timeout_never_fires() {
    let event_loop = EventLoop::new().expect("create loop");
    let fired = Rc::new(Cell::new(false));
    let flag = Rc::clone(&fired);
    let token =
        event_loop.register_timeout(Duration::from_millis(50), Box::new(move || flag.set(true)));

    assert!(event_loop.unregister_timeout(token));
    assert!(!event_loop.unregister_timeout(token), "cancel is one-shot");

    // With the timer gone there is no external work left to wait for.
    event_loop.run(LoopMode::UntilEmpty);
    assert!(!fired.get());
}

#[test]
fn stopped_loop_can_be_driven_again() {
    let (handle, worker) = spawn_loop(LoopMode::Forever);
    handle.stop();
    worker.join().expect("loop thread exits");

    // The termination flag must have been reset on exit.
    let event_loop = EventLoop::new().expect("create loop");
    event_loop.stop();
    event_loop.run(LoopMode::Once);
    event_loop.run(LoopMode::Once);
}
