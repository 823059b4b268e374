//! Stream integration tests over socketpairs: write-queue draining,
//! completion ordering, EOF delivery, error paths, and callback lifetime.

use netloop::net::socket;
use netloop::{Buffer, Error, EventLoop, Interest, LoopMode, ReadCallback, Stream, WriteCallback};
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;

#[derive(Default)]
struct TestWriteCallback {
    completed: Cell<bool>,
    errored: Cell<bool>,
}

impl WriteCallback for TestWriteCallback {
    fn complete(&self) {
        self.completed.set(true);
    }

    fn error(&self, _error: &Error) {
        self.errored.set(true);
    }
}

#[derive(Default)]
struct TestReadCallback {
    total: Cell<usize>,
    eofs: Cell<u32>,
    errors: Cell<u32>,
}

impl ReadCallback for TestReadCallback {
    fn available(&self, buffer: &mut Buffer) {
        let mut chunk = vec![0u8; buffer.size()];
        let n = buffer.read(&mut chunk);
        self.total.set(self.total.get() + n);
    }

    fn error(&self, _error: &Error) {
        self.errors.set(self.errors.get() + 1);
    }

    fn eof(&self) {
        self.eofs.set(self.eofs.get() + 1);
    }
}

fn nonblocking_pair() -> (RawFd, RawFd) {
    let (a, b) = socket::socketpair_stream().expect("socketpair");
    socket::set_nonblocking(a).expect("nonblocking a");
    socket::set_nonblocking(b).expect("nonblocking b");
    (a, b)
}

fn read_exact(fd: RawFd, out: &mut [u8]) {
    let mut total = 0;
    while total < out.len() {
        match socket::read(fd, &mut out[total..]) {
            Ok(0) => panic!("peer closed early"),
            Ok(n) => total += n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::yield_now();
            }
            Err(err) => panic!("read failed: {err}"),
        }
    }
}

#[test]
fn back_to_back_writes_both_complete() {
    let event_loop = EventLoop::new().expect("create loop");
    let (a, b) = nonblocking_pair();
    let stream = Stream::wrap(&event_loop, a);

    let cb1 = Rc::new(TestWriteCallback::default());
    let cb2 = Rc::new(TestWriteCallback::default());
    let payload = [b'A'; 64];
    stream.write(&payload, Some(cb1.clone())).expect("queue write");
    stream.write(&payload, Some(cb2.clone())).expect("queue write");
    assert_eq!(stream.watched(), Interest::WRITABLE);

    event_loop.run(LoopMode::UntilEmpty);

    assert!(cb1.completed.get() && cb2.completed.get());
    assert!(!cb1.errored.get() && !cb2.errored.get());
    // The WRITE bit is cleared once the queue drains.
    assert_eq!(stream.watched(), Interest::NONE);

    let mut echoed = [0u8; 128];
    read_exact(b, &mut echoed);
    assert!(echoed.iter().all(|&byte| byte == b'A'));
    socket::close(b);
}

#[test]
fn write_buffer_splices_and_delivers() {
    let event_loop = EventLoop::new().expect("create loop");
    let (a, b) = nonblocking_pair();
    let stream = Stream::wrap(&event_loop, a);

    let mut payload = Buffer::new();
    payload.append(b"hello");
    let callback = Rc::new(TestWriteCallback::default());
    stream
        .write_buffer(&mut payload, Some(callback.clone()))
        .expect("queue write");
    assert!(payload.is_empty(), "write_buffer must splice the source");

    event_loop.run(LoopMode::UntilEmpty);
    assert!(callback.completed.get());

    let mut echoed = [0u8; 5];
    read_exact(b, &mut echoed);
    assert_eq!(&echoed, b"hello");
    socket::close(b);
}

#[test]
fn megabyte_transfer_pumps_between_two_streams() {
    const TOTAL: usize = 1 << 20;

    let event_loop = EventLoop::new().expect("create loop");
    let (a, b) = nonblocking_pair();
    let writer = Stream::wrap(&event_loop, a);
    let reader = Stream::wrap(&event_loop, b);

    let write_callback = Rc::new(TestWriteCallback::default());
    let read_callback = Rc::new(TestReadCallback::default());
    let payload = vec![b'A'; TOTAL];
    writer
        .write(&payload, Some(write_callback.clone()))
        .expect("queue write");
    reader.start_read(read_callback.clone()).expect("start read");

    let mut passes = 0;
    while read_callback.total.get() < TOTAL {
        event_loop.run(LoopMode::Once);
        passes += 1;
        assert!(passes < 10_000, "transfer stalled");
    }

    assert_eq!(read_callback.total.get(), TOTAL);
    assert_eq!(read_callback.eofs.get(), 0);
    assert_eq!(read_callback.errors.get(), 0);
    assert!(write_callback.completed.get());
    assert!(!write_callback.errored.get());
}

#[test]
fn write_to_a_closed_peer_reports_error_not_completion() {
    let event_loop = EventLoop::new().expect("create loop");
    let (a, b) = nonblocking_pair();
    socket::close(b);

    let stream = Stream::wrap(&event_loop, a);
    let callback = Rc::new(TestWriteCallback::default());
    stream
        .write(&[b'A'; 64], Some(callback.clone()))
        .expect("queue write");

    event_loop.run(LoopMode::Once);
    event_loop.run(LoopMode::Once);

    assert!(callback.errored.get(), "write error was not delivered");
    assert!(!callback.completed.get());
}

#[test]
fn close_fires_eof_once_and_makes_operations_no_ops() {
    let event_loop = EventLoop::new().expect("create loop");
    let (a, b) = nonblocking_pair();
    let stream = Stream::wrap(&event_loop, b);

    let callback = Rc::new(TestReadCallback::default());
    stream.start_read(callback.clone()).expect("start read");

    stream.close();
    assert_eq!(callback.eofs.get(), 1);

    // Closed streams ignore everything.
    stream.close();
    stream.write(b"x", None).expect("no-op write");
    stream.start_read(callback.clone()).expect("no-op start_read");
    stream.stop_read();
    assert_eq!(callback.eofs.get(), 1);
    assert_eq!(stream.watched(), Interest::NONE);
    assert_eq!(stream.fd(), -1);

    socket::close(a);
}

#[test]
fn peer_close_delivers_eof_exactly_once() {
    let event_loop = EventLoop::new().expect("create loop");
    let (a, b) = nonblocking_pair();
    let stream = Stream::wrap(&event_loop, b);

    let callback = Rc::new(TestReadCallback::default());
    stream.start_read(callback.clone()).expect("start read");
    socket::close(a);

    event_loop.run(LoopMode::Once);
    event_loop.run(LoopMode::Once);

    assert_eq!(callback.eofs.get(), 1);
    assert_eq!(callback.errors.get(), 0);
}

#[test]
fn stop_read_preserves_write_interest() {
    let event_loop = EventLoop::new().expect("create loop");
    let (a, b) = nonblocking_pair();
    let stream = Stream::wrap(&event_loop, a);

    let read_callback = Rc::new(TestReadCallback::default());
    stream.start_read(read_callback).expect("start read");
    stream.write(b"x", None).expect("queue write");
    assert_eq!(stream.watched(), Interest::BOTH);

    stream.stop_read();
    assert_eq!(stream.watched(), Interest::WRITABLE);

    event_loop.run(LoopMode::UntilEmpty);
    assert_eq!(stream.watched(), Interest::NONE);
    socket::close(b);
}

struct DropOnComplete {
    slot: RefCell<Option<Stream>>,
    completed: Cell<bool>,
    errored: Cell<bool>,
}

impl WriteCallback for DropOnComplete {
    fn complete(&self) {
        self.completed.set(true);
        // The final completion callback is allowed to free the stream.
        self.slot.borrow_mut().take();
    }

    fn error(&self, _error: &Error) {
        self.errored.set(true);
    }
}

#[test]
fn final_completion_callback_may_drop_the_stream() {
    let event_loop = EventLoop::new().expect("create loop");
    let (a, b) = nonblocking_pair();

    let callback = Rc::new(DropOnComplete {
        slot: RefCell::new(None),
        completed: Cell::new(false),
        errored: Cell::new(false),
    });
    let stream = Stream::wrap(&event_loop, a);
    stream
        .write(&[b'A'; 64], Some(callback.clone()))
        .expect("queue write");
    *callback.slot.borrow_mut() = Some(stream);

    event_loop.run(LoopMode::UntilEmpty);

    assert!(callback.completed.get());
    assert!(!callback.errored.get());
    assert!(callback.slot.borrow().is_none(), "stream was not dropped");

    let mut echoed = [0u8; 64];
    read_exact(b, &mut echoed);
    socket::close(b);
}

#[derive(Default)]
struct TestConnectCallback {
    completed: Cell<bool>,
    errored: Cell<bool>,
}

impl netloop::ConnectCallback for TestConnectCallback {
    fn complete(&self) {
        self.completed.set(true);
    }

    fn error(&self, _error: &Error) {
        self.errored.set(true);
    }
}

#[test]
fn connect_rejects_a_bad_literal_inline() {
    let event_loop = EventLoop::new().expect("create loop");
    let stream = Stream::create(&event_loop);
    let callback = Rc::new(TestConnectCallback::default());

    stream.connect("not-an-address", 1, callback.clone());

    assert!(callback.errored.get());
    assert!(!callback.completed.get());
    assert_eq!(stream.fd(), -1);
}

#[test]
fn connect_to_a_dead_port_reports_error() {
    let event_loop = EventLoop::new().expect("create loop");

    // Grab an ephemeral port and release it so nothing is listening there.
    let probe = socket::socket_v4().expect("socket");
    socket::bind_v4(probe, std::net::Ipv4Addr::LOCALHOST, 0).expect("bind");
    let dead_port = socket::local_port(probe).expect("port");
    socket::close(probe);

    let stream = Stream::create(&event_loop);
    let callback = Rc::new(TestConnectCallback::default());
    stream.connect("127.0.0.1", dead_port, callback.clone());

    let mut passes = 0;
    while !callback.completed.get() && !callback.errored.get() {
        event_loop.run(LoopMode::Once);
        passes += 1;
        assert!(passes < 1_000, "connect outcome never arrived");
    }
    assert!(callback.errored.get());
    assert!(!callback.completed.get());
}

#[test]
fn close_wakes_a_pending_connect() {
    let event_loop = EventLoop::new().expect("create loop");

    // 10.255.255.1 is unroutable enough that the connect stays pending.
    let stream = Stream::create(&event_loop);
    let callback = Rc::new(TestConnectCallback::default());
    stream.connect("10.255.255.1", 9, callback.clone());

    if !callback.errored.get() && !callback.completed.get() {
        stream.close();
        assert!(callback.errored.get(), "pending connect must observe close");
    }
}
