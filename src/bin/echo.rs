//! Demo echo server: one loop, one listener, one stream per connection.
//!
//! ```text
//! $ echo [port]
//! Ready to talk back on 41893
//! ```

use netloop::{
    Buffer, ConnectionListener, Error, EventLoop, LoopMode, ReadCallback, Stream,
};
use std::cell::RefCell;
use std::env;
use std::process::ExitCode;
use std::rc::Rc;

/// One accepted connection: the stream plus the read callback echoing its
/// input back. Dropping the slot tears the stream down.
struct EchoConnection {
    stream: RefCell<Option<Stream>>,
}

impl ReadCallback for EchoConnection {
    fn available(&self, buffer: &mut Buffer) {
        let mut payload = Buffer::new();
        payload.append_buffer(buffer);
        if let Some(stream) = &*self.stream.borrow() {
            if let Err(error) = stream.write_buffer(&mut payload, None) {
                eprintln!("While echoing: {error}");
            }
        }
    }

    fn error(&self, error: &Error) {
        eprintln!("While reading: {error}");
        self.stream.borrow_mut().take();
    }

    fn eof(&self) {
        self.stream.borrow_mut().take();
    }
}

fn main() -> ExitCode {
    let port: u16 = match env::args().nth(1).map(|arg| arg.parse()).transpose() {
        Ok(port) => port.unwrap_or(0),
        Err(_) => {
            eprintln!("usage: echo [port]");
            return ExitCode::FAILURE;
        }
    };

    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(error) => {
            eprintln!("While setting up: {error}");
            return ExitCode::FAILURE;
        }
    };

    let accept_loop = Rc::clone(&event_loop);
    let listener = ConnectionListener::new(
        &event_loop,
        move |fd| {
            let connection = Rc::new(EchoConnection {
                stream: RefCell::new(None),
            });
            let stream = Stream::wrap(&accept_loop, fd);
            if let Err(error) = stream.start_read(connection.clone()) {
                eprintln!("While starting connection: {error}");
                return;
            }
            *connection.stream.borrow_mut() = Some(stream);
        },
        |error| eprintln!("While listening: {error}"),
    );

    let setup = listener
        .bind(port)
        .and_then(|()| listener.listen(128))
        .and_then(|()| listener.start_accepting());
    if let Err(error) = setup {
        eprintln!("While setting up: {error}");
        return ExitCode::FAILURE;
    }

    println!("Ready to talk back on {}", listener.port());
    event_loop.run(LoopMode::Forever);
    ExitCode::SUCCESS
}
