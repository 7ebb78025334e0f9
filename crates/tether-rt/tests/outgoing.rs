//! Outgoing channels: lazy connects, request/response over the framed
//! protocol, and transparent reconnect after the peer hangs up.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{frame, wait_for, EchoHandler};
use tether_rt::{
    ConnectOption, Context, Handler, HandlerChoice, HandlerFactory, ListenOption, Server,
};

/// Client-side handler: records every reply frame.
struct Recorder {
    replies: Mutex<Vec<Vec<u8>>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl Recorder {
    fn new() -> Arc<Recorder> {
        Arc::new(Recorder {
            replies: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        })
    }

    fn reply_count(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

impl Handler for Recorder {
    fn get_message_length(&self, _context: &Context, buf: &[u8]) -> isize {
        if buf.len() < 4 {
            return 0;
        }
        4 + u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as isize
    }

    fn on_message(&self, _context: &Context, buf: &[u8]) -> i32 {
        self.replies.lock().unwrap().push(buf.to_vec());
        1
    }

    fn on_connected(&self, _context: &Context) -> bool {
        self.connects.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn on_disconnected(&self, _context: &Context) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

fn echo_server(handler: Arc<EchoHandler>) -> (Server, u16) {
    common::init_logging();
    let mut server = Server::new();
    let mut option = ListenOption::new(0, HandlerChoice::Shared(handler));
    option.bind_ip = "127.0.0.1".to_owned();
    let addr = server.listen(option).unwrap();
    assert!(server.initialize(1, 0, None));
    (server, addr.port())
}

#[test]
fn first_send_materializes_the_connection() {
    let (mut echo, port) = echo_server(EchoHandler::new());

    let recorder = Recorder::new();
    let mut client = Server::new();
    assert!(client.initialize(2, 0, None));

    let channel = client.handle().connect(ConnectOption::new(
        "127.0.0.1",
        port,
        HandlerChoice::Shared(recorder.clone()),
    ));
    assert!(channel.is_valid());
    assert!(channel.is_outgoing());

    // Nothing is connected until the first send.
    assert_eq!(client.handle().outgoing_connections(), 0);
    assert_eq!(recorder.connects.load(Ordering::SeqCst), 0);

    assert!(client.handle().send(channel, &frame(b"ping")));
    assert!(wait_for(Duration::from_secs(5), || recorder.reply_count() == 1));
    assert_eq!(recorder.replies.lock().unwrap()[0], frame(b"ping"));
    assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
    assert_eq!(client.handle().outgoing_connections(), 1);

    client.shutdown();
    echo.shutdown();
}

#[test]
fn reconnects_after_peer_close() {
    // The echo server hangs up after each reply; the outgoing channel must
    // come back by itself on the next send.
    let (mut echo, port) = echo_server(EchoHandler::closing());

    let recorder = Recorder::new();
    let mut client = Server::new();
    assert!(client.initialize(1, 0, None));

    let channel = client.handle().connect(ConnectOption::new(
        "127.0.0.1",
        port,
        HandlerChoice::Shared(recorder.clone()),
    ));

    assert!(client.handle().send(channel, &frame(b"one")));
    assert!(wait_for(Duration::from_secs(5), || recorder.reply_count() == 1));

    // Wait for the server-side close to tear the first connection down.
    assert!(wait_for(Duration::from_secs(5), || {
        recorder.disconnects.load(Ordering::SeqCst) == 1
    }));

    assert!(client.handle().send(channel, &frame(b"two")));
    assert!(wait_for(Duration::from_secs(5), || recorder.reply_count() == 2));
    assert_eq!(recorder.replies.lock().unwrap()[1], frame(b"two"));
    assert_eq!(
        recorder.connects.load(Ordering::SeqCst),
        2,
        "second send must have opened a fresh connection"
    );

    client.shutdown();
    echo.shutdown();
}

#[test]
fn empty_send_acts_as_an_explicit_connect() {
    let (mut echo, port) = echo_server(EchoHandler::new());

    let recorder = Recorder::new();
    let mut client = Server::new();
    assert!(client.initialize(1, 0, None));

    let channel = client.handle().connect(ConnectOption::new(
        "127.0.0.1",
        port,
        HandlerChoice::Shared(recorder.clone()),
    ));

    // A zero-length send opens the connection without transmitting.
    assert!(client.handle().send(channel, &[]));
    assert!(wait_for(Duration::from_secs(5), || {
        recorder.connects.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(recorder.reply_count(), 0);

    client.shutdown();
    echo.shutdown();
}

#[test]
fn factory_builds_one_handler_per_connection() {
    struct CountingFactory {
        built: AtomicUsize,
        recorder: Arc<Recorder>,
    }

    impl HandlerFactory for CountingFactory {
        fn create(&self) -> Arc<dyn Handler> {
            self.built.fetch_add(1, Ordering::SeqCst);
            self.recorder.clone()
        }
    }

    let (mut echo, port) = echo_server(EchoHandler::closing());

    let recorder = Recorder::new();
    let factory = Arc::new(CountingFactory {
        built: AtomicUsize::new(0),
        recorder: recorder.clone(),
    });

    let mut client = Server::new();
    assert!(client.initialize(1, 0, None));
    let channel = client.handle().connect(ConnectOption::new(
        "127.0.0.1",
        port,
        HandlerChoice::Factory(factory.clone()),
    ));

    assert!(client.handle().send(channel, &frame(b"a")));
    assert!(wait_for(Duration::from_secs(5), || recorder.reply_count() == 1));
    assert!(wait_for(Duration::from_secs(5), || {
        recorder.disconnects.load(Ordering::SeqCst) == 1
    }));

    assert!(client.handle().send(channel, &frame(b"b")));
    assert!(wait_for(Duration::from_secs(5), || recorder.reply_count() == 2));

    assert_eq!(
        factory.built.load(Ordering::SeqCst),
        2,
        "each connection gets its own handler instance"
    );

    client.shutdown();
    echo.shutdown();
}

#[test]
fn forget_drops_the_route() {
    let (mut echo, port) = echo_server(EchoHandler::closing());

    let recorder = Recorder::new();
    let mut client = Server::new();
    assert!(client.initialize(1, 0, None));
    let channel = client.handle().connect(ConnectOption::new(
        "127.0.0.1",
        port,
        HandlerChoice::Shared(recorder.clone()),
    ));

    assert!(client.handle().send(channel, &frame(b"hello")));
    assert!(wait_for(Duration::from_secs(5), || recorder.reply_count() == 1));
    assert!(wait_for(Duration::from_secs(5), || {
        recorder.disconnects.load(Ordering::SeqCst) == 1
    }));

    client.handle().forget(channel);

    // Without the route, later sends cannot revive the channel.
    client.handle().send(channel, &frame(b"never"));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.reply_count(), 1);

    client.shutdown();
    echo.shutdown();
}
