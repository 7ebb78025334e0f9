//! Idle and jam timeout behavior against a live server.

mod common;

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use common::EchoHandler;
use tether_rt::{HandlerChoice, ListenOption, Server};

#[test]
fn idle_connection_is_closed_within_the_window() {
    // idle_timeout of 2 s, health check every 1 s: a silent client is cut
    // between 2.0 s and ~3 s after connecting, with no message callback.
    common::init_logging();
    let handler = EchoHandler::new();
    let mut server = Server::new();
    server.configure(|c| c.incoming_idle_timeout = Duration::from_secs(2));
    let mut option = ListenOption::new(0, HandlerChoice::Shared(handler.clone()));
    option.bind_ip = "127.0.0.1".to_owned();
    let addr = server.listen(option).unwrap();
    assert!(server.initialize(1, 0, None));

    let mut client = TcpStream::connect(addr).unwrap();
    let connected = Instant::now();

    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).unwrap_or(0);
    let elapsed = connected.elapsed();

    assert_eq!(n, 0, "server must close the idle connection");
    assert!(
        elapsed >= Duration::from_secs(2),
        "closed too early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(3500),
        "closed too late: {elapsed:?}"
    );

    assert_eq!(handler.messages.load(Ordering::SeqCst), 0);
    assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);

    server.shutdown();
}

#[test]
fn receive_timeout_cuts_half_frames() {
    // A client that starts a frame and stalls trips the receive jam.
    common::init_logging();
    let handler = EchoHandler::new();
    let mut server = Server::new();
    server.configure(|c| {
        c.incoming_receive_timeout = Duration::from_secs(1);
        c.incoming_idle_timeout = Duration::from_secs(3600);
    });
    let mut option = ListenOption::new(0, HandlerChoice::Shared(handler.clone()));
    option.bind_ip = "127.0.0.1".to_owned();
    let addr = server.listen(option).unwrap();
    assert!(server.initialize(1, 0, None));

    let mut client = TcpStream::connect(addr).unwrap();
    use std::io::Write;
    // Header promises 100 bytes; send only the header.
    client.write_all(&100u32.to_be_bytes()).unwrap();

    let started = Instant::now();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).unwrap_or(0);

    assert_eq!(n, 0, "server must cut the stalled sender");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(handler.messages.load(Ordering::SeqCst), 0);

    server.shutdown();
}
