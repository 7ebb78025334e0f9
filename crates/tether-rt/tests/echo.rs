//! End-to-end echo scenarios over a running server.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{frame, read_exact_timeout, wait_for, EchoHandler};
use tether_rt::{HandlerChoice, ListenOption, Server};

fn start_server(
    handler: std::sync::Arc<EchoHandler>,
    slots: usize,
    workers: usize,
) -> (Server, std::net::SocketAddr) {
    common::init_logging();
    let mut server = Server::new();
    let mut option = ListenOption::new(0, HandlerChoice::Shared(handler));
    option.bind_ip = "127.0.0.1".to_owned();
    let addr = server.listen(option).unwrap();
    assert!(server.initialize(slots, workers, None));
    (server, addr)
}

#[test]
fn echo_roundtrip() {
    let handler = EchoHandler::new();
    let (mut server, addr) = start_server(handler.clone(), 1, 0);

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(&frame(b"Hello")).unwrap();

    let back = read_exact_timeout(&mut client, 9, Duration::from_secs(5));
    assert_eq!(back, frame(b"Hello"));
    assert_eq!(handler.messages.load(Ordering::SeqCst), 1);

    drop(client);
    assert!(wait_for(Duration::from_secs(5), || {
        handler.disconnects.load(Ordering::SeqCst) == 1
    }));
    server.shutdown();
    assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn coalesced_frames_echo_in_order() {
    // Two frames in a single TCP write: exactly two messages, both echoed,
    // in order.
    let handler = EchoHandler::new();
    let (mut server, addr) = start_server(handler.clone(), 1, 0);

    let mut client = TcpStream::connect(addr).unwrap();
    let mut burst = frame(b"A");
    burst.extend_from_slice(&frame(b"BC"));
    client.write_all(&burst).unwrap();

    let back = read_exact_timeout(&mut client, burst.len(), Duration::from_secs(5));
    assert_eq!(back, burst);
    assert_eq!(handler.messages.load(Ordering::SeqCst), 2);

    server.shutdown();
}

#[test]
fn graceful_disconnect_after_reply() {
    // The handler replies and returns 0: the client must receive the full
    // echo, then EOF, and on_disconnected fires exactly once.
    let handler = EchoHandler::closing();
    let (mut server, addr) = start_server(handler.clone(), 1, 0);

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(&frame(b"Hello")).unwrap();

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut all = Vec::new();
    client.read_to_end(&mut all).unwrap();
    assert_eq!(all, frame(b"Hello"));

    assert!(wait_for(Duration::from_secs(5), || {
        handler.disconnects.load(Ordering::SeqCst) == 1
    }));
    server.shutdown();
    assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn sequential_frames_echo_back() {
    let handler = EchoHandler::new();
    let (mut server, addr) = start_server(handler.clone(), 2, 0);

    let mut client = TcpStream::connect(addr).unwrap();
    for i in 0..100u32 {
        let payload = i.to_be_bytes();
        let f = frame(&payload);
        client.write_all(&f).unwrap();
        let back = read_exact_timeout(&mut client, f.len(), Duration::from_secs(5));
        assert_eq!(back, f);
    }
    assert_eq!(handler.messages.load(Ordering::SeqCst), 100);

    server.shutdown();
}

#[test]
fn worker_pool_echo_preserves_pinned_order() {
    // With workers configured, frames hashed to the same slot run on one
    // worker in frame order; the echoes come back ordered.
    let handler = EchoHandler::pinned();
    let (mut server, addr) = start_server(handler.clone(), 1, 2);

    let mut client = TcpStream::connect(addr).unwrap();
    let mut expected = Vec::new();
    for i in 0..200u32 {
        let f = frame(&i.to_be_bytes());
        client.write_all(&f).unwrap();
        expected.extend_from_slice(&f);
    }

    let back = read_exact_timeout(&mut client, expected.len(), Duration::from_secs(10));
    assert_eq!(back, expected);
    assert_eq!(handler.messages.load(Ordering::SeqCst), 200);

    server.shutdown();
}

#[test]
fn worker_pool_unpinned_echoes_everything() {
    // Unpinned jobs may interleave across workers; every frame still gets
    // echoed exactly once.
    let handler = EchoHandler::new();
    let (mut server, addr) = start_server(handler.clone(), 1, 4);

    let mut client = TcpStream::connect(addr).unwrap();
    let mut total = 0;
    for i in 0..100u32 {
        let f = frame(&i.to_be_bytes());
        client.write_all(&f).unwrap();
        total += f.len();
    }

    let back = read_exact_timeout(&mut client, total, Duration::from_secs(10));
    assert_eq!(back.len(), total);
    assert_eq!(handler.messages.load(Ordering::SeqCst), 100);

    server.shutdown();
}

#[test]
fn rejects_connections_over_the_incoming_limit() {
    common::init_logging();
    let handler = EchoHandler::new();
    let mut server = Server::new();
    server.configure(|c| c.maximum_incoming_connections = 2);
    let mut option = ListenOption::new(0, HandlerChoice::Shared(handler.clone()));
    option.bind_ip = "127.0.0.1".to_owned();
    let addr = server.listen(option).unwrap();
    assert!(server.initialize(1, 0, None));

    let mut keep: Vec<TcpStream> = Vec::new();
    for _ in 0..2 {
        let mut c = TcpStream::connect(addr).unwrap();
        // Prove the connection is serviced.
        c.write_all(&frame(b"ok")).unwrap();
        read_exact_timeout(&mut c, 6, Duration::from_secs(5));
        keep.push(c);
    }

    // The third connection is accepted by the OS but closed by the server
    // without service.
    let mut over = TcpStream::connect(addr).unwrap();
    over.write_all(&frame(b"no")).unwrap();
    over.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = Vec::new();
    let got = over.read_to_end(&mut buf).unwrap_or(0);
    assert_eq!(got, 0, "over-limit connection must see EOF, got {buf:?}");

    server.shutdown();
}
