//! Shared pieces for the end-to-end tests: a length-prefixed echo handler
//! and small blocking-client helpers.
#![allow(dead_code)]

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tether_rt::{Channel, Context, Handler};

/// Length-prefixed echo: the first four bytes are the big-endian payload
/// length, and every complete frame is sent back verbatim.
pub struct EchoHandler {
    pub close_after_reply: bool,
    pub pin_worker: bool,
    pub messages: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub last_channel: Mutex<Option<Channel>>,
}

impl EchoHandler {
    pub fn new() -> Arc<EchoHandler> {
        Arc::new(EchoHandler {
            close_after_reply: false,
            pin_worker: false,
            messages: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            last_channel: Mutex::new(None),
        })
    }

    pub fn closing() -> Arc<EchoHandler> {
        Arc::new(EchoHandler { close_after_reply: true, ..Self::unwrapped() })
    }

    pub fn pinned() -> Arc<EchoHandler> {
        Arc::new(EchoHandler { pin_worker: true, ..Self::unwrapped() })
    }

    fn unwrapped() -> EchoHandler {
        EchoHandler {
            close_after_reply: false,
            pin_worker: false,
            messages: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            last_channel: Mutex::new(None),
        }
    }
}

impl Handler for EchoHandler {
    fn get_message_length(&self, _context: &Context, buf: &[u8]) -> isize {
        if buf.len() < 4 {
            return 0;
        }
        4 + u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as isize
    }

    fn on_message(&self, context: &Context, buf: &[u8]) -> i32 {
        self.messages.fetch_add(1, Ordering::SeqCst);
        assert!(context.server().send(context.channel(), buf));
        if self.close_after_reply {
            0
        } else {
            1
        }
    }

    fn hash_message(&self, _context: &Context, _buf: &[u8]) -> i32 {
        if self.pin_worker {
            0
        } else {
            -1
        }
    }

    fn on_connected(&self, context: &Context) -> bool {
        *self.last_channel.lock().unwrap() = Some(context.channel());
        true
    }

    fn on_disconnected(&self, _context: &Context) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Route `log` output through the test harness when RUST_LOG is set.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `[u32 big-endian payload length][payload]`.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

/// Read exactly `n` bytes, failing the test after `timeout`.
pub fn read_exact_timeout(stream: &mut TcpStream, n: usize, timeout: Duration) -> Vec<u8> {
    stream.set_read_timeout(Some(timeout)).unwrap();
    let mut buf = vec![0u8; n];
    let mut got = 0;
    let deadline = Instant::now() + timeout;
    while got < n {
        assert!(Instant::now() < deadline, "timed out after {got}/{n} bytes");
        match stream.read(&mut buf[got..]) {
            Ok(0) => panic!("peer closed after {got}/{n} bytes"),
            Ok(m) => got += m,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => panic!("read failed: {e}"),
        }
    }
    buf
}

/// Wait until `cond` holds or the timeout elapses.
pub fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
