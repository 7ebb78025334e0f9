//! Per-connection state machine.
//!
//! A [`Linkage`] owns a transport and drives it through reactor events:
//! accumulating reads into frames, queueing and flushing writes, tracking
//! jam timestamps so the health check can kill stuck connections, and
//! sequencing graceful shutdown. It never blocks; every partial operation
//! is parked as a pending [`IoAction`] and replayed on the next readiness
//! event.
//!
//! Framing is delegated to the handler: `get_message_length` inspects the
//! leading bytes and reports the full frame length (`>0`), "keep reading"
//! (`0`) or "garbage, kill it" (`<0`). Complete frames are handed to
//! `on_message` in order.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use mio::event::Source;

use crate::io::{IoAction, IoStatus, TlsPeer, Transport};
use crate::reactor::{ClientId, LinkageBase, Reactor};

/// Upper bound on buffered outgoing bytes.
const MAX_SENDING_BUFFER: usize = 64 * 1024 * 1024;

/// Read chunk size per transport read.
const READ_CHUNK: usize = 65536;

pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// LinkHandler
// ---------------------------------------------------------------------------

/// Low-level per-connection callbacks.
///
/// The handler sees the owning [`Linkage`] directly and may send on it from
/// inside `on_message`; higher layers wrap this with their own context.
pub trait LinkHandler {
    /// Report the full frame length from its leading bytes.
    ///
    /// `>0`: total frame length (header included), even if not all bytes
    /// arrived yet. `0`: undetermined, keep receiving. `<0`: invalid.
    fn get_message_length(&self, link: &Linkage, buf: &[u8]) -> isize;

    /// A complete frame. `>0` keep going, `0` hang up gracefully, `<0`
    /// hang up immediately.
    fn on_message(&self, link: &mut Linkage, buf: &[u8]) -> i32;

    fn on_connected(&self, _link: &mut Linkage) -> bool {
        true
    }

    fn on_disconnected(&self, link: &Linkage) {
        debug!("disconnected: {}", link.peer());
    }

    fn on_error(&self, link: &Linkage, reading: bool, errnum: i32) {
        warn!(
            "{} error for {}: errno {errnum}",
            if reading { "read" } else { "write" },
            link.peer()
        );
    }

    fn cleanup(&self, _link: &Linkage, _now: Instant) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Linkage
// ---------------------------------------------------------------------------

pub struct Linkage {
    io: Box<dyn Transport>,
    handler: Rc<dyn LinkHandler>,
    peer: SocketAddr,
    me: SocketAddr,

    rbuf: Vec<u8>,
    wbuf: Vec<u8>,
    scratch: Vec<u8>,
    /// Length of the jammed write, replayed verbatim on retry.
    last_writing: usize,
    /// Current frame length once determined, 0 otherwise.
    rlength: usize,

    action: IoAction,
    attached: bool,
    graceful: bool,
    closed: bool,

    want_read: bool,
    want_write: bool,

    receive_timeout: Duration,
    connect_timeout: Duration,
    send_timeout: Duration,
    idle_timeout: Duration,

    last_received: Instant,
    last_sent: Instant,
    receive_jam: Option<Instant>,
    connect_jam: Option<Instant>,
    send_jam: Option<Instant>,

    /// Error to report instead of the OS errno, set when the handler
    /// rejected a frame.
    handler_errno: Option<i32>,
}

impl Linkage {
    /// The linkage is inert until [`attach`](Linkage::attach)ed.
    pub fn new(
        io: Box<dyn Transport>,
        handler: Rc<dyn LinkHandler>,
        peer: SocketAddr,
        me: SocketAddr,
    ) -> Linkage {
        let now = Instant::now();
        Linkage {
            io,
            handler,
            peer,
            me,
            rbuf: Vec::new(),
            wbuf: Vec::new(),
            scratch: vec![0u8; READ_CHUNK],
            last_writing: 0,
            rlength: 0,
            action: IoAction::None,
            attached: false,
            graceful: false,
            closed: false,
            want_read: false,
            want_write: false,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            last_received: now,
            last_sent: now,
            receive_jam: None,
            connect_jam: None,
            send_jam: None,
            handler_errno: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn me(&self) -> SocketAddr {
        self.me
    }

    pub fn tls_peer(&self) -> Option<&TlsPeer> {
        self.io.tls_peer()
    }

    /// Zero disables the timeout.
    pub fn set_receive_timeout(&mut self, timeout: Duration) {
        self.receive_timeout = timeout;
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    pub fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }

    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    /// Initialize the transport and register with `reactor`.
    ///
    /// Established connections fire `on_connected` immediately; connecting
    /// ones arm the transport's requested action and wait for readiness.
    /// Returns `None` when the transport or handler rejects the connection;
    /// the linkage is left detached and `on_disconnected` does not fire.
    pub fn attach(this: &Rc<std::cell::RefCell<Linkage>>, reactor: &mut Reactor) -> Option<ClientId> {
        let (plan, connecting) = {
            let mut link = this.borrow_mut();
            if link.attached {
                return None;
            }

            let plan = match link.io.initialize() {
                Ok(plan) => plan,
                Err(e) => {
                    warn!("transport initialize failed for {}: {e}", link.peer);
                    return None;
                }
            };
            debug_assert!(
                plan.action == IoAction::None || plan.next_action == IoAction::None,
                "immediate and pending initial actions are exclusive"
            );

            let connecting =
                plan.action != IoAction::None || plan.next_action != IoAction::None;
            link.want_read = plan.wanna_read || !connecting;
            link.want_write = plan.wanna_write;
            (plan, connecting)
        };

        let link: Rc<std::cell::RefCell<dyn LinkageBase>> = this.clone();
        let id = match reactor.attach(link) {
            Ok(id) => id,
            Err(e) => {
                warn!("failed to attach {}: {e}", this.borrow().peer);
                return None;
            }
        };

        let ret = {
            let mut link = this.borrow_mut();
            link.attached = true;

            if !connecting {
                if link.do_connected() { 1 } else { -1 }
            } else {
                link.update_connect_jam(true);
                if plan.action != IoAction::None {
                    // Invoke right away; e.g. a client handshake.
                    link.action = plan.action;
                    link.on_event(plan.action)
                } else {
                    // Wait for readiness, then run the pending action.
                    link.action = plan.next_action;
                    1
                }
            }
        };

        if ret <= 0 {
            this.borrow_mut().attached = false;
            reactor.detach(id);
            return None;
        }

        reactor.sync_interest(id);
        Some(id)
    }

    /// Queue or write `buf` to the peer. Never blocks.
    ///
    /// Returns `false` once `disconnect` was called, when the 64 MiB send
    /// bound would be crossed, or on a dead transport.
    pub fn send(&mut self, buf: &[u8]) -> bool {
        if buf.len() > i32::MAX as usize || !self.attached || self.graceful {
            return false;
        }
        if buf.is_empty() {
            return true;
        }

        trace!("sending {} bytes to {}", buf.len(), self.peer);
        if self.action != IoAction::None || !self.wbuf.is_empty() {
            return self.append_sending_buffer(buf);
        }

        // Idle connection: write through and queue only the remainder.
        let outcome = self.io.write(buf);
        match outcome.status {
            IoStatus::Jammed => {
                if !self.append_sending_buffer(buf) {
                    return false;
                }
                self.want_write = true;
                self.update_last_sent(false, true);
            }
            IoStatus::WannaRead => {
                if !self.append_sending_buffer(buf) {
                    return false;
                }
                self.action = IoAction::Write;
                self.want_read = true;
                self.want_write = false;
                self.update_last_sent(false, true);
                self.last_writing = buf.len();
            }
            IoStatus::WannaWrite => {
                if !self.append_sending_buffer(buf) {
                    return false;
                }
                self.action = IoAction::Write;
                self.want_write = true;
                self.update_last_sent(false, true);
                self.last_writing = buf.len();
            }
            IoStatus::Ok => {
                if outcome.len < buf.len() {
                    if !self.append_sending_buffer(&buf[outcome.len..]) {
                        return false;
                    }
                    self.want_write = true;
                    self.update_last_sent(true, true);
                } else {
                    self.update_last_sent(true, false);
                }
                if self.io.pending_write() {
                    self.want_write = true;
                }
            }
            IoStatus::Closed | IoStatus::Error | IoStatus::Bug => return false,
        }

        true
    }

    /// Begin closing. With `finish_write` the queued bytes drain first;
    /// without it they are dropped on the floor.
    pub fn disconnect(&mut self, finish_write: bool) -> i32 {
        self.graceful = true;
        if !finish_write {
            self.wbuf.clear();
        }

        if self.action != IoAction::None {
            return 1;
        }
        if finish_write && (!self.wbuf.is_empty() || self.io.pending_write()) {
            // Drain on writable events, then shut down.
            self.want_write = true;
            return 1;
        }

        self.on_event(IoAction::Shutdown)
    }

    // -- event loop glue -----------------------------------------------------

    fn on_event(&mut self, idle_action: IoAction) -> i32 {
        debug_assert!(idle_action != IoAction::None);

        let mut action = if self.action == IoAction::None {
            idle_action
        } else {
            self.action
        };

        let mut ret;
        loop {
            let (r, next) = self.on_event_once(action);
            ret = r;
            if next == IoAction::None {
                break;
            }
            trace!("continuing as {}", next.as_str());
            action = next;
        }

        if self.action == IoAction::None {
            self.want_read = true;
            self.want_write = !self.wbuf.is_empty() || self.io.pending_write();
        }

        ret
    }

    /// One transport step. Returns the verdict plus a follow-up action to
    /// run immediately.
    fn on_event_once(&mut self, action: IoAction) -> (i32, IoAction) {
        let status;
        match action {
            IoAction::Read => {
                let mut scratch = std::mem::take(&mut self.scratch);
                let outcome = self.io.read(&mut scratch);
                let result = if outcome.status == IoStatus::Ok {
                    self.action = IoAction::None;
                    let ret = self.on_received(&scratch[..outcome.len]);
                    if ret == 0 {
                        // Handler asked for a graceful close: half-close the
                        // reader and drain what is queued.
                        self.graceful = true;
                        if self.wbuf.is_empty() && !self.io.pending_write() {
                            Some((1, IoAction::Shutdown))
                        } else {
                            self.want_write = true;
                            Some((1, IoAction::None))
                        }
                    } else if ret > 0 {
                        if outcome.more {
                            Some((1, IoAction::Read))
                        } else {
                            Some((1, IoAction::None))
                        }
                    } else {
                        // Framing/handler failure, not transport.
                        Some((-1, IoAction::None))
                    }
                } else {
                    None
                };
                self.scratch = scratch;

                match result {
                    Some(done) => return done,
                    None => status = outcome.status,
                }
            }

            IoAction::Write => {
                let len = if self.last_writing > 0 {
                    let n = self.last_writing.min(self.wbuf.len());
                    self.last_writing = 0;
                    n
                } else {
                    self.wbuf.len()
                };

                if len > 0 {
                    let outcome = self.io.write(&self.wbuf[..len]);
                    if outcome.status == IoStatus::Ok {
                        self.action = IoAction::None;
                        let jammed = outcome.len < len;
                        self.update_last_sent(true, jammed);
                        self.wbuf.drain(..outcome.len);
                        trace!(
                            "dequeued {len} bytes, sent {} bytes to {}",
                            outcome.len,
                            self.peer
                        );
                        return (1, IoAction::None);
                    }

                    self.update_last_sent(false, true);
                    if outcome.status.is_incomplete() {
                        self.last_writing = len;
                    }
                    status = outcome.status;
                } else if self.io.pending_write() {
                    // Transport-internal bytes (TLS records) still flushing.
                    let st = self.io.flush();
                    if st == IoStatus::Ok {
                        self.action = IoAction::None;
                        if self.graceful {
                            return (1, IoAction::Shutdown);
                        }
                        return (1, IoAction::None);
                    }
                    status = st;
                } else if self.graceful {
                    self.action = IoAction::None;
                    return (1, IoAction::Shutdown);
                } else {
                    self.action = IoAction::None;
                    return (1, IoAction::None);
                }
            }

            IoAction::Accept => {
                let st = self.io.accept();
                if st == IoStatus::Ok {
                    self.action = IoAction::None;
                    return (if self.do_connected() { 1 } else { -1 }, IoAction::None);
                }
                status = st;
            }

            IoAction::Connect => {
                let st = self.io.connect();
                if st == IoStatus::Ok {
                    self.action = IoAction::None;
                    return (if self.do_connected() { 1 } else { -1 }, IoAction::None);
                }
                status = st;
            }

            IoAction::Shutdown => {
                let (ret, st) = self.do_shutdown();
                if ret <= 0 {
                    // May be invoked off the event path; keep reading armed.
                    self.action = IoAction::None;
                    self.want_read = true;
                    return (ret, IoAction::None);
                }
                status = st;
            }

            IoAction::None => unreachable!("events never dispatch an idle action"),
        }

        self.action = if status.is_incomplete() { action } else { IoAction::None };
        (self.after_event(status), IoAction::None)
    }

    /// Map a transport status to a callback verdict, adjusting interest for
    /// incomplete operations.
    fn after_event(&mut self, status: IoStatus) -> i32 {
        match status {
            IoStatus::WannaRead => {
                self.want_read = true;
                self.want_write = false;
                1
            }
            IoStatus::WannaWrite => {
                self.want_read = false;
                self.want_write = true;
                1
            }
            // Transient; interest stays as it was.
            IoStatus::Jammed => 1,
            IoStatus::Closed => 0,
            IoStatus::Ok => 1,
            IoStatus::Error | IoStatus::Bug => -1,
        }
    }

    fn do_connected(&mut self) -> bool {
        self.want_read = true;
        self.want_write = !self.wbuf.is_empty() || self.io.pending_write();
        self.action = IoAction::None;
        self.update_connect_jam(false);
        self.update_last_received();
        let handler = Rc::clone(&self.handler);
        handler.on_connected(self)
    }

    fn do_shutdown(&mut self) -> (i32, IoStatus) {
        self.graceful = true;
        if self.closed {
            return (0, IoStatus::Ok);
        }

        self.update_connect_jam(true);
        let status = self.io.shutdown();
        match status {
            IoStatus::Ok | IoStatus::Closed => {
                self.closed = true;
                (0, status)
            }
            IoStatus::WannaRead | IoStatus::WannaWrite => (1, status),
            _ => (-1, status),
        }
    }

    // -- receive path --------------------------------------------------------

    /// Feed freshly read bytes through the framing walk, buffering
    /// leftovers with as little copying as the cases allow.
    fn on_received(&mut self, buf: &[u8]) -> i32 {
        if buf.is_empty() {
            return 1;
        }

        self.update_last_received();
        if self.graceful {
            // Reader is draining toward shutdown; bytes are discarded.
            return 1;
        }

        trace!("received {} bytes from {}", buf.len(), self.peer);

        if self.rbuf.is_empty() {
            // Fast path: parse in place, keep only the tail.
            let (ret, consumed) = self.do_received(buf);
            if ret <= 0 {
                return ret;
            }
            if consumed != buf.len() {
                self.rbuf.extend_from_slice(&buf[consumed..]);
            }
        } else if self.rlength > 0 && self.rlength <= self.rbuf.len() + buf.len() {
            // The pending frame completes: move only the missing piece.
            let last = self.rbuf.len();
            debug_assert!(self.rlength > last);
            let need = self.rlength - last;

            let mut rb = std::mem::take(&mut self.rbuf);
            rb.extend_from_slice(&buf[..need]);
            debug_assert_eq!(rb.len(), self.rlength);

            let (ret, consumed) = self.do_received(&rb);
            if ret <= 0 {
                return ret;
            }
            debug_assert_eq!(consumed, rb.len());

            // Everything extracted; continue with the remainder in place.
            let rest = &buf[need..];
            if !rest.is_empty() {
                let (ret, consumed) = self.do_received(rest);
                if ret <= 0 {
                    return ret;
                }
                if consumed != rest.len() {
                    self.rbuf.extend_from_slice(&rest[consumed..]);
                }
            }
        } else {
            // Worst case: append, then parse the accumulation.
            let mut rb = std::mem::take(&mut self.rbuf);
            rb.extend_from_slice(buf);
            let (ret, consumed) = self.do_received(&rb);
            if ret <= 0 {
                self.rbuf = rb;
                return ret;
            }
            if consumed > 0 {
                rb.drain(..consumed);
            }
            self.rbuf = rb;
        }

        1
    }

    /// Walk complete frames out of `buf`, calling the handler for each.
    fn do_received(&mut self, buf: &[u8]) -> (i32, usize) {
        let handler = Rc::clone(&self.handler);
        let mut consumed = 0;

        while consumed < buf.len() {
            let remaining = &buf[consumed..];

            if self.rlength == 0 {
                let ret = handler.get_message_length(self, remaining);
                if ret < 0 {
                    debug!("invalid message header from {}", self.peer);
                    self.handler_errno = Some(libc::EBADMSG);
                    return (-1, consumed);
                }
                if ret == 0 {
                    self.update_receive_jam(true);
                    break;
                }
                self.rlength = ret as usize;
                trace!("frame length {} from {}", self.rlength, self.peer);
            }

            if remaining.len() < self.rlength {
                self.update_receive_jam(true);
                break;
            }

            self.update_receive_jam(false);
            let flen = self.rlength;
            let next = handler.on_message(self, &remaining[..flen]);
            if next < 0 {
                debug!("handler rejected a {flen} byte frame from {}", self.peer);
                self.handler_errno = Some(libc::EBADMSG);
                return (-1, consumed);
            }
            if next == 0 {
                return (0, consumed);
            }

            consumed += flen;
            self.rlength = 0;
        }

        (1, consumed)
    }

    // -- send buffer ---------------------------------------------------------

    fn append_sending_buffer(&mut self, buf: &[u8]) -> bool {
        let left = MAX_SENDING_BUFFER - self.wbuf.len();
        if left < buf.len() {
            debug!("only {left} sending bytes left for {}", self.peer);
            return false;
        }
        self.wbuf.extend_from_slice(buf);
        trace!("queued {} bytes for {}", buf.len(), self.peer);
        true
    }

    #[cfg(test)]
    fn sending_buffer_size(&self) -> usize {
        self.wbuf.len()
    }

    // -- jam bookkeeping -----------------------------------------------------

    fn update_last_received(&mut self) {
        self.last_received = Instant::now();
    }

    fn update_receive_jam(&mut self, jammed: bool) {
        if jammed {
            if self.receive_jam.is_none() {
                self.receive_jam = Some(Instant::now());
            }
        } else {
            self.receive_jam = None;
        }
    }

    fn update_connect_jam(&mut self, jammed: bool) {
        if jammed {
            if self.connect_jam.is_none() {
                self.connect_jam = Some(Instant::now());
            }
        } else {
            self.connect_jam = None;
        }
    }

    fn update_last_sent(&mut self, sent: bool, jammed: bool) {
        let now = Instant::now();
        if sent {
            self.last_sent = now;
        }

        if jammed {
            if self.send_jam.is_none() {
                self.send_jam = Some(now);
            }
        } else {
            self.send_jam = None;
        }
    }
}

fn jam_expired(jam: Option<Instant>, timeout: Duration, now: Instant) -> bool {
    match jam {
        Some(since) if !timeout.is_zero() => now.saturating_duration_since(since) >= timeout,
        _ => false,
    }
}

impl LinkageBase for Linkage {
    fn source_mut(&mut self) -> &mut dyn Source {
        self.io.source_mut()
    }

    fn on_readable(&mut self, _reactor: &mut Reactor) -> i32 {
        self.on_event(IoAction::Read)
    }

    fn on_writable(&mut self, _reactor: &mut Reactor) -> i32 {
        self.on_event(IoAction::Write)
    }

    fn on_error(&mut self, reading: bool, errnum: i32) {
        let errnum = self.handler_errno.take().unwrap_or(errnum);
        let handler = Rc::clone(&self.handler);
        handler.on_error(self, reading, errnum);
    }

    fn on_disconnected(&mut self) {
        self.attached = false;
        let handler = Rc::clone(&self.handler);
        handler.on_disconnected(self);
    }

    fn cleanup(&mut self, now: Instant) -> bool {
        if jam_expired(self.connect_jam, self.connect_timeout, now) {
            debug!("connect timed out for {}", self.peer);
            return false;
        }
        if jam_expired(self.send_jam, self.send_timeout, now) {
            debug!("send timed out for {}", self.peer);
            return false;
        }
        if jam_expired(self.receive_jam, self.receive_timeout, now) {
            debug!("receive timed out for {}", self.peer);
            return false;
        }

        // Idle counts from the latest activity in either direction.
        let idle = now
            .saturating_duration_since(self.last_sent)
            .min(now.saturating_duration_since(self.last_received));
        if !self.idle_timeout.is_zero() && idle >= self.idle_timeout {
            debug!("connection idled out for {}", self.peer);
            return false;
        }

        let handler = Rc::clone(&self.handler);
        handler.cleanup(self, now)
    }

    fn wanted(&self) -> (bool, bool) {
        (self.want_read, self.want_write)
    }

    fn set_wanted(&mut self, read: bool, write: bool) {
        self.want_read = read;
        self.want_write = write;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
