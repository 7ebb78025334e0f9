//! Polymorphic transports for linkages.
//!
//! A [`Transport`] is the capability set a linkage drives: initialize, read,
//! write, connect, accept, shutdown. Every operation reports an [`IoStatus`]
//! so the connection state machine can translate partial progress into
//! reactor interest instead of blocking:
//!
//! - [`PlainIo`] wraps a non-blocking TCP stream directly.
//! - [`TlsIo`] runs a rustls client or server connection over the same
//!   stream, surfacing the handshake's want-read/want-write as statuses and
//!   exposing peer metadata once the handshake completes.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;

use log::{debug, trace};
use mio::event::Source;
use mio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::{CipherSuite, ClientConnection, ProtocolVersion, ServerConnection};

// ---------------------------------------------------------------------------
// Status and action sets
// ---------------------------------------------------------------------------

/// Outcome of a transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Operation completed.
    Ok,
    /// Caller misuse (operating on a dead transport).
    Bug,
    /// Unrecoverable transport error.
    Error,
    /// The operation would block; retry when the reactor signals readiness.
    Jammed,
    /// Peer closed the stream.
    Closed,
    /// Operation incomplete, call again once readable.
    WannaRead,
    /// Operation incomplete, call again once writable.
    WannaWrite,
}

impl IoStatus {
    /// Incomplete statuses keep the in-progress action armed.
    pub fn is_incomplete(self) -> bool {
        matches!(self, IoStatus::WannaRead | IoStatus::WannaWrite)
    }
}

/// The transport step a linkage is currently driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoAction {
    None,
    Read,
    Write,
    Accept,
    Connect,
    Shutdown,
}

impl IoAction {
    pub fn as_str(self) -> &'static str {
        match self {
            IoAction::None => "idle",
            IoAction::Read => "reading",
            IoAction::Write => "writing",
            IoAction::Accept => "accepting",
            IoAction::Connect => "connecting",
            IoAction::Shutdown => "closing",
        }
    }
}

/// What a freshly attached transport wants from the reactor.
///
/// At most one of `action` (run immediately) and `next_action` (run when the
/// requested readiness arrives) is set.
#[derive(Debug, Clone, Copy)]
pub struct InitPlan {
    pub action: IoAction,
    pub next_action: IoAction,
    pub wanna_read: bool,
    pub wanna_write: bool,
}

impl InitPlan {
    fn idle() -> Self {
        InitPlan {
            action: IoAction::None,
            next_action: IoAction::None,
            wanna_read: false,
            wanna_write: false,
        }
    }
}

/// Result of [`Transport::read`].
#[derive(Debug, Clone, Copy)]
pub struct ReadOutcome {
    pub status: IoStatus,
    pub len: usize,
    /// The transport buffers plaintext internally and more is available even
    /// though the socket may not signal readable again.
    pub more: bool,
}

impl ReadOutcome {
    fn status(status: IoStatus) -> Self {
        ReadOutcome { status, len: 0, more: false }
    }
}

/// Result of [`Transport::write`].
#[derive(Debug, Clone, Copy)]
pub struct WriteOutcome {
    pub status: IoStatus,
    pub len: usize,
}

impl WriteOutcome {
    fn status(status: IoStatus) -> Self {
        WriteOutcome { status, len: 0 }
    }
}

// ---------------------------------------------------------------------------
// TLS peer metadata
// ---------------------------------------------------------------------------

/// Negotiated session facts, available once a TLS handshake completes.
#[derive(Debug, Clone, Default)]
pub struct TlsPeer {
    pub protocol: Option<ProtocolVersion>,
    pub cipher_suite: Option<CipherSuite>,
    /// SNI presented by the client (server side only).
    pub server_name: Option<String>,
    /// DER encoding of the peer's end-entity certificate, when presented.
    pub peer_cert_der: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub trait Transport {
    /// Report the initial action plan for a freshly attached transport.
    fn initialize(&mut self) -> io::Result<InitPlan>;

    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome;
    fn write(&mut self, buf: &[u8]) -> WriteOutcome;
    fn shutdown(&mut self) -> IoStatus;
    fn connect(&mut self) -> IoStatus;
    fn accept(&mut self) -> IoStatus;

    /// Push internally buffered bytes toward the socket.
    fn flush(&mut self) -> IoStatus {
        IoStatus::Ok
    }

    /// Whether the transport holds bytes it still has to write; keeps the
    /// linkage interested in writable events after its own queue drains.
    fn pending_write(&self) -> bool {
        false
    }

    /// The mio source to register with the reactor.
    fn source_mut(&mut self) -> &mut dyn Source;

    fn tls_peer(&self) -> Option<&TlsPeer> {
        None
    }
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

/// Whether a non-blocking connect has completed on `stream`.
fn probe_connected(stream: &TcpStream) -> IoStatus {
    match stream.take_error() {
        Ok(Some(e)) => {
            debug!("connect failed: {e}");
            return IoStatus::Error;
        }
        Ok(None) => {}
        Err(_) => return IoStatus::Error,
    }

    match stream.peer_addr() {
        Ok(_) => IoStatus::Ok,
        Err(e) if e.kind() == io::ErrorKind::NotConnected => IoStatus::WannaWrite,
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => IoStatus::WannaWrite,
        Err(_) => IoStatus::Error,
    }
}

// ---------------------------------------------------------------------------
// PlainIo
// ---------------------------------------------------------------------------

/// Non-blocking TCP transport.
pub struct PlainIo {
    stream: TcpStream,
    connecting: bool,
}

impl PlainIo {
    /// A stream that is already established (accepted, or connected).
    pub fn established(stream: TcpStream) -> Self {
        PlainIo { stream, connecting: false }
    }

    /// A stream with a connect in progress.
    pub fn connecting(stream: TcpStream) -> Self {
        PlainIo { stream, connecting: true }
    }
}

impl Transport for PlainIo {
    fn initialize(&mut self) -> io::Result<InitPlan> {
        let mut plan = InitPlan::idle();
        if self.connecting {
            plan.next_action = IoAction::Connect;
            plan.wanna_write = true;
        }
        Ok(plan)
    }

    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        loop {
            return match self.stream.read(buf) {
                Ok(0) => ReadOutcome::status(IoStatus::Closed),
                Ok(n) => ReadOutcome { status: IoStatus::Ok, len: n, more: false },
                Err(ref e) if would_block(e) => ReadOutcome::status(IoStatus::Jammed),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => ReadOutcome::status(IoStatus::Error),
            };
        }
    }

    fn write(&mut self, buf: &[u8]) -> WriteOutcome {
        loop {
            return match self.stream.write(buf) {
                Ok(n) => WriteOutcome { status: IoStatus::Ok, len: n },
                Err(ref e) if would_block(e) => WriteOutcome::status(IoStatus::Jammed),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    WriteOutcome::status(IoStatus::Closed)
                }
                Err(_) => WriteOutcome::status(IoStatus::Error),
            };
        }
    }

    fn shutdown(&mut self) -> IoStatus {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => IoStatus::Closed,
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => IoStatus::Closed,
            Err(_) => IoStatus::Error,
        }
    }

    fn connect(&mut self) -> IoStatus {
        let status = probe_connected(&self.stream);
        if status == IoStatus::Ok {
            self.connecting = false;
        }
        status
    }

    fn accept(&mut self) -> IoStatus {
        IoStatus::Ok
    }

    fn source_mut(&mut self) -> &mut dyn Source {
        &mut self.stream
    }
}

// ---------------------------------------------------------------------------
// TlsIo
// ---------------------------------------------------------------------------

enum TlsState {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl TlsState {
    fn common(&self) -> &rustls::CommonState {
        match self {
            TlsState::Client(c) => c,
            TlsState::Server(s) => s,
        }
    }

    fn common_mut(&mut self) -> &mut rustls::CommonState {
        match self {
            TlsState::Client(c) => c,
            TlsState::Server(s) => s,
        }
    }

    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            TlsState::Client(c) => c.read_tls(rd),
            TlsState::Server(s) => s.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            TlsState::Client(c) => c.write_tls(wr),
            TlsState::Server(s) => s.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsState::Client(c) => c.process_new_packets(),
            TlsState::Server(s) => s.process_new_packets(),
        }
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            TlsState::Client(c) => c.reader().read(buf),
            TlsState::Server(s) => s.reader().read(buf),
        }
    }

    fn write_plaintext(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TlsState::Client(c) => c.writer().write(buf),
            TlsState::Server(s) => s.writer().write(buf),
        }
    }
}

/// TLS transport over a non-blocking TCP stream.
///
/// The handshake is driven from `accept` (server) or `connect` (client) and
/// maps rustls's want-read/want-write into [`IoStatus`]. Reads report
/// `more = true` while decrypted plaintext remains buffered, because the
/// socket will not signal readable for bytes already pulled off it.
pub struct TlsIo {
    stream: TcpStream,
    tls: TlsState,
    connecting: bool,
    peer: Option<TlsPeer>,
    close_notify_sent: bool,
    /// Plaintext known to be buffered inside rustls.
    plain_buffered: usize,
}

impl TlsIo {
    /// Server-side TLS on an accepted stream.
    pub fn server(stream: TcpStream, config: Arc<rustls::ServerConfig>) -> io::Result<Self> {
        let conn = ServerConnection::new(config).map_err(io::Error::other)?;
        Ok(TlsIo {
            stream,
            tls: TlsState::Server(conn),
            connecting: false,
            peer: None,
            close_notify_sent: false,
            plain_buffered: 0,
        })
    }

    /// Client-side TLS; `connecting` marks a TCP connect still in progress.
    pub fn client(
        stream: TcpStream,
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
        connecting: bool,
    ) -> io::Result<Self> {
        let conn = ClientConnection::new(config, server_name).map_err(io::Error::other)?;
        Ok(TlsIo {
            stream,
            tls: TlsState::Client(conn),
            connecting,
            peer: None,
            close_notify_sent: false,
            plain_buffered: 0,
        })
    }

    fn capture_peer(&mut self) {
        if self.peer.is_some() {
            return;
        }

        let server_name = match &self.tls {
            TlsState::Server(s) => s.server_name().map(str::to_owned),
            TlsState::Client(_) => None,
        };

        let common = self.tls.common();
        self.peer = Some(TlsPeer {
            protocol: common.protocol_version(),
            cipher_suite: common.negotiated_cipher_suite().map(|s| s.suite()),
            server_name,
            peer_cert_der: common
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|c| c.as_ref().to_vec()),
        });
    }

    /// Drive the handshake until it completes or wants I/O.
    fn handshake(&mut self) -> IoStatus {
        loop {
            if self.tls.common().wants_write() {
                match self.tls.write_tls(&mut self.stream) {
                    Ok(_) => continue,
                    Err(ref e) if would_block(e) => return IoStatus::WannaWrite,
                    Err(ref e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        return IoStatus::Closed;
                    }
                    Err(_) => return IoStatus::Error,
                }
            }

            if !self.tls.common().is_handshaking() {
                self.capture_peer();
                trace!("tls handshake complete");
                return IoStatus::Ok;
            }

            match self.tls.read_tls(&mut self.stream) {
                Ok(0) => return IoStatus::Closed,
                Ok(_) => match self.tls.process_new_packets() {
                    Ok(state) => self.plain_buffered = state.plaintext_bytes_to_read(),
                    Err(e) => {
                        debug!("tls handshake rejected: {e}");
                        return IoStatus::Error;
                    }
                },
                Err(ref e) if would_block(e) => return IoStatus::WannaRead,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return IoStatus::Error,
            }
        }
    }

    /// Best-effort push of pending ciphertext; errors surface on the next
    /// deliberate operation.
    fn opportunistic_flush(&mut self) {
        while self.tls.common().wants_write() {
            match self.tls.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }
}

impl Transport for TlsIo {
    fn initialize(&mut self) -> io::Result<InitPlan> {
        let mut plan = InitPlan::idle();
        match &self.tls {
            TlsState::Server(_) => {
                // Handshake starts when the client hello arrives.
                plan.next_action = IoAction::Accept;
                plan.wanna_read = true;
            }
            TlsState::Client(_) => {
                if self.connecting {
                    plan.next_action = IoAction::Connect;
                    plan.wanna_write = true;
                } else {
                    // Socket is up, start the handshake right away.
                    plan.action = IoAction::Connect;
                }
            }
        }
        Ok(plan)
    }

    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        self.opportunistic_flush();

        if self.plain_buffered == 0 {
            match self.tls.read_tls(&mut self.stream) {
                Ok(0) => {
                    // Transport EOF; deliver what rustls already decrypted.
                    match self.tls.process_new_packets() {
                        Ok(state) if state.plaintext_bytes_to_read() > 0 => {
                            self.plain_buffered = state.plaintext_bytes_to_read();
                        }
                        _ => return ReadOutcome::status(IoStatus::Closed),
                    }
                }
                Ok(_) => match self.tls.process_new_packets() {
                    Ok(state) => self.plain_buffered = state.plaintext_bytes_to_read(),
                    Err(e) => {
                        debug!("tls record rejected: {e}");
                        return ReadOutcome::status(IoStatus::Error);
                    }
                },
                Err(ref e) if would_block(e) => {
                    if self.plain_buffered == 0 {
                        return ReadOutcome::status(IoStatus::Jammed);
                    }
                }
                Err(_) => return ReadOutcome::status(IoStatus::Error),
            }
        }

        match self.tls.read_plaintext(buf) {
            Ok(0) => ReadOutcome::status(IoStatus::Closed),
            Ok(n) => {
                self.plain_buffered = self.plain_buffered.saturating_sub(n);
                ReadOutcome { status: IoStatus::Ok, len: n, more: self.plain_buffered > 0 }
            }
            Err(ref e) if would_block(e) => ReadOutcome::status(IoStatus::Jammed),
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                ReadOutcome::status(IoStatus::Closed)
            }
            Err(_) => ReadOutcome::status(IoStatus::Error),
        }
    }

    fn write(&mut self, buf: &[u8]) -> WriteOutcome {
        // Earlier ciphertext first; nothing new is accepted until the socket
        // takes it.
        while self.tls.common().wants_write() {
            match self.tls.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(ref e) if would_block(e) => return WriteOutcome::status(IoStatus::WannaWrite),
                Err(ref e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    return WriteOutcome::status(IoStatus::Closed);
                }
                Err(_) => return WriteOutcome::status(IoStatus::Error),
            }
        }

        let n = match self.tls.write_plaintext(buf) {
            Ok(n) => n,
            Err(_) => return WriteOutcome::status(IoStatus::Error),
        };

        while self.tls.common().wants_write() {
            match self.tls.write_tls(&mut self.stream) {
                Ok(_) => {}
                // Partially flushed; the rest goes out on the next writable.
                Err(ref e) if would_block(e) => break,
                Err(ref e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    return WriteOutcome::status(IoStatus::Closed);
                }
                Err(_) => return WriteOutcome::status(IoStatus::Error),
            }
        }

        WriteOutcome { status: IoStatus::Ok, len: n }
    }

    fn shutdown(&mut self) -> IoStatus {
        if !self.close_notify_sent {
            self.tls.common_mut().send_close_notify();
            self.close_notify_sent = true;
        }

        while self.tls.common().wants_write() {
            match self.tls.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(ref e) if would_block(e) => return IoStatus::WannaWrite,
                Err(_) => break,
            }
        }

        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => IoStatus::Closed,
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => IoStatus::Closed,
            Err(_) => IoStatus::Error,
        }
    }

    fn connect(&mut self) -> IoStatus {
        if self.connecting {
            match probe_connected(&self.stream) {
                IoStatus::Ok => self.connecting = false,
                other => return other,
            }
        }
        self.handshake()
    }

    fn accept(&mut self) -> IoStatus {
        self.handshake()
    }

    fn flush(&mut self) -> IoStatus {
        while self.tls.common().wants_write() {
            match self.tls.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(ref e) if would_block(e) => return IoStatus::WannaWrite,
                Err(ref e) if e.kind() == io::ErrorKind::BrokenPipe => return IoStatus::Closed,
                Err(_) => return IoStatus::Error,
            }
        }
        IoStatus::Ok
    }

    fn pending_write(&self) -> bool {
        self.tls.common().wants_write()
    }

    fn source_mut(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn tls_peer(&self) -> Option<&TlsPeer> {
        self.peer.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
