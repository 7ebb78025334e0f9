//! Accepting sockets.
//!
//! A listener is a reactor client whose readable events are accept bursts.
//! Each accepted stream gets the configured socket options and is handed to
//! an [`AcceptSink`] that builds and attaches the linkage on the same
//! reactor that accepted it.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use log::{trace, warn};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};

use crate::interface::{self, SocketOptions};
use crate::reactor::{ClientId, LinkageBase, Reactor};

/// Builds a connection out of an accepted stream.
///
/// Returning `false` drops the stream (admission refused, resources
/// exhausted, or the transport rejected it).
pub trait AcceptSink {
    fn on_accepted(
        &self,
        reactor: &mut Reactor,
        stream: TcpStream,
        peer: SocketAddr,
        me: SocketAddr,
    ) -> bool;
}

pub struct Listener {
    listener: TcpListener,
    accepted_options: SocketOptions,
    sink: Box<dyn AcceptSink>,
    want_read: bool,
}

impl Listener {
    /// Wrap an already-bound std listener (non-blocking) for a reactor.
    pub fn from_std(
        listener: std::net::TcpListener,
        accepted_options: SocketOptions,
        sink: Box<dyn AcceptSink>,
    ) -> io::Result<Listener> {
        listener.set_nonblocking(true)?;
        Ok(Listener {
            listener: TcpListener::from_std(listener),
            accepted_options,
            sink,
            want_read: true,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Attach to the reactor whose thread will own every accepted
    /// connection.
    pub fn attach(this: &Rc<RefCell<Listener>>, reactor: &mut Reactor) -> io::Result<ClientId> {
        let link: Rc<RefCell<dyn LinkageBase>> = this.clone();
        reactor.attach(link)
    }

    /// Stop accepting; existing connections are untouched.
    pub fn disconnect(&mut self) {
        self.want_read = false;
    }
}

impl LinkageBase for Listener {
    fn source_mut(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    fn on_readable(&mut self, reactor: &mut Reactor) -> i32 {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = interface::setup_accepted(&stream, &self.accepted_options) {
                        warn!("failed to set up accepted fd from {peer}: {e}");
                        continue;
                    }

                    let me = match stream.local_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            warn!("failed to read local address for {peer}: {e}");
                            continue;
                        }
                    };

                    trace!("accepted {peer}");
                    if !self.sink.on_accepted(reactor, stream, peer, me) {
                        warn!("failed to create client from {peer}");
                    }
                }

                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return 1,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,

                Err(e) => {
                    // Once the fd table is exhausted the process can only
                    // spin: it cannot accept-and-close to shed load.
                    // Crashing beats spinning.
                    let raw = e.raw_os_error();
                    if raw == Some(libc::EMFILE) || raw == Some(libc::ENFILE) {
                        panic!("listener out of file descriptors: {e}");
                    }
                    if raw == Some(libc::ENOMEM) {
                        panic!("listener out of memory: {e}");
                    }
                    panic!("failed to accept: {e}");
                }
            }
        }
    }

    fn on_writable(&mut self, _reactor: &mut Reactor) -> i32 {
        -1
    }

    fn on_error(&mut self, _reading: bool, _errnum: i32) {}

    fn on_disconnected(&mut self) {}

    fn cleanup(&mut self, _now: Instant) -> bool {
        true
    }

    fn wanted(&self) -> (bool, bool) {
        (self.want_read, false)
    }

    fn set_wanted(&mut self, read: bool, _write: bool) {
        self.want_read = read;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
