//! Application-facing callback contracts.
//!
//! A [`Handler`] frames and processes messages for one route (a listen port
//! or an outgoing destination). One shared handler can serve every
//! connection on the route, or a [`HandlerFactory`] can mint a fresh
//! handler per connection. Either way the handler sees a [`Context`]
//! identifying the connection, usable from any thread to reply or hang up.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use log::{debug, warn};

use crate::channel::Channel;
use crate::io::TlsPeer;
use crate::server::ServerHandle;

/// Per-route message callbacks.
///
/// `get_message_length` and `on_message` carry the protocol; everything
/// else has workable defaults. With a worker pool configured `on_message`
/// runs on worker threads, so handlers are `Send + Sync`.
pub trait Handler: Send + Sync {
    /// Report the full frame length from its leading bytes.
    ///
    /// `>0`: total frame length, header included, even if the rest has not
    /// arrived. `0`: not enough bytes to tell. `<0`: invalid stream.
    fn get_message_length(&self, context: &Context, buf: &[u8]) -> isize;

    /// A complete frame, in arrival order.
    ///
    /// `>0` keep the connection, `0` hang up gracefully, `<0` hang up
    /// immediately.
    fn on_message(&self, context: &Context, buf: &[u8]) -> i32;

    /// Pin related frames to one worker: non-negative values map to a
    /// worker slot by modulus, `-1` lets any worker take it.
    fn hash_message(&self, _context: &Context, _buf: &[u8]) -> i32 {
        -1
    }

    /// Connection established (and TLS handshake done, if any).
    /// `false` refuses the connection.
    fn on_connected(&self, _context: &Context) -> bool {
        true
    }

    fn on_disconnected(&self, context: &Context) {
        debug!("disconnected: {} on {}", context.peer(), context.channel());
    }

    fn on_error(&self, context: &Context, reading: bool, errnum: i32) {
        warn!(
            "{} error on {}: errno {errnum}",
            if reading { "read" } else { "write" },
            context.channel()
        );
    }

    /// Health-check verdict, once per second. `false` tears the
    /// connection down.
    fn cleanup(&self, _context: &Context, _now: Instant) -> bool {
        true
    }
}

/// Mints one handler per connection.
pub trait HandlerFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Handler>;
}

/// A route serves connections through one shared handler or a per-
/// connection factory.
#[derive(Clone)]
pub enum HandlerChoice {
    Shared(Arc<dyn Handler>),
    Factory(Arc<dyn HandlerFactory>),
}

impl HandlerChoice {
    /// The handler instance for a new connection.
    pub fn instantiate(&self) -> Arc<dyn Handler> {
        match self {
            HandlerChoice::Shared(h) => Arc::clone(h),
            HandlerChoice::Factory(f) => f.create(),
        }
    }
}

/// Thread lifecycle hooks for embedders that need per-thread setup
/// (allocator arenas, logging scopes, library init).
pub trait Tuner: Send + Sync {
    /// Runs on each I/O thread before its loop; `false` aborts the thread.
    fn on_io_thread_initialize(&self) -> bool {
        true
    }

    fn on_io_thread_shutdown(&self) {}

    /// Runs on each job thread before it takes work; `false` aborts it.
    fn on_job_thread_initialize(&self) -> bool {
        true
    }

    fn on_job_thread_shutdown(&self) {}
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Identity of one connection, shared with every callback and job that
/// touches it.
///
/// The context outlives the connection object itself (jobs may still hold
/// it after a disconnect); operations on a gone connection are dropped
/// silently, or trigger a reconnect for outgoing channels.
pub struct Context {
    server: ServerHandle,
    handler: Arc<dyn Handler>,
    channel: Channel,
    peer: SocketAddr,
    me: SocketAddr,
    slot: usize,
    tls: OnceLock<TlsPeer>,
}

impl Context {
    pub(crate) fn new(
        server: ServerHandle,
        handler: Arc<dyn Handler>,
        channel: Channel,
        peer: SocketAddr,
        me: SocketAddr,
        slot: usize,
    ) -> Context {
        Context { server, handler, channel, peer, me, slot, tls: OnceLock::new() }
    }

    pub fn server(&self) -> &ServerHandle {
        &self.server
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn me(&self) -> SocketAddr {
        self.me
    }

    /// The reactor slot owning this connection.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// TLS session facts, once the handshake completed.
    pub fn tls_peer(&self) -> Option<&TlsPeer> {
        self.tls.get()
    }

    pub(crate) fn set_tls_peer(&self, peer: TlsPeer) {
        let _ = self.tls.set(peer);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("channel", &self.channel)
            .field("peer", &self.peer)
            .field("slot", &self.slot)
            .finish()
    }
}
