//! The server: a pool of reactors, channel bookkeeping, and an optional
//! worker pool for message processing.
//!
//! Every connection lives on exactly one reactor slot, addressed by a
//! [`Channel`] whose low bits encode the slot. Cross-thread `send` and
//! `disconnect` ship the payload to the owning loop as a command (bytes are
//! copied, so the caller's buffer is free on return); calls made on the
//! owning thread skip the waker but use the same queue, which keeps every
//! mutation of a linkage on its own thread.
//!
//! Outgoing channels are lazy: [`ServerHandle::connect`] only records the
//! destination. The first send materializes the connection, and if the peer
//! drops it a later send transparently reconnects. [`ServerHandle::forget`]
//! removes the route; a live connection defers the cleanup until it
//! disconnects.
//!
//! With workers configured, each complete frame becomes a job. The
//! handler's `hash_message` pins related frames to one worker (same hash,
//! same worker, frame order preserved); unpinned jobs go to a global queue
//! any worker may take.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, trace, warn};
use mio::net::TcpStream;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rustc_hash::FxHashMap;

use crate::channel::{Channel, ChannelAllocator};
use crate::handler::{Context, HandlerChoice, Tuner};
use crate::interface::{self, Resolver, SocketOptions};
use crate::io::{PlainIo, TlsIo, Transport};
use crate::linkage::{LinkHandler, Linkage};
use crate::listener::{AcceptSink, Listener};
use crate::reactor::{ClientId, Reactor, ReactorHandle, ReactorSeed};

pub const MAX_SLOTS: usize = 128;
pub const MAX_WORKERS: usize = 16384;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Server-level tunables, applied to each linkage when it attaches.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub incoming_receive_timeout: Duration,
    pub incoming_connect_timeout: Duration,
    pub incoming_send_timeout: Duration,
    pub incoming_idle_timeout: Duration,

    pub outgoing_receive_timeout: Duration,
    pub outgoing_connect_timeout: Duration,
    pub outgoing_send_timeout: Duration,
    pub outgoing_idle_timeout: Duration,

    pub maximum_incoming_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            incoming_receive_timeout: Duration::from_secs(5),
            incoming_connect_timeout: Duration::from_secs(5),
            incoming_send_timeout: Duration::from_secs(5),
            incoming_idle_timeout: Duration::from_secs(60),
            outgoing_receive_timeout: Duration::from_secs(5),
            outgoing_connect_timeout: Duration::from_secs(5),
            outgoing_send_timeout: Duration::from_secs(5),
            outgoing_idle_timeout: Duration::from_secs(60),
            maximum_incoming_connections: 50_000,
        }
    }
}

/// Client-side TLS for an outgoing route.
#[derive(Clone)]
pub struct ClientTls {
    pub config: Arc<rustls::ClientConfig>,
    pub server_name: rustls::pki_types::ServerName<'static>,
}

/// One listening endpoint.
pub struct ListenOption {
    /// Bind interface; empty means any.
    pub bind_ip: String,
    pub port: u16,
    pub listen_options: SocketOptions,
    pub accepted_options: SocketOptions,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub handler: HandlerChoice,
}

impl ListenOption {
    pub fn new(port: u16, handler: HandlerChoice) -> ListenOption {
        ListenOption {
            bind_ip: String::new(),
            port,
            listen_options: SocketOptions::listening(),
            accepted_options: SocketOptions::default(),
            tls: None,
            handler,
        }
    }
}

/// One outgoing destination.
pub struct ConnectOption {
    pub host: String,
    pub port: u16,
    pub options: SocketOptions,
    pub tls: Option<ClientTls>,
    pub handler: HandlerChoice,
    /// Owning reactor slot; -1 picks one at random.
    pub thread_id: i32,
}

impl ConnectOption {
    pub fn new(host: &str, port: u16, handler: HandlerChoice) -> ConnectOption {
        ConnectOption {
            host: host.to_owned(),
            port,
            options: SocketOptions::default(),
            tls: None,
            handler,
            thread_id: -1,
        }
    }
}

/// Everything shared by the connections of one listen/connect route.
struct RouteConfig {
    handler: HandlerChoice,
    tls_server: Option<Arc<rustls::ServerConfig>>,
    tls_client: Option<ClientTls>,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

enum Job {
    /// A complete frame, processed on a worker thread.
    Message { context: Arc<Context>, bytes: Vec<u8> },
    /// Arbitrary work queued through the pool.
    Func(Box<dyn FnOnce() + Send>),
    /// Worker exit marker.
    Shutdown,
}

fn run_job(job: Job) {
    match job {
        Job::Message { context, bytes } => {
            let ret = panic::catch_unwind(AssertUnwindSafe(|| {
                context.handler().on_message(&context, &bytes)
            }))
            .unwrap_or(-1);

            // Mirror the reactor-thread contract from a worker: failures
            // and graceful results route a disconnect back to the owner.
            if ret < 0 {
                context.handler().on_error(&context, true, libc::EBADMSG);
                context.server().disconnect(context.channel(), false);
            } else if ret == 0 {
                context.server().disconnect(context.channel(), true);
            }
        }
        Job::Func(f) => {
            let _ = panic::catch_unwind(AssertUnwindSafe(f));
        }
        Job::Shutdown => unreachable!("markers are consumed by the worker loop"),
    }
}

// ---------------------------------------------------------------------------
// Same-thread dispatch frames
// ---------------------------------------------------------------------------

// While a handler callback runs on a reactor thread, operations aimed at
// that same connection cannot re-enter the linkage (the callback already
// holds it). They collect here and apply the moment the callback returns,
// before any other event is processed.

enum DeferredOp {
    Send(Vec<u8>),
    Disconnect(bool),
}

struct DispatchFrame {
    channel: Channel,
    ops: Vec<DeferredOp>,
}

thread_local! {
    static DISPATCH: RefCell<Vec<DispatchFrame>> = const { RefCell::new(Vec::new()) };
}

/// Try to defer an operation into the dispatch frame of its own channel.
fn defer_same_channel(channel: Channel, op: DeferredOp) -> bool {
    DISPATCH.with(|d| {
        let mut stack = d.borrow_mut();
        match stack.last_mut() {
            Some(frame) if frame.channel == channel => {
                frame.ops.push(op);
                true
            }
            _ => false,
        }
    })
}

/// Run `f` under a dispatch frame for `channel`, then apply whatever the
/// callback queued against its own connection.
fn dispatch_framed<F>(channel: Channel, link: &mut Linkage, f: F) -> i32
where
    F: FnOnce() -> i32,
{
    DISPATCH.with(|d| {
        d.borrow_mut().push(DispatchFrame { channel, ops: Vec::new() });
    });
    let ret = f();
    let frame = DISPATCH
        .with(|d| d.borrow_mut().pop())
        .expect("dispatch frame pushed above");

    let mut terminal = 1;
    for op in frame.ops {
        match op {
            DeferredOp::Send(bytes) => {
                if !link.send(&bytes) {
                    debug!("deferred send failed on {channel}");
                    terminal = -1;
                    break;
                }
            }
            DeferredOp::Disconnect(finish) => {
                terminal = terminal.min(link.disconnect(finish));
            }
        }
    }

    if ret <= 0 {
        ret
    } else {
        terminal
    }
}

// ---------------------------------------------------------------------------
// Core state
// ---------------------------------------------------------------------------

/// A destination remembered for an outgoing channel; survives disconnects
/// so later sends can reconnect.
struct OutgoingInfo {
    host: String,
    port: u16,
    options: SocketOptions,
    route: Arc<RouteConfig>,
}

/// Cross-thread view of one reactor slot.
struct SlotShared {
    slot: usize,
    handle: ReactorHandle,
    channels: ChannelAllocator,
    outgoing: Mutex<FxHashMap<Channel, Arc<OutgoingInfo>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Configuring,
    Running,
    Stopped,
}

pub(crate) struct ServerCore {
    config: RwLock<ServerConfig>,
    slots: RwLock<Vec<Arc<SlotShared>>>,
    worker_count: AtomicUsize,
    worker_txs: RwLock<Vec<Sender<Job>>>,
    global_tx: Sender<Job>,
    global_rx: Receiver<Job>,
    incoming_connections: AtomicUsize,
    outgoing_connections: AtomicUsize,
    resolver: Resolver,
    pending_timers: Mutex<Vec<PendingTimer>>,
    state: Mutex<ServerState>,
}

type ServerTimer = Box<dyn FnMut() -> bool + Send>;

struct PendingTimer {
    after: Duration,
    period: Duration,
    callback: ServerTimer,
}

impl ServerCore {
    fn new() -> Arc<ServerCore> {
        let (global_tx, global_rx) = crossbeam_channel::unbounded();
        Arc::new(ServerCore {
            config: RwLock::new(ServerConfig::default()),
            slots: RwLock::new(Vec::new()),
            worker_count: AtomicUsize::new(0),
            worker_txs: RwLock::new(Vec::new()),
            global_tx,
            global_rx,
            incoming_connections: AtomicUsize::new(0),
            outgoing_connections: AtomicUsize::new(0),
            resolver: Resolver::default(),
            pending_timers: Mutex::new(Vec::new()),
            state: Mutex::new(ServerState::Configuring),
        })
    }

    fn workers(&self) -> usize {
        self.worker_count.load(Ordering::Relaxed)
    }

    /// The slot owning `channel`, derived purely from the handle.
    fn slot_shared(&self, channel: Channel) -> Option<Arc<SlotShared>> {
        if !channel.is_valid() {
            return None;
        }
        let slots = self.slots.read();
        if slots.is_empty() {
            return None;
        }
        slots.get(channel.slot(slots.len())).cloned()
    }

    fn send(&self, channel: Channel, buf: &[u8]) -> bool {
        if defer_same_channel(channel, DeferredOp::Send(buf.to_vec())) {
            return true;
        }

        let Some(slot) = self.slot_shared(channel) else {
            return false;
        };
        let bytes = buf.to_vec();
        slot.handle
            .send_command(move |reactor| do_real_send(reactor, channel, bytes))
    }

    fn disconnect(&self, channel: Channel, finish_write: bool) -> bool {
        if defer_same_channel(channel, DeferredOp::Disconnect(finish_write)) {
            return true;
        }

        let Some(slot) = self.slot_shared(channel) else {
            return true;
        };
        slot.handle
            .send_command(move |reactor| do_real_disconnect(reactor, channel, finish_write))
    }

    fn connect(&self, option: ConnectOption) -> Channel {
        let slots = self.slots.read();
        if slots.is_empty() {
            warn!("connect before initialize");
            return Channel::INVALID;
        }

        let idx = if option.thread_id >= 0 && (option.thread_id as usize) < slots.len() {
            option.thread_id as usize
        } else {
            rand::rng().random_range(0..slots.len())
        };

        let shared = &slots[idx];
        let channel = shared.channels.allocate(true);
        let route = Arc::new(RouteConfig {
            handler: option.handler,
            tls_server: None,
            tls_client: option.tls,
        });
        shared.outgoing.lock().insert(
            channel,
            Arc::new(OutgoingInfo {
                host: option.host,
                port: option.port,
                options: option.options,
                route,
            }),
        );

        trace!("outgoing channel {channel} routed to slot {idx}");
        channel
    }

    fn forget(&self, channel: Channel) {
        if let Some(slot) = self.slot_shared(channel) {
            // A live connection keeps its handler until it disconnects; only
            // the route is removed here.
            slot.outgoing.lock().remove(&channel);
        }
    }

    fn append_job(&self, job: Job, hash: i32) {
        if hash < 0 {
            let _ = self.global_tx.send(job);
        } else {
            let txs = self.worker_txs.read();
            if txs.is_empty() {
                let _ = self.global_tx.send(job);
                return;
            }
            let idx = hash as usize % txs.len();
            let _ = txs[idx].send(job);
        }
    }

    fn queue_or_execute(&self, f: Box<dyn FnOnce() + Send>, hash: i32) {
        if self.workers() > 0 {
            self.append_job(Job::Func(f), hash);
        } else {
            f();
        }
    }

    fn register_timer(&self, after: Duration, period: Duration, mut f: ServerTimer) -> bool {
        if period.is_zero() {
            return false;
        }

        let slots = self.slots.read();
        if slots.is_empty() {
            self.pending_timers
                .lock()
                .push(PendingTimer { after, period, callback: f });
            return true;
        }

        let idx = rand::rng().random_range(0..slots.len());
        slots[idx].handle.register_timer(after, period, move |_| f())
    }
}

// ---------------------------------------------------------------------------
// Reactor-local slot state
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct LinkEntry {
    id: ClientId,
    link: Rc<RefCell<Linkage>>,
    ctx: Arc<Context>,
}

/// Per-reactor connection table, reachable from commands via the reactor's
/// local storage. Only the owning thread ever touches the linkages inside.
struct SlotState {
    core: Arc<ServerCore>,
    shared: Arc<SlotShared>,
    links: RefCell<FxHashMap<Channel, LinkEntry>>,
}

impl SlotState {
    fn entry(&self, channel: Channel) -> Option<LinkEntry> {
        self.links.borrow().get(&channel).cloned()
    }

    fn release_channel(&self, channel: Channel) {
        if self.links.borrow_mut().remove(&channel).is_none() {
            return;
        }
        if channel.is_outgoing() {
            self.core.outgoing_connections.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.core.incoming_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Admit an accepted stream: count it, wrap it, attach it.
    fn accept(
        this: &Rc<Self>,
        reactor: &mut Reactor,
        stream: TcpStream,
        peer: SocketAddr,
        me: SocketAddr,
        route: &Arc<RouteConfig>,
    ) -> bool {
        let core = &this.core;
        let max = core.config.read().maximum_incoming_connections;
        let count = core.incoming_connections.fetch_add(1, Ordering::SeqCst) + 1;
        if count > max {
            debug!("incoming connections over limit: {max}");
            core.incoming_connections.fetch_sub(1, Ordering::SeqCst);
            return false;
        }

        let transport: Box<dyn Transport> = match &route.tls_server {
            Some(config) => match TlsIo::server(stream, Arc::clone(config)) {
                Ok(t) => Box::new(t),
                Err(e) => {
                    warn!("failed to start TLS for {peer}: {e}");
                    core.incoming_connections.fetch_sub(1, Ordering::SeqCst);
                    return false;
                }
            },
            None => Box::new(PlainIo::established(stream)),
        };

        let channel = this.shared.channels.allocate(false);
        let handler = route.handler.instantiate();
        let ctx = Arc::new(Context::new(
            ServerHandle { core: Arc::clone(core) },
            handler,
            channel,
            peer,
            me,
            this.shared.slot,
        ));

        let proxy = Rc::new(ProxyLinkHandler {
            ctx: Arc::clone(&ctx),
            state: Rc::downgrade(this),
        });
        let mut linkage = Linkage::new(transport, proxy, peer, me);
        {
            let cfg = core.config.read();
            linkage.set_receive_timeout(cfg.incoming_receive_timeout);
            linkage.set_connect_timeout(cfg.incoming_connect_timeout);
            linkage.set_send_timeout(cfg.incoming_send_timeout);
            linkage.set_idle_timeout(cfg.incoming_idle_timeout);
        }

        let link = Rc::new(RefCell::new(linkage));
        let Some(id) = Linkage::attach(&link, reactor) else {
            core.incoming_connections.fetch_sub(1, Ordering::SeqCst);
            return false;
        };

        trace!("incoming {peer} became {channel}");
        this.links.borrow_mut().insert(channel, LinkEntry { id, link, ctx });
        true
    }

    /// Open the recorded destination for an outgoing channel.
    fn reconnect(
        this: &Rc<Self>,
        reactor: &mut Reactor,
        channel: Channel,
        info: &Arc<OutgoingInfo>,
    ) -> Option<LinkEntry> {
        let core = &this.core;
        let handler = info.route.handler.instantiate();
        let server = ServerHandle { core: Arc::clone(core) };
        let unspecified: SocketAddr = "0.0.0.0:0".parse().expect("literal parses");

        let connected = core
            .resolver
            .resolve(&info.host)
            .and_then(|ips| {
                let ip = ips
                    .first()
                    .copied()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address"))?;
                let addr = SocketAddr::new(ip, info.port);
                interface::connect_tcp(addr, &info.options).map(|s| (s, addr))
            });

        let (stream, peer) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                warn!("failed to connect {} to {}:{}: {e}", channel, info.host, info.port);
                let ctx = Context::new(
                    server,
                    handler,
                    channel,
                    unspecified,
                    unspecified,
                    this.shared.slot,
                );
                let errnum = e.raw_os_error().unwrap_or(libc::EIO);
                ctx.handler().on_error(&ctx, false, errnum);
                ctx.handler().on_disconnected(&ctx);
                return None;
            }
        };

        let me = stream.local_addr().unwrap_or(unspecified);
        let transport: Box<dyn Transport> = match &info.route.tls_client {
            Some(tls) => match TlsIo::client(
                stream,
                Arc::clone(&tls.config),
                tls.server_name.clone(),
                true,
            ) {
                Ok(t) => Box::new(t),
                Err(e) => {
                    warn!("failed to start TLS toward {}: {e}", info.host);
                    return None;
                }
            },
            None => Box::new(PlainIo::connecting(stream)),
        };

        let ctx = Arc::new(Context::new(server, handler, channel, peer, me, this.shared.slot));
        let proxy = Rc::new(ProxyLinkHandler {
            ctx: Arc::clone(&ctx),
            state: Rc::downgrade(this),
        });
        let mut linkage = Linkage::new(transport, proxy, peer, me);
        {
            let cfg = core.config.read();
            linkage.set_receive_timeout(cfg.outgoing_receive_timeout);
            linkage.set_connect_timeout(cfg.outgoing_connect_timeout);
            linkage.set_send_timeout(cfg.outgoing_send_timeout);
            linkage.set_idle_timeout(cfg.outgoing_idle_timeout);
        }

        let link = Rc::new(RefCell::new(linkage));
        let Some(id) = Linkage::attach(&link, reactor) else {
            let errnum = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            ctx.handler().on_error(&ctx, false, errnum);
            return None;
        };

        trace!("outgoing {channel} connecting to {peer}");
        let entry = LinkEntry { id, link, ctx };
        this.links.borrow_mut().insert(channel, entry.clone());
        core.outgoing_connections.fetch_add(1, Ordering::SeqCst);
        Some(entry)
    }
}

/// Runs on the owning reactor: find (or revive) the connection, hand it
/// the bytes.
fn do_real_send(reactor: &mut Reactor, channel: Channel, bytes: Vec<u8>) {
    let Some(st) = reactor.local::<SlotState>() else {
        return;
    };

    let entry = match st.entry(channel) {
        Some(entry) => Some(entry),
        None if channel.is_outgoing() => {
            let info = st.shared.outgoing.lock().get(&channel).cloned();
            info.and_then(|info| SlotState::reconnect(&st, reactor, channel, &info))
        }
        None => None,
    };

    let Some(entry) = entry else {
        // Incoming peers that went away just lose the message.
        trace!("dropping {} bytes for gone channel {channel}", bytes.len());
        return;
    };

    let ok = entry.link.borrow_mut().send(&bytes);
    if ok {
        reactor.sync_interest(entry.id);
    } else {
        entry.ctx.handler().on_error(&entry.ctx, false, libc::ENOMEM);
        let ret = entry.link.borrow_mut().disconnect(false);
        if ret <= 0 {
            reactor.release(entry.id);
        } else {
            reactor.sync_interest(entry.id);
        }
    }
}

fn do_real_disconnect(reactor: &mut Reactor, channel: Channel, finish_write: bool) {
    let Some(st) = reactor.local::<SlotState>() else {
        return;
    };
    let Some(entry) = st.entry(channel) else {
        return;
    };

    let ret = entry.link.borrow_mut().disconnect(finish_write);
    if ret <= 0 {
        reactor.release(entry.id);
    } else {
        reactor.sync_interest(entry.id);
    }
}

// ---------------------------------------------------------------------------
// Proxies between the linkage layer and the handler contract
// ---------------------------------------------------------------------------

struct ProxyLinkHandler {
    ctx: Arc<Context>,
    state: Weak<SlotState>,
}

impl LinkHandler for ProxyLinkHandler {
    fn get_message_length(&self, _link: &Linkage, buf: &[u8]) -> isize {
        self.ctx.handler().get_message_length(&self.ctx, buf)
    }

    fn on_message(&self, link: &mut Linkage, buf: &[u8]) -> i32 {
        let Some(st) = self.state.upgrade() else {
            return -1;
        };

        if st.core.workers() > 0 {
            // Hash on the I/O thread, process on a worker.
            let hash = self.ctx.handler().hash_message(&self.ctx, buf);
            st.core.append_job(
                Job::Message { context: Arc::clone(&self.ctx), bytes: buf.to_vec() },
                hash,
            );
            return 1;
        }

        dispatch_framed(self.ctx.channel(), link, || {
            self.ctx.handler().on_message(&self.ctx, buf)
        })
    }

    fn on_connected(&self, link: &mut Linkage) -> bool {
        if let Some(peer) = link.tls_peer() {
            self.ctx.set_tls_peer(peer.clone());
        }

        let ret = dispatch_framed(self.ctx.channel(), link, || {
            if self.ctx.handler().on_connected(&self.ctx) {
                1
            } else {
                -1
            }
        });
        ret > 0
    }

    fn on_disconnected(&self, _link: &Linkage) {
        self.ctx.handler().on_disconnected(&self.ctx);
        if let Some(st) = self.state.upgrade() {
            st.release_channel(self.ctx.channel());
        }
    }

    fn on_error(&self, _link: &Linkage, reading: bool, errnum: i32) {
        self.ctx.handler().on_error(&self.ctx, reading, errnum);
    }

    fn cleanup(&self, _link: &Linkage, now: std::time::Instant) -> bool {
        self.ctx.handler().cleanup(&self.ctx, now)
    }
}

struct ServerAcceptor {
    state: Weak<SlotState>,
    route: Arc<RouteConfig>,
}

impl AcceptSink for ServerAcceptor {
    fn on_accepted(
        &self,
        reactor: &mut Reactor,
        stream: TcpStream,
        peer: SocketAddr,
        me: SocketAddr,
    ) -> bool {
        match self.state.upgrade() {
            Some(st) => SlotState::accept(&st, reactor, stream, peer, me, &self.route),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// ServerHandle
// ---------------------------------------------------------------------------

/// Cross-thread interface to a running server.
///
/// Cheap to clone; safe to use from reactor callbacks, worker jobs and
/// foreign threads alike.
#[derive(Clone)]
pub struct ServerHandle {
    core: Arc<ServerCore>,
}

impl ServerHandle {
    /// Send `buf` over `channel`.
    ///
    /// Incoming channels that already disconnected drop the bytes;
    /// outgoing channels reconnect transparently. The buffer is copied, so
    /// it may be reused immediately.
    pub fn send(&self, channel: Channel, buf: &[u8]) -> bool {
        self.core.send(channel, buf)
    }

    /// Close `channel`; with `finish_write` the queued bytes drain first.
    pub fn disconnect(&self, channel: Channel, finish_write: bool) -> bool {
        self.core.disconnect(channel, finish_write)
    }

    /// Record an outgoing destination and return its channel. The socket
    /// opens on the first send.
    pub fn connect(&self, option: ConnectOption) -> Channel {
        self.core.connect(option)
    }

    /// Drop the reconnect route for an outgoing channel.
    pub fn forget(&self, channel: Channel) {
        self.core.forget(channel)
    }

    /// Run `f` on the worker pool (optionally pinned by `hash`), or inline
    /// when no workers are configured.
    pub fn queue_or_execute(&self, f: Box<dyn FnOnce() + Send>, hash: i32) {
        self.core.queue_or_execute(f, hash)
    }

    /// Queue a command into a specific reactor slot.
    pub fn queue_io<F>(&self, thread_id: usize, f: F) -> bool
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        let slots = self.core.slots.read();
        match slots.get(thread_id) {
            Some(slot) => slot.handle.send_command(f),
            None => false,
        }
    }

    /// Register a repeating timer on one of the I/O threads; the callback
    /// returning `false` releases it. Usable before initialize.
    pub fn register_timer<F>(&self, after: Duration, period: Duration, f: F) -> bool
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.core.register_timer(after, period, Box::new(f))
    }

    pub fn incoming_connections(&self) -> usize {
        self.core.incoming_connections.load(Ordering::SeqCst)
    }

    pub fn outgoing_connections(&self) -> usize {
        self.core.outgoing_connections.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct PendingListener {
    listener: std::net::TcpListener,
    accepted_options: SocketOptions,
    route: Arc<RouteConfig>,
}

pub struct Server {
    core: Arc<ServerCore>,
    pending_listeners: Vec<PendingListener>,
    io_threads: Vec<JoinHandle<bool>>,
    worker_threads: Vec<JoinHandle<()>>,
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

impl Server {
    pub fn new() -> Server {
        Server {
            core: ServerCore::new(),
            pending_listeners: Vec::new(),
            io_threads: Vec::new(),
            worker_threads: Vec::new(),
        }
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle { core: Arc::clone(&self.core) }
    }

    /// Adjust tunables; call before `initialize`.
    pub fn configure<F>(&self, f: F)
    where
        F: FnOnce(&mut ServerConfig),
    {
        f(&mut self.core.config.write())
    }

    /// Bind a listening endpoint; must precede `initialize`.
    ///
    /// Returns the bound address (useful with port 0).
    pub fn listen(&mut self, option: ListenOption) -> io::Result<SocketAddr> {
        if *self.core.state.lock() != ServerState::Configuring {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "listen only before initialize",
            ));
        }

        let listener = interface::listen_tcp(&option.bind_ip, option.port, &option.listen_options)?;
        let addr = listener.local_addr()?;
        self.pending_listeners.push(PendingListener {
            listener,
            accepted_options: option.accepted_options,
            route: Arc::new(RouteConfig {
                handler: option.handler,
                tls_server: option.tls,
                tls_client: None,
            }),
        });
        Ok(addr)
    }

    /// Start `slots` I/O threads and `workers` job threads.
    pub fn initialize(
        &mut self,
        slots: usize,
        workers: usize,
        tuner: Option<Arc<dyn Tuner>>,
    ) -> bool {
        if slots == 0 || slots > MAX_SLOTS || workers > MAX_WORKERS {
            error!("invalid initialize parameters: {slots} slots, {workers} workers");
            return false;
        }
        self.do_initialize(vec![Vec::new(); slots], vec![Vec::new(); workers], tuner)
    }

    /// Like [`initialize`](Server::initialize), but with explicit CPU
    /// affinities: one semicolon-separated list per thread, each a comma-
    /// separated set of CPU ids ("0,1;2,3" pins two threads to two CPUs
    /// each). An empty list leaves the thread unpinned.
    pub fn initialize_with_affinity(
        &mut self,
        slots: &str,
        workers: Option<&str>,
        tuner: Option<Arc<dyn Tuner>>,
    ) -> bool {
        let Some(slot_affinities) = parse_affinity_lists(slots, MAX_SLOTS) else {
            error!("invalid slot affinity spec: {slots:?}");
            return false;
        };
        let worker_affinities = match workers {
            Some(spec) => match parse_affinity_lists(spec, MAX_WORKERS) {
                Some(lists) => lists,
                None => {
                    error!("invalid worker affinity spec: {spec:?}");
                    return false;
                }
            },
            None => Vec::new(),
        };
        self.do_initialize(slot_affinities, worker_affinities, tuner)
    }

    fn do_initialize(
        &mut self,
        slot_affinities: Vec<Vec<usize>>,
        worker_affinities: Vec<Vec<usize>>,
        tuner: Option<Arc<dyn Tuner>>,
    ) -> bool {
        {
            let mut state = self.core.state.lock();
            if *state != ServerState::Configuring {
                error!("initialize called twice");
                return false;
            }
            *state = ServerState::Running;
        }

        let slot_count = slot_affinities.len();
        let worker_count = worker_affinities.len();

        let mut seeds = Vec::with_capacity(slot_count);
        let mut shareds = Vec::with_capacity(slot_count);
        for slot in 0..slot_count {
            let seed = match ReactorSeed::new() {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to create reactor {slot}: {e}");
                    *self.core.state.lock() = ServerState::Stopped;
                    return false;
                }
            };
            shareds.push(Arc::new(SlotShared {
                slot,
                handle: seed.handle(),
                channels: ChannelAllocator::new(slot, slot_count),
                outgoing: Mutex::new(FxHashMap::default()),
            }));
            seeds.push(seed);
        }

        // Every slot accepts on its own clone of each listening socket.
        let mut listeners_per_slot: Vec<Vec<(std::net::TcpListener, SocketOptions, Arc<RouteConfig>)>> =
            (0..slot_count).map(|_| Vec::new()).collect();
        for pending in self.pending_listeners.drain(..) {
            for per_slot in listeners_per_slot.iter_mut() {
                match pending.listener.try_clone() {
                    Ok(clone) => per_slot.push((
                        clone,
                        pending.accepted_options.clone(),
                        Arc::clone(&pending.route),
                    )),
                    Err(e) => {
                        error!("failed to clone listener: {e}");
                        *self.core.state.lock() = ServerState::Stopped;
                        return false;
                    }
                }
            }
        }

        *self.core.slots.write() = shareds.clone();

        // Worker queues exist before any I/O thread can produce a job.
        self.core.worker_count.store(worker_count, Ordering::SeqCst);
        let mut worker_rxs = Vec::with_capacity(worker_count);
        {
            let mut txs = self.core.worker_txs.write();
            txs.clear();
            for _ in 0..worker_count {
                let (tx, rx) = crossbeam_channel::unbounded();
                txs.push(tx);
                worker_rxs.push(rx);
            }
        }

        for (slot, seed) in seeds.into_iter().enumerate() {
            let core = Arc::clone(&self.core);
            let shared = Arc::clone(&shareds[slot]);
            let listeners = std::mem::take(&mut listeners_per_slot[slot]);
            let tuner = tuner.clone();
            let affinity = slot_affinities[slot].clone();

            let thread = std::thread::Builder::new()
                .name(format!("tether-io-{slot}"))
                .spawn(move || {
                    io_thread_main(seed.into_reactor(), core, shared, listeners, tuner, affinity)
                });
            match thread {
                Ok(t) => self.io_threads.push(t),
                Err(e) => {
                    error!("failed to spawn I/O thread {slot}: {e}");
                    self.shutdown();
                    return false;
                }
            }
        }

        for (id, rx) in worker_rxs.into_iter().enumerate() {
            let global_rx = self.core.global_rx.clone();
            let tuner = tuner.clone();
            let affinity = worker_affinities[id].clone();

            let thread = std::thread::Builder::new()
                .name(format!("tether-job-{id}"))
                .spawn(move || job_thread_main(id, rx, global_rx, tuner, affinity));
            match thread {
                Ok(t) => self.worker_threads.push(t),
                Err(e) => {
                    error!("failed to spawn job thread {id}: {e}");
                    self.shutdown();
                    return false;
                }
            }
        }

        // Timers registered while configuring go live now.
        let pending: Vec<PendingTimer> = self.core.pending_timers.lock().drain(..).collect();
        for t in pending {
            self.core.register_timer(t.after, t.period, t.callback);
        }

        debug!("server running with {slot_count} slots, {worker_count} workers");
        true
    }

    /// Stop everything: reactors, workers, listeners. Every live
    /// connection sees `on_disconnected` exactly once. Idempotent.
    pub fn shutdown(&mut self) -> bool {
        {
            let mut state = self.core.state.lock();
            match *state {
                ServerState::Stopped => return true,
                ServerState::Configuring => {
                    *state = ServerState::Stopped;
                    self.pending_listeners.clear();
                    return true;
                }
                ServerState::Running => *state = ServerState::Stopped,
            }
        }

        {
            let txs = self.core.worker_txs.read();
            for tx in txs.iter() {
                let _ = tx.send(Job::Shutdown);
            }
        }

        {
            let slots = self.core.slots.read();
            for slot in slots.iter() {
                slot.handle.shutdown();
            }
        }

        for t in self.io_threads.drain(..) {
            let _ = t.join();
        }
        for t in self.worker_threads.drain(..) {
            let _ = t.join();
        }

        self.core.slots.write().clear();
        self.core.worker_txs.write().clear();
        self.core.worker_count.store(0, Ordering::SeqCst);
        debug!("server stopped");
        true
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Thread bodies
// ---------------------------------------------------------------------------

fn io_thread_main(
    mut reactor: Reactor,
    core: Arc<ServerCore>,
    shared: Arc<SlotShared>,
    listeners: Vec<(std::net::TcpListener, SocketOptions, Arc<RouteConfig>)>,
    tuner: Option<Arc<dyn Tuner>>,
    affinity: Vec<usize>,
) -> bool {
    let st = Rc::new(SlotState {
        core,
        shared,
        links: RefCell::new(FxHashMap::default()),
    });
    reactor.set_local(Rc::clone(&st));

    for (listener, options, route) in listeners {
        let sink = Box::new(ServerAcceptor { state: Rc::downgrade(&st), route });
        match Listener::from_std(listener, options, sink) {
            Ok(l) => {
                let l = Rc::new(RefCell::new(l));
                if let Err(e) = Listener::attach(&l, &mut reactor) {
                    error!("failed to attach listener: {e}");
                    return false;
                }
            }
            Err(e) => {
                error!("failed to adopt listener: {e}");
                return false;
            }
        }
    }

    let init_tuner = tuner.clone();
    reactor.set_init_hook(move |_| {
        if !apply_affinity(&affinity) {
            return false;
        }
        match &init_tuner {
            Some(t) => t.on_io_thread_initialize(),
            None => true,
        }
    });
    reactor.set_shutdown_hook(move |_| {
        if let Some(t) = &tuner {
            t.on_io_thread_shutdown();
        }
    });

    reactor.run()
}

fn job_thread_main(
    id: usize,
    own: Receiver<Job>,
    global: Receiver<Job>,
    tuner: Option<Arc<dyn Tuner>>,
    affinity: Vec<usize>,
) {
    if !apply_affinity(&affinity) {
        error!("worker {id} failed to set affinity");
        return;
    }
    if let Some(t) = &tuner {
        if !t.on_job_thread_initialize() {
            error!("worker {id} failed to initialize");
            return;
        }
    }

    trace!("worker {id} started");
    loop {
        // The worker's own queue has priority over the shared one.
        let job = match own.try_recv() {
            Ok(job) => job,
            Err(_) => match global.try_recv() {
                Ok(job) => job,
                Err(_) => crossbeam_channel::select! {
                    recv(own) -> job => match job {
                        Ok(job) => job,
                        Err(_) => break,
                    },
                    recv(global) -> job => match job {
                        Ok(job) => job,
                        Err(_) => break,
                    },
                },
            },
        };

        match job {
            Job::Shutdown => break,
            job => run_job(job),
        }
    }
    trace!("worker {id} quit");

    if let Some(t) = &tuner {
        t.on_job_thread_shutdown();
    }
}

// ---------------------------------------------------------------------------
// Affinity
// ---------------------------------------------------------------------------

/// Parse "0,1;2;;" style per-thread CPU lists. Empty segments mean no
/// affinity for that thread.
fn parse_affinity_lists(spec: &str, max: usize) -> Option<Vec<Vec<usize>>> {
    let mut lists = Vec::new();
    for part in spec.split(';') {
        let part = part.trim();
        if part.is_empty() {
            lists.push(Vec::new());
            continue;
        }
        let mut cpus = Vec::new();
        for token in part.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            cpus.push(token.parse().ok()?);
        }
        lists.push(cpus);
    }

    if lists.is_empty() || lists.len() > max {
        return None;
    }
    Some(lists)
}

#[cfg(target_os = "linux")]
fn apply_affinity(cpus: &[usize]) -> bool {
    if cpus.is_empty() {
        return true;
    }

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_affinity(cpus: &[usize]) -> bool {
    if !cpus.is_empty() {
        warn!("thread affinity is not supported on this platform");
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
