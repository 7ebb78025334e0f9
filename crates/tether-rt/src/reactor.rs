//! Single-thread event loop.
//!
//! A reactor owns everything that happens on its thread: client
//! registrations (read/write interest on a mio source), a wheel of timers,
//! and an MPSC command queue other threads use to run work inside the loop.
//! Callbacks follow one convention: `< 0` error, `0` graceful close, `> 0`
//! keep going.
//!
//! The loop polls with a 1 ms ceiling so timers never starve, dispatches
//! readiness, drains commands, then advances the timer wheel. A once-per-
//! second health check walks every client's `cleanup(now)` and tears down
//! refusers. Shutdown is a `Quit` command: the loop releases every client
//! (each `on_disconnected` fires exactly once) and every timer before
//! `run()` returns.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use slab::Slab;

use crate::timer::TimerWheel;

/// Token reserved for the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Identifies an attached client within its reactor.
pub type ClientId = usize;

// ---------------------------------------------------------------------------
// LinkageBase
// ---------------------------------------------------------------------------

/// The contract between a reactor and anything it watches: connections and
/// listeners alike.
///
/// Event callbacks run on the reactor thread with the reactor itself
/// available for attaching new clients. Desired interest is pulled from
/// [`wanted`](LinkageBase::wanted) after every callback rather than pushed
/// mid-callback, so implementations just keep their flags current.
pub trait LinkageBase {
    /// The mio source to (de)register.
    fn source_mut(&mut self) -> &mut dyn Source;

    /// Socket turned readable. `<0` error, `0` graceful close, `>0` continue.
    fn on_readable(&mut self, reactor: &mut Reactor) -> i32;

    /// Socket turned writable. Same convention as `on_readable`.
    fn on_writable(&mut self, reactor: &mut Reactor) -> i32;

    /// An unrecoverable error was hit while reading or writing.
    fn on_error(&mut self, reading: bool, errnum: i32);

    /// The reactor is done with this client. Fires exactly once.
    fn on_disconnected(&mut self);

    /// Once-per-second health verdict; `false` requests teardown.
    fn cleanup(&mut self, now: Instant) -> bool;

    /// Currently desired (read, write) interest.
    fn wanted(&self) -> (bool, bool);

    /// Overwrite the desired interest.
    fn set_wanted(&mut self, read: bool, write: bool);
}

fn interest_of(wanted: (bool, bool)) -> Option<Interest> {
    match wanted {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub(crate) enum Command {
    Run(Box<dyn FnOnce(&mut Reactor) + Send>),
    Quit,
}

/// Cross-thread handle to a reactor: command queue plus waker.
///
/// Cloneable and `Send`; everything it queues runs inside the loop thread
/// in FIFO order.
#[derive(Clone)]
pub struct ReactorHandle {
    commands: Arc<Mutex<VecDeque<Command>>>,
    waker: Arc<Waker>,
    loop_thread: Arc<Mutex<Option<ThreadId>>>,
}

impl ReactorHandle {
    /// Queue `f` to run inside the loop.
    pub fn send_command<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.post(Command::Run(Box::new(f)))
    }

    /// Ask the loop to quit. Idempotent: extra quits are absorbed.
    pub fn shutdown(&self) -> bool {
        self.post(Command::Quit)
    }

    /// Register a timer from any thread; routed through the command queue.
    pub fn register_timer<F>(&self, after: Duration, period: Duration, f: F) -> bool
    where
        F: FnMut(&mut Reactor) -> bool + Send + 'static,
    {
        self.send_command(move |r| {
            if !r.register_timer(after, period, f) {
                warn!("failed to register routed timer");
            }
        })
    }

    /// Whether the calling thread is the loop thread.
    pub fn is_loop_thread(&self) -> bool {
        *self.loop_thread.lock() == Some(thread::current().id())
    }

    fn post(&self, cmd: Command) -> bool {
        self.commands.lock().push_back(cmd);
        // The loop drains the queue on every iteration; waking is only
        // needed to interrupt a poll from another thread.
        if !self.is_loop_thread() {
            if let Err(e) = self.waker.wake() {
                warn!("failed to wake reactor: {e}");
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// ReactorSeed
// ---------------------------------------------------------------------------

/// The `Send` half of a reactor: poller, waker and command queue.
///
/// A seed is created wherever convenient, its [`handle`](ReactorSeed::handle)
/// distributed, and the seed itself moved to the loop thread where
/// [`into_reactor`](ReactorSeed::into_reactor) grows the thread-bound state
/// around it.
pub struct ReactorSeed {
    poll: Poll,
    waker: Arc<Waker>,
    commands: Arc<Mutex<VecDeque<Command>>>,
    loop_thread: Arc<Mutex<Option<ThreadId>>>,
}

impl ReactorSeed {
    pub fn new() -> io::Result<ReactorSeed> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(ReactorSeed {
            poll,
            waker,
            commands: Arc::new(Mutex::new(VecDeque::new())),
            loop_thread: Arc::new(Mutex::new(None)),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            commands: Arc::clone(&self.commands),
            waker: Arc::clone(&self.waker),
            loop_thread: Arc::clone(&self.loop_thread),
        }
    }

    /// Finish construction on the thread that will run the loop.
    pub fn into_reactor(self) -> Reactor {
        Reactor {
            poll: self.poll,
            waker: self.waker,
            clients: Slab::new(),
            wheel: TimerWheel::new(0),
            fired: Vec::new(),
            epoch: Instant::now(),
            commands: self.commands,
            loop_thread: self.loop_thread,
            quit: false,
            locals: FxHashMap::default(),
            init_hook: None,
            shutdown_hook: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Reactor
// ---------------------------------------------------------------------------

struct Client {
    link: Rc<RefCell<dyn LinkageBase>>,
    /// Interest currently registered with the poller; `None` when the
    /// source is not registered at all.
    registered: Option<(bool, bool)>,
}

struct TimerEntry {
    callback: Box<dyn FnMut(&mut Reactor) -> bool>,
    period: Duration,
    deadline_ms: u64,
}

pub struct Reactor {
    poll: Poll,
    waker: Arc<Waker>,
    clients: Slab<Client>,
    wheel: TimerWheel<TimerEntry>,
    fired: Vec<TimerEntry>,
    epoch: Instant,
    commands: Arc<Mutex<VecDeque<Command>>>,
    loop_thread: Arc<Mutex<Option<ThreadId>>>,
    quit: bool,
    locals: FxHashMap<TypeId, Rc<dyn Any>>,
    init_hook: Option<Box<dyn FnOnce(&mut Reactor) -> bool>>,
    shutdown_hook: Option<Box<dyn FnOnce(&mut Reactor)>>,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        Ok(ReactorSeed::new()?.into_reactor())
    }

    /// Cross-thread handle for commands, timers and shutdown.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            commands: Arc::clone(&self.commands),
            waker: Arc::clone(&self.waker),
            loop_thread: Arc::clone(&self.loop_thread),
        }
    }

    /// Runs once when the loop starts; returning `false` aborts the run.
    pub fn set_init_hook<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Reactor) -> bool + 'static,
    {
        self.init_hook = Some(Box::new(f));
    }

    /// Runs after the loop tears down its clients and timers.
    pub fn set_shutdown_hook<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Reactor) + 'static,
    {
        self.shutdown_hook = Some(Box::new(f));
    }

    // -- thread-local extension state ---------------------------------------

    /// Install a value reachable by commands running inside this loop.
    pub fn set_local<T: 'static>(&mut self, value: Rc<T>) {
        self.locals.insert(TypeId::of::<T>(), value);
    }

    /// Fetch a value installed with [`set_local`](Reactor::set_local).
    pub fn local<T: 'static>(&self) -> Option<Rc<T>> {
        self.locals
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|rc| rc.downcast::<T>().ok())
    }

    // -- clients -------------------------------------------------------------

    /// Register a client and its source using the interest it reports.
    pub fn attach(&mut self, link: Rc<RefCell<dyn LinkageBase>>) -> io::Result<ClientId> {
        let wanted = link.borrow().wanted();
        let entry = self.clients.vacant_entry();
        let id = entry.key();

        let mut registered = None;
        if let Some(interest) = interest_of(wanted) {
            self.poll
                .registry()
                .register(link.borrow_mut().source_mut(), Token(id), interest)?;
            registered = Some(wanted);
        }

        entry.insert(Client { link, registered });
        trace!("client {id} attached");
        Ok(id)
    }

    /// Remove a client without firing `on_disconnected`.
    pub fn detach(&mut self, id: ClientId) -> bool {
        let Some(client) = self.clients.try_remove(id) else {
            return true;
        };
        if client.registered.is_some() {
            let _ = self
                .poll
                .registry()
                .deregister(client.link.borrow_mut().source_mut());
        }
        trace!("client {id} detached");
        true
    }

    /// Remove a client, firing `on_disconnected` exactly once.
    pub fn release(&mut self, id: ClientId) {
        let Some(client) = self.clients.try_remove(id) else {
            return;
        };
        let mut link = client.link.borrow_mut();
        if client.registered.is_some() {
            let _ = self.poll.registry().deregister(link.source_mut());
        }
        trace!("client {id} released");
        link.on_disconnected();
    }

    /// Force a client's desired interest, then apply it. Loop thread only.
    pub fn set_wanna(&mut self, id: ClientId, read: bool, write: bool) -> bool {
        let Some(client) = self.clients.get(id) else {
            return false;
        };
        client.link.borrow_mut().set_wanted(read, write);
        self.sync_interest(id);
        true
    }

    pub fn set_wanna_read(&mut self, id: ClientId, wanna: bool) -> bool {
        let Some(client) = self.clients.get(id) else {
            return false;
        };
        let (_, w) = client.link.borrow().wanted();
        self.set_wanna(id, wanna, w)
    }

    pub fn set_wanna_write(&mut self, id: ClientId, wanna: bool) -> bool {
        let Some(client) = self.clients.get(id) else {
            return false;
        };
        let (r, _) = client.link.borrow().wanted();
        self.set_wanna(id, r, wanna)
    }

    /// Bring the poller registration in line with what the client wants.
    pub fn sync_interest(&mut self, id: ClientId) {
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        let wanted = client.link.borrow().wanted();
        if client.registered == Some(wanted) {
            return;
        }

        let link = Rc::clone(&client.link);
        let mut guard = link.borrow_mut();
        let registry = self.poll.registry();
        let outcome = match (client.registered.is_some(), interest_of(wanted)) {
            (false, None) => Ok(None),
            (false, Some(i)) => registry
                .register(guard.source_mut(), Token(id), i)
                .map(|()| Some(wanted)),
            (true, None) => registry.deregister(guard.source_mut()).map(|()| None),
            (true, Some(i)) => registry
                .reregister(guard.source_mut(), Token(id), i)
                .map(|()| Some(wanted)),
        };

        match outcome {
            Ok(reg) => client.registered = reg,
            Err(e) => warn!("interest change failed for client {id}: {e}"),
        }
    }

    /// Apply a callback's verdict: keep the client, or tear it down with
    /// `on_error`/`on_disconnected` per the error-kind policy.
    pub fn finish_event(&mut self, id: ClientId, ret: i32, reading: bool) {
        if ret > 0 {
            self.sync_interest(id);
            return;
        }

        if ret < 0 {
            if let Some(client) = self.clients.get(id) {
                let errnum = io::Error::last_os_error().raw_os_error().unwrap_or(0);
                client.link.borrow_mut().on_error(reading, errnum);
            }
        }
        self.release(id);
    }

    // -- timers --------------------------------------------------------------

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Register a periodic timer; the callback returning `false` releases
    /// it. `register_timer(i, i, f)` is the plain interval form.
    pub fn register_timer<F>(&mut self, after: Duration, period: Duration, f: F) -> bool
    where
        F: FnMut(&mut Reactor) -> bool + 'static,
    {
        if period.is_zero() {
            return false;
        }

        let now = self.now_ms();
        let entry = TimerEntry {
            callback: Box::new(f),
            period,
            deadline_ms: now + after.as_millis() as u64,
        };
        self.arm(now, entry);
        true
    }

    /// Insert a timer entry, hopping in horizon-sized steps when the
    /// deadline lies beyond the wheel.
    fn arm(&mut self, now_ms: u64, entry: TimerEntry) {
        let delta = entry
            .deadline_ms
            .saturating_sub(now_ms)
            .min(self.wheel.max_delta(now_ms));
        if self.wheel.schedule(now_ms, delta, entry).is_err() {
            unreachable!("clamped timer delta exceeded the wheel horizon");
        }
    }

    fn advance_timers(&mut self) {
        let now = self.now_ms();
        let mut fired = std::mem::take(&mut self.fired);
        self.wheel.advance(now, &mut fired);

        for mut entry in fired.drain(..) {
            if entry.deadline_ms > now {
                // Horizon hop; not due yet.
                self.arm(now, entry);
                continue;
            }

            if (entry.callback)(self) {
                entry.deadline_ms = now + entry.period.as_millis() as u64;
                let now = self.now_ms();
                self.arm(now, entry);
            }
        }

        self.fired = fired;
    }

    // -- health check --------------------------------------------------------

    fn health_check(&mut self) {
        let now = Instant::now();
        let ids: Vec<ClientId> = self.clients.iter().map(|(k, _)| k).collect();
        let mut drops = Vec::new();

        for id in ids {
            let Some(client) = self.clients.get(id) else { continue };
            let link = Rc::clone(&client.link);
            if !link.borrow_mut().cleanup(now) {
                drops.push(id);
            }
        }

        for id in drops {
            debug!("health check dropping client {id}");
            self.release(id);
        }
    }

    // -- the loop ------------------------------------------------------------

    fn drain_commands(&mut self) {
        let drained: VecDeque<Command> = std::mem::take(&mut *self.commands.lock());
        for cmd in drained {
            match cmd {
                Command::Quit => {
                    // Anything queued behind the quit is dropped.
                    self.quit = true;
                    return;
                }
                Command::Run(f) => f(self),
            }
        }
    }

    /// Run the loop until shutdown.
    ///
    /// Returns `true` after a clean shutdown with every client released and
    /// every timer dropped; `false` when the init hook rejects the thread
    /// or polling fails.
    pub fn run(&mut self) -> bool {
        *self.loop_thread.lock() = Some(thread::current().id());

        if let Some(hook) = self.init_hook.take() {
            if !hook(self) {
                error!("reactor init hook failed");
                *self.loop_thread.lock() = None;
                return false;
            }
        }

        // Health check fires once per second for the life of the loop.
        self.register_timer(Duration::from_secs(1), Duration::from_secs(1), |r| {
            r.health_check();
            true
        });

        let mut events = Events::with_capacity(1024);
        let mut ready: Vec<(ClientId, bool, bool)> = Vec::new();
        let mut ok = true;

        debug!("reactor loop entered");
        while !self.quit {
            match self.poll.poll(&mut events, Some(Duration::from_millis(1))) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("poll failed: {e}");
                    ok = false;
                    break;
                }
            }

            ready.clear();
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                ready.push((
                    event.token().0,
                    event.is_readable() || event.is_read_closed(),
                    event.is_writable() || event.is_write_closed(),
                ));
            }

            for &(id, readable, writable) in &ready {
                self.dispatch(id, readable, writable);
            }

            self.drain_commands();
            if self.quit {
                break;
            }
            self.advance_timers();
        }
        debug!("reactor loop leaving");

        // Every remaining client is released here, so on_disconnected fires
        // exactly once no matter how the loop ended.
        let ids: Vec<ClientId> = self.clients.iter().map(|(k, _)| k).collect();
        for id in ids {
            self.release(id);
        }
        self.wheel.clear();

        if let Some(hook) = self.shutdown_hook.take() {
            hook(self);
        }

        *self.loop_thread.lock() = None;
        ok
    }

    fn dispatch(&mut self, id: ClientId, readable: bool, writable: bool) {
        if readable {
            let Some(client) = self.clients.get(id) else { return };
            let link = Rc::clone(&client.link);
            let ret = link.borrow_mut().on_readable(self);
            self.finish_event(id, ret, true);
        }

        if writable {
            let Some(client) = self.clients.get(id) else { return };
            let link = Rc::clone(&client.link);
            let ret = link.borrow_mut().on_writable(self);
            self.finish_event(id, ret, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
