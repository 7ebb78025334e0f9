//! Cooperative fibers: a per-thread scheduler with explicit yield/resume,
//! private or shared stacks, and a bridge that turns reactor timers into
//! fiber wait points.
//!
//! The scheduler and the reactor compose on one thread: install a scheduler
//! with [`install`], resume fibers from reactor callbacks, and let fibers
//! call [`sleep`] to suspend until a reactor timer resumes them. A fiber is
//! observably suspended from inside the call with no kernel-blocking
//! transition.

pub mod scheduler;
pub mod stack;

use std::rc::Rc;
use std::time::Duration;

use log::warn;

use crate::reactor::{Reactor, ReactorHandle};

pub use scheduler::{CoId, CoStatus, Scheduler, StackMode};
pub use stack::{current_fiber, yield_now, DEFAULT_PRIVATE_STACK, DEFAULT_SHARED_SLOT};

/// The fiber scheduler installed on a reactor thread.
///
/// Stored as reactor-local state so commands and timers running inside the
/// loop can resume fibers.
pub struct FiberRuntime {
    sched: Rc<Scheduler>,
}

impl FiberRuntime {
    pub fn scheduler(&self) -> &Rc<Scheduler> {
        &self.sched
    }
}

/// Install `sched` on `reactor` so loop-side callbacks can resume fibers.
pub fn install(reactor: &mut Reactor, sched: Rc<Scheduler>) {
    reactor.set_local(Rc::new(FiberRuntime { sched }));
}

/// Suspend the calling fiber for at least `duration`.
///
/// `handle` must belong to the reactor driving this thread and the thread's
/// scheduler must have been [`install`]ed on it. The fiber arms a one-shot
/// reactor timer that resumes it, then yields to its resumer; the blocking
/// wait becomes a cooperative wait point.
///
/// # Panics
///
/// Panics when called outside a running fiber.
pub fn sleep(handle: &ReactorHandle, duration: Duration) {
    let id = current_fiber().expect("sleep() called outside a running fiber");

    // Timers need a non-zero period; the callback returning false makes
    // this one-shot regardless.
    let period = duration.max(Duration::from_millis(1));
    handle.register_timer(period, period, move |r: &mut Reactor| {
        match r.local::<FiberRuntime>() {
            Some(rt) => rt.sched.resume(id),
            None => warn!("fiber {id} slept on a reactor with no scheduler installed"),
        }
        false
    });

    yield_now();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
