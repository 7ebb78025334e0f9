//! Per-thread cooperative scheduler.
//!
//! A [`Scheduler`] owns a table of fibers addressed by compact integer ids,
//! a call stack of in-flight resumes (bottom is the thread's root context),
//! and optionally a shared-stack arena. Exactly one fiber runs at a time;
//! [`yield_now`](super::yield_now) suspends it and returns control to
//! whatever context most recently resumed it.
//!
//! Fibers never migrate between threads. The scheduler itself is `!Send`
//! and meant to live on the thread that created it.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use log::trace;

use super::stack::{
    ArenaStack, SaveBuf, StackArena, CURRENT_ANCHOR, CURRENT_RUNNING, CURRENT_YIELDER,
    DEFAULT_PRIVATE_STACK, DEFAULT_SHARED_SLOT,
};

/// Compact fiber id; ids are dense and reused once a fiber is dead.
pub type CoId = usize;

/// Initial fiber table capacity; the table doubles when full.
const DEFAULT_TABLE: usize = 16;

/// Maximum depth of nested resumes (the thread root is implicit below).
const MAX_NESTING: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoStatus {
    /// Spawned and runnable, never run yet.
    Ready,
    /// Currently executing on this thread.
    Running,
    /// Yielded; waiting for the next resume.
    Suspend,
    /// Finished, or never existed. Dead ids may be reused.
    Dead,
}

/// How fibers get their stacks.
#[derive(Debug, Clone, Copy)]
pub enum StackMode {
    /// Every fiber owns a fixed-size stack.
    Private { stack_size: usize },
    /// Fibers share `slots` arena slots, copying their used bytes out on
    /// suspend and back in before resuming.
    Shared { slots: usize, slot_size: usize },
}

impl Default for StackMode {
    fn default() -> Self {
        StackMode::Private { stack_size: DEFAULT_PRIVATE_STACK }
    }
}

impl StackMode {
    /// Shared mode with default slot sizing.
    pub fn shared(slots: usize) -> Self {
        StackMode::Shared { slots, slot_size: DEFAULT_SHARED_SLOT }
    }
}

// ---------------------------------------------------------------------------
// Fiber slots
// ---------------------------------------------------------------------------

enum RawFiber {
    Private(Coroutine<(), (), (), DefaultStack>),
    Shared(Coroutine<(), (), (), ArenaStack>),
}

impl RawFiber {
    /// Run the fiber until it yields (`true`) or returns (`false`).
    fn resume(&mut self) -> bool {
        let result = match self {
            RawFiber::Private(c) => c.resume(()),
            RawFiber::Shared(c) => c.resume(()),
        };
        matches!(result, CoroutineResult::Yield(()))
    }
}

struct FiberSlot {
    raw: Option<RawFiber>,
    status: CoStatus,
    /// Arena slot index; meaningful in shared mode only.
    arena_slot: usize,
    /// Stack bytes copied out at the latest suspension (shared mode only).
    save: Option<SaveBuf>,
}

struct Inner {
    table: Vec<Option<FiberSlot>>,
    live: usize,
    call_stack: Vec<CoId>,
    arena: Option<StackArena>,
    mode: StackMode,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    inner: RefCell<Inner>,
}

impl Scheduler {
    pub fn new(mode: StackMode) -> Scheduler {
        let arena = match mode {
            StackMode::Private { .. } => None,
            StackMode::Shared { slots, slot_size } => Some(StackArena::new(slots, slot_size)),
        };

        Scheduler {
            inner: RefCell::new(Inner {
                table: (0..DEFAULT_TABLE).map(|_| None).collect(),
                live: 0,
                call_stack: Vec::with_capacity(MAX_NESTING),
                arena,
                mode,
            }),
        }
    }

    /// Number of fibers that are not dead.
    pub fn live_count(&self) -> usize {
        self.inner.borrow().live
    }

    /// The id of the fiber currently running under this scheduler.
    pub fn running(&self) -> Option<CoId> {
        self.inner.borrow().call_stack.last().copied()
    }

    /// Status of `id`; empty and never-allocated slots report `Dead`.
    pub fn status(&self, id: CoId) -> CoStatus {
        let inner = self.inner.borrow();
        match inner.table.get(id) {
            Some(Some(slot)) => slot.status,
            _ => CoStatus::Dead,
        }
    }

    /// Create a fiber that will run `entry` on its first resume.
    ///
    /// Returns a compact id, never reusing one held by a live fiber. The
    /// table doubles when full.
    pub fn spawn<F>(&self, entry: F) -> CoId
    where
        F: FnOnce() + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let id = inner.find_free_id();

        let arena_slot = match inner.mode {
            StackMode::Private { .. } => 0,
            StackMode::Shared { .. } => {
                inner.arena.as_mut().expect("shared mode has an arena").assign()
            }
        };

        let body = move |yielder: &Yielder<(), ()>, _input: ()| {
            // Install the yielder so yield_now() can reach it.
            CURRENT_YIELDER.with(|c| {
                c.set(Some(yielder as *const Yielder<(), ()> as *const ()));
            });
            entry();
        };

        let raw = match inner.mode {
            StackMode::Private { stack_size } => {
                let stack =
                    DefaultStack::new(stack_size).expect("failed to allocate fiber stack");
                RawFiber::Private(Coroutine::with_stack(stack, body))
            }
            StackMode::Shared { .. } => {
                let stack = inner
                    .arena
                    .as_ref()
                    .expect("shared mode has an arena")
                    .handle(arena_slot);
                RawFiber::Shared(Coroutine::with_stack(stack, body))
            }
        };

        inner.table[id] = Some(FiberSlot {
            raw: Some(raw),
            status: CoStatus::Ready,
            arena_slot,
            save: None,
        });
        inner.live += 1;
        trace!("fiber {id} spawned ({} live)", inner.live);
        id
    }

    /// Run fiber `id` until it yields or finishes.
    ///
    /// Resuming an empty slot is silently ignored. Resuming the fiber that
    /// is already running is a programming error and panics.
    pub fn resume(&self, id: CoId) {
        let mut raw = {
            let mut inner = self.inner.borrow_mut();

            let slot = match inner.table.get_mut(id) {
                Some(Some(slot)) => slot,
                _ => {
                    trace!("resume of dead fiber {id} ignored");
                    return;
                }
            };

            match slot.status {
                CoStatus::Running => panic!("fiber {id} is already running"),
                CoStatus::Ready | CoStatus::Suspend => {}
                CoStatus::Dead => unreachable!("dead fibers have no slot"),
            }

            assert!(inner.call_stack.len() < MAX_NESTING, "fiber resume nesting too deep");

            inner.prepare_stack(id);

            let slot = inner.table[id].as_mut().expect("slot checked above");
            slot.status = CoStatus::Running;
            let raw = slot.raw.take().expect("idle fiber holds its coroutine");
            inner.call_stack.push(id);
            raw
        };

        // Save the resumer's thread-local context; the fiber installs its
        // own and we put the resumer's back afterwards so nesting works.
        let prev_yielder = CURRENT_YIELDER.with(|c| c.take());
        let prev_running = CURRENT_RUNNING.with(|c| c.replace(Some(id)));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| raw.resume()));

        CURRENT_YIELDER.with(|c| c.set(prev_yielder));
        CURRENT_RUNNING.with(|c| c.set(prev_running));

        let mut inner = self.inner.borrow_mut();
        let popped = inner.call_stack.pop();
        debug_assert_eq!(popped, Some(id));

        match outcome {
            Ok(true) => {
                // Yielded; capture shared-slot bytes while they are intact.
                let anchor = CURRENT_ANCHOR.with(|a| a.get());
                let save = inner.arena.as_ref().and_then(|arena| {
                    let slot = inner.table[id].as_ref().expect("fiber yielded");
                    if matches!(inner.mode, StackMode::Shared { .. }) {
                        Some(arena.save(slot.arena_slot, anchor))
                    } else {
                        None
                    }
                });

                let slot = inner.table[id].as_mut().expect("fiber yielded");
                slot.raw = Some(raw);
                slot.status = CoStatus::Suspend;
                slot.save = save;
            }
            Ok(false) => {
                // Entry returned; the fiber is dead and its id reusable.
                inner.reclaim(id);
                trace!("fiber {id} finished ({} live)", inner.live);
            }
            Err(payload) => {
                inner.reclaim(id);
                drop(inner);
                panic::resume_unwind(payload);
            }
        }
    }
}

impl Inner {
    /// Find a free id, scanning from the live count the way dense tables
    /// stay dense, doubling the table when every slot is taken.
    fn find_free_id(&mut self) -> CoId {
        let cap = self.table.len();
        if self.live >= cap {
            let id = cap;
            self.table.resize_with(cap * 2, || None);
            return id;
        }

        for i in 0..cap {
            let id = (self.live + i) % cap;
            if self.table[id].is_none() {
                return id;
            }
        }
        unreachable!("live < capacity implies a free slot");
    }

    /// Make `id`'s arena slot hold `id`'s bytes before it runs.
    fn prepare_stack(&mut self, id: CoId) {
        let Some(arena) = self.arena.as_mut() else { return };

        let (arena_slot, save) = {
            let slot = self.table[id].as_mut().expect("caller verified the slot");
            (slot.arena_slot, slot.save.take())
        };

        // Resuming onto a slot whose occupant is mid-resume would overwrite
        // the live frames the resumer is executing on.
        assert!(
            !self.call_stack.iter().any(|&c| {
                self.table[c]
                    .as_ref()
                    .map(|s| s.arena_slot == arena_slot)
                    .unwrap_or(false)
            }),
            "cannot resume fiber {id}: its shared stack slot is active in the resume chain"
        );

        if arena.owner(arena_slot) != Some(id) {
            // The previous occupant is suspended and already saved; its
            // bytes on the slot are disposable.
            if let Some(save) = &save {
                arena.restore(arena_slot, save);
            }
            arena.set_owner(arena_slot, Some(id));
        }
    }

    fn reclaim(&mut self, id: CoId) {
        self.table[id] = None;
        self.live -= 1;
        // Release slot ownership held by the dead fiber.
        if let Some(arena) = self.arena.as_mut() {
            for s in 0..arena.slot_count() {
                if arena.owner(s) == Some(id) {
                    arena.set_owner(s, None);
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Destroy surviving fibers. Each one is unwound on its own stack;
        // shared-slot fibers get their bytes restored first so destructors
        // run over valid frames.
        for id in 0..self.table.len() {
            let Some(mut slot) = self.table[id].take() else { continue };
            if let Some(arena) = self.arena.as_mut() {
                if arena.owner(slot.arena_slot) != Some(id) {
                    if let Some(save) = slot.save.take() {
                        arena.restore(slot.arena_slot, &save);
                    }
                    arena.set_owner(slot.arena_slot, Some(id));
                }
            }
            drop(slot.raw);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::yield_now;
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_runs_to_completion() {
        let sched = Scheduler::new(StackMode::default());
        let hits = Rc::new(RefCell::new(0));
        let h = Rc::clone(&hits);

        let id = sched.spawn(move || {
            *h.borrow_mut() += 1;
        });
        assert_eq!(sched.status(id), CoStatus::Ready);
        assert_eq!(sched.live_count(), 1);

        sched.resume(id);
        assert_eq!(*hits.borrow(), 1);
        assert_eq!(sched.status(id), CoStatus::Dead);
        assert_eq!(sched.live_count(), 0);
    }

    #[test]
    fn test_yield_and_resume() {
        let sched = Scheduler::new(StackMode::default());
        let steps = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&steps);

        let id = sched.spawn(move || {
            s.borrow_mut().push(1);
            yield_now();
            s.borrow_mut().push(2);
        });

        sched.resume(id);
        assert_eq!(sched.status(id), CoStatus::Suspend);
        assert_eq!(*steps.borrow(), vec![1]);

        sched.resume(id);
        assert_eq!(sched.status(id), CoStatus::Dead);
        assert_eq!(*steps.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_interleaved_yields() {
        // Two fibers each loop five times; alternating resumes interleave
        // them strictly.
        let sched = Scheduler::new(StackMode::default());
        let log = Rc::new(RefCell::new(Vec::new()));

        let mk = |tag: char, log: Rc<RefCell<Vec<String>>>| {
            move || {
                for i in 0..5 {
                    log.borrow_mut().push(format!("{tag}{i}"));
                    yield_now();
                }
            }
        };
        let a = sched.spawn(mk('A', Rc::clone(&log)));
        let b = sched.spawn(mk('B', Rc::clone(&log)));

        while sched.status(a) != CoStatus::Dead || sched.status(b) != CoStatus::Dead {
            sched.resume(a);
            sched.resume(b);
        }

        assert_eq!(
            *log.borrow(),
            vec!["A0", "B0", "A1", "B1", "A2", "B2", "A3", "B3", "A4", "B4"]
        );
    }

    #[test]
    fn test_status_of_unknown_id_is_dead() {
        let sched = Scheduler::new(StackMode::default());
        assert_eq!(sched.status(0), CoStatus::Dead);
        assert_eq!(sched.status(12345), CoStatus::Dead);
    }

    #[test]
    fn test_resume_of_dead_id_is_ignored() {
        let sched = Scheduler::new(StackMode::default());
        let id = sched.spawn(|| {});
        sched.resume(id);
        // Dead now; both of these are no-ops.
        sched.resume(id);
        sched.resume(999);
    }

    #[test]
    fn test_running_tracks_the_top() {
        let sched = Rc::new(Scheduler::new(StackMode::default()));
        assert_eq!(sched.running(), None);

        let observed = Rc::new(RefCell::new(None));
        let o = Rc::clone(&observed);
        let id = sched.spawn(move || {
            *o.borrow_mut() = super::super::current_fiber();
        });
        sched.resume(id);
        assert_eq!(*observed.borrow(), Some(id));
        assert_eq!(sched.running(), None);
    }

    #[test]
    fn test_id_table_growth() {
        // Create 2k + 1 fibers where k is the initial capacity; the table
        // must double (twice) and stay functional.
        let sched = Scheduler::new(StackMode::default());
        let n = 2 * DEFAULT_TABLE + 1;
        let counter = Rc::new(RefCell::new(0));

        let ids: Vec<CoId> = (0..n)
            .map(|_| {
                let c = Rc::clone(&counter);
                sched.spawn(move || *c.borrow_mut() += 1)
            })
            .collect();

        assert_eq!(sched.live_count(), n);
        assert!(ids[n - 1] >= DEFAULT_TABLE);
        // Ids are unique while live.
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), n);

        for id in ids {
            sched.resume(id);
        }
        assert_eq!(*counter.borrow(), n);
        assert_eq!(sched.live_count(), 0);
    }

    #[test]
    fn test_ids_reused_after_death() {
        let sched = Scheduler::new(StackMode::default());
        let a = sched.spawn(|| {});
        sched.resume(a);
        assert_eq!(sched.status(a), CoStatus::Dead);

        // With a dead and the scan starting at the live count, the next
        // spawn may land on the freed id.
        let ids: Vec<CoId> = (0..DEFAULT_TABLE).map(|_| sched.spawn(|| {})).collect();
        assert!(ids.contains(&a));
    }

    #[test]
    fn test_nested_resume_returns_to_resumer() {
        let sched = Rc::new(Scheduler::new(StackMode::default()));
        let log = Rc::new(RefCell::new(Vec::new()));

        let inner_log = Rc::clone(&log);
        let inner = sched.spawn(move || {
            inner_log.borrow_mut().push("inner-start");
            yield_now();
            inner_log.borrow_mut().push("inner-end");
        });

        let outer_log = Rc::clone(&log);
        let outer_sched = Rc::clone(&sched);
        let outer = sched.spawn(move || {
            outer_log.borrow_mut().push("outer-start");
            outer_sched.resume(inner);
            // Inner yielded; control came back here, not to the root.
            outer_log.borrow_mut().push("outer-mid");
            yield_now();
            outer_log.borrow_mut().push("outer-end");
        });

        sched.resume(outer);
        assert_eq!(*log.borrow(), vec!["outer-start", "inner-start", "outer-mid"]);

        sched.resume(inner);
        sched.resume(outer);
        assert_eq!(
            *log.borrow(),
            vec!["outer-start", "inner-start", "outer-mid", "inner-end", "outer-end"]
        );
    }

    #[test]
    fn test_shared_stack_pattern_integrity() {
        // Two fibers pinned to the same arena slot, each with a 1 KiB local
        // buffer carrying a distinct pattern; alternate yields 1000 times
        // and verify the pattern after every resume.
        let sched = Scheduler::new(StackMode::Shared { slots: 1, slot_size: 64 * 1024 });

        let mk = |seed: u8| {
            move || {
                let mut local = [0u8; 1024];
                for (i, b) in local.iter_mut().enumerate() {
                    *b = seed.wrapping_add(i as u8);
                }
                for _ in 0..1000 {
                    yield_now();
                    for (i, b) in local.iter().enumerate() {
                        assert_eq!(*b, seed.wrapping_add(i as u8), "stack bytes corrupted");
                    }
                }
            }
        };

        let a = sched.spawn(mk(0x11));
        let b = sched.spawn(mk(0x77));

        while sched.status(a) != CoStatus::Dead || sched.status(b) != CoStatus::Dead {
            sched.resume(a);
            sched.resume(b);
        }
        assert_eq!(sched.live_count(), 0);
    }

    #[test]
    fn test_shared_stack_many_fibers_few_slots() {
        let sched = Scheduler::new(StackMode::shared(2));
        let counter = Rc::new(RefCell::new(0));

        let ids: Vec<CoId> = (0..20)
            .map(|i| {
                let c = Rc::clone(&counter);
                sched.spawn(move || {
                    let mine = [i as u8; 256];
                    yield_now();
                    assert!(mine.iter().all(|&b| b == i as u8));
                    *c.borrow_mut() += 1;
                })
            })
            .collect();

        for &id in &ids {
            sched.resume(id);
        }
        for &id in &ids {
            sched.resume(id);
        }
        assert_eq!(*counter.borrow(), 20);
    }

    #[test]
    fn test_drop_with_live_fibers() {
        // Dropping the scheduler unwinds survivors; destructors run.
        struct Tally(Rc<RefCell<u32>>);
        impl Drop for Tally {
            fn drop(&mut self) {
                *self.0.borrow_mut() += 1;
            }
        }

        let drops = Rc::new(RefCell::new(0));
        {
            let sched = Scheduler::new(StackMode::shared(1));
            for _ in 0..3 {
                let t = Tally(Rc::clone(&drops));
                let id = sched.spawn(move || {
                    let _keep = t;
                    yield_now();
                });
                sched.resume(id);
            }
            assert_eq!(sched.live_count(), 3);
        }
        assert_eq!(*drops.borrow(), 3);
    }

    #[test]
    fn test_resume_running_fiber_panics() {
        let sched = Rc::new(Scheduler::new(StackMode::default()));
        let s = Rc::clone(&sched);
        let id = sched.spawn(move || {
            // Self-resume must panic.
            let running = super::super::current_fiber().unwrap();
            s.resume(running);
        });

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| sched.resume(id)));
        assert!(result.is_err());
    }

    #[test]
    fn test_panicking_fiber_is_reclaimed() {
        let sched = Scheduler::new(StackMode::default());
        let id = sched.spawn(|| panic!("boom"));
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| sched.resume(id)));
        assert!(result.is_err());
        assert_eq!(sched.status(id), CoStatus::Dead);
        assert_eq!(sched.live_count(), 0);
    }
}
