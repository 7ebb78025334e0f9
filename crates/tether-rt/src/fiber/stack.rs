//! Stack management for fibers: private stacks, the shared-stack arena, and
//! the copy-out/copy-in save buffers used when several fibers take turns on
//! one arena slot.
//!
//! A shared arena slot holds the live stack of at most one fiber at a time.
//! When a fiber suspends, the scheduler copies the used region (its stack
//! pointer at yield time up to the slot base) into the fiber's own save
//! buffer; before a different fiber resumes on the same slot, its saved
//! bytes are copied back to the exact addresses they came from. This caps
//! memory for huge fiber counts at the aggregate peak of *live* stacks
//! instead of `fibers x stack_size`.
//!
//! ## Thread-local state
//!
//! - `CURRENT_YIELDER`: pointer to the running fiber's corosensei yielder,
//!   installed around every resume so [`yield_now`] can suspend.
//! - `CURRENT_RUNNING`: the running fiber's id, for reactor bridges.
//! - `CURRENT_ANCHOR`: the fiber's approximate stack pointer at its latest
//!   yield, recorded just before suspending so the scheduler knows how much
//!   of the arena slot to save.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;

use corosensei::stack::{Stack, StackPointer};
use corosensei::Yielder;

/// Default private stack size (64 KiB): virtual memory lazy-commits pages,
/// so large fiber counts stay cheap.
pub const DEFAULT_PRIVATE_STACK: usize = 64 * 1024;

/// Default shared arena slot size (128 KiB).
pub const DEFAULT_SHARED_SLOT: usize = 128 * 1024;

/// Margin below the recorded yield anchor that is always saved along with
/// the visible frames. The context switch spills registers onto the fiber
/// stack below the anchor; this covers them with room to spare.
pub const SAVE_SLACK: usize = 4096;

thread_local! {
    /// Type-erased pointer to the running fiber's `Yielder<(), ()>`.
    ///
    /// Valid only while that fiber is running; the scheduler saves and
    /// restores it around every resume so nesting works.
    pub(crate) static CURRENT_YIELDER: Cell<Option<*const ()>> = const { Cell::new(None) };

    /// Id of the fiber currently running on this thread.
    pub(crate) static CURRENT_RUNNING: Cell<Option<usize>> = const { Cell::new(None) };

    /// Stack address recorded inside [`yield_now`] right before suspension.
    pub(crate) static CURRENT_ANCHOR: Cell<usize> = const { Cell::new(0) };
}

/// Id of the fiber running on this thread, if any.
pub fn current_fiber() -> Option<usize> {
    CURRENT_RUNNING.with(|c| c.get())
}

/// Suspend the running fiber and return control to its resumer.
///
/// # Panics
///
/// Panics when called outside a running fiber; yielding from the thread's
/// root context is a programming error.
pub fn yield_now() {
    CURRENT_YIELDER.with(|c| {
        let ptr = c
            .get()
            .expect("yield_now() called outside a running fiber");

        // Record where the stack currently ends so the scheduler can bound
        // the shared-slot save. The probe lives above everything the
        // suspension itself will push.
        let probe: u8 = 0;
        CURRENT_ANCHOR.with(|a| a.set(&probe as *const u8 as usize));

        // Safety: the pointer was installed by the fiber body currently on
        // this thread; the yielder it refers to outlives this resume.
        let yielder: &Yielder<(), ()> = unsafe { &*(ptr as *const Yielder<(), ()>) };
        yielder.suspend(());

        // Another fiber may have run on this thread in between; reinstall.
        c.set(Some(ptr));
    });
}

// ---------------------------------------------------------------------------
// Arena slots
// ---------------------------------------------------------------------------

/// One contiguous stack region inside the shared arena.
///
/// Unlike mmap'd private stacks there is no guard page: a fiber overflowing
/// its slot corrupts the neighbouring slot. Slot sizes should leave
/// comfortable headroom.
pub(crate) struct SlotBuf {
    ptr: NonNull<u8>,
    size: usize,
}

impl SlotBuf {
    fn new(size: usize) -> Rc<SlotBuf> {
        // Keep the base 16-aligned for the context-switch ABI.
        let size = (size + 15) & !15;
        let layout = Layout::from_size_align(size, 16).expect("bad arena slot layout");
        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).expect("failed to allocate arena slot");
        Rc::new(SlotBuf { ptr, size })
    }

    /// Highest address (stacks grow down from here).
    pub(crate) fn base(&self) -> usize {
        self.ptr.as_ptr() as usize + self.size
    }

    /// Lowest usable address.
    pub(crate) fn limit(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl Drop for SlotBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, 16).expect("bad arena slot layout");
        unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

/// A corosensei-compatible stack handle pointing into an arena slot.
///
/// Several fibers may hold handles to the same slot; the scheduler
/// guarantees only one of them has live bytes on it at a time.
pub(crate) struct ArenaStack {
    buf: Rc<SlotBuf>,
}

unsafe impl Stack for ArenaStack {
    fn base(&self) -> StackPointer {
        StackPointer::new(self.buf.base()).expect("arena slot at null")
    }

    fn limit(&self) -> StackPointer {
        StackPointer::new(self.buf.limit()).expect("arena slot at null")
    }

    #[cfg(windows)]
    fn teb_fields(&self) -> corosensei::stack::StackTebFields {
        unimplemented!("shared arena stacks are not supported on Windows")
    }

    #[cfg(windows)]
    fn update_teb_fields(&mut self, _stack_limit: usize, _guaranteed_stack_bytes: usize) {}
}

/// The scheduler-owned arena: a fixed set of slots handed out round-robin
/// at fiber creation, plus the record of which fiber's bytes currently sit
/// on each slot.
pub(crate) struct StackArena {
    slots: Vec<Rc<SlotBuf>>,
    owners: Vec<Option<usize>>,
    alloc_idx: usize,
}

impl StackArena {
    pub(crate) fn new(count: usize, slot_size: usize) -> StackArena {
        assert!(count > 0, "shared arena needs at least one slot");
        StackArena {
            slots: (0..count).map(|_| SlotBuf::new(slot_size)).collect(),
            owners: vec![None; count],
            alloc_idx: 0,
        }
    }

    /// Assign the next slot round-robin, the way fibers are pinned at
    /// creation time.
    pub(crate) fn assign(&mut self) -> usize {
        let idx = self.alloc_idx % self.slots.len();
        self.alloc_idx += 1;
        idx
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn owner(&self, slot: usize) -> Option<usize> {
        self.owners[slot]
    }

    pub(crate) fn set_owner(&mut self, slot: usize, owner: Option<usize>) {
        self.owners[slot] = owner;
    }

    pub(crate) fn handle(&self, slot: usize) -> ArenaStack {
        ArenaStack { buf: Rc::clone(&self.slots[slot]) }
    }

    /// Copy the used region of `slot` out into a save buffer.
    ///
    /// `anchor` is the suspended fiber's stack address recorded at yield
    /// time; the save extends [`SAVE_SLACK`] below it to cover the switch
    /// frame.
    pub(crate) fn save(&self, slot: usize, anchor: usize) -> SaveBuf {
        let buf = &self.slots[slot];
        let base = buf.base();
        let limit = buf.limit();
        debug_assert!(anchor > limit && anchor <= base, "yield anchor escaped its slot");

        let from = anchor.saturating_sub(SAVE_SLACK).max(limit);
        let len = base - from;
        let mut bytes = vec![0u8; len];
        // Safety: [from, base) lies inside this slot's allocation and no
        // fiber is executing on it (the owner just suspended).
        unsafe {
            std::ptr::copy_nonoverlapping(from as *const u8, bytes.as_mut_ptr(), len);
        }
        SaveBuf { bytes, from }
    }

    /// Copy a save buffer back onto its slot, at the addresses it came from.
    pub(crate) fn restore(&self, slot: usize, save: &SaveBuf) {
        let buf = &self.slots[slot];
        debug_assert!(save.from >= buf.limit() && save.from + save.bytes.len() <= buf.base());
        // Safety: the target range is inside the slot and nothing is
        // executing on it; the previous occupant's bytes were saved at its
        // own suspension.
        unsafe {
            std::ptr::copy_nonoverlapping(save.bytes.as_ptr(), save.from as *mut u8, save.bytes.len());
        }
    }
}

/// The bytes a suspended fiber had on its arena slot, plus where they go
/// back.
pub(crate) struct SaveBuf {
    bytes: Vec<u8>,
    from: usize,
}

impl SaveBuf {
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
