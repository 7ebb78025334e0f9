//! 64-bit channel handles for server-level connection identity.
//!
//! A channel names a connection at the server layer and, for outgoing
//! connections, keeps naming it across reconnects. The encoding makes
//! routing free of any global lookup:
//!
//! - Bit 63 distinguishes outgoing (1) from incoming (0) connections.
//! - The low 63 bits are allocated per reactor slot: slot `s` of `n` hands
//!   out `s + n`, `s + 2n`, `s + 3n`, ... so that `value % n` recovers the
//!   owning slot with a single modulus, for the whole life of the handle.
//!
//! `Channel::INVALID` (0) is reserved and never allocated.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const OUTGOING_BIT: u64 = 1 << 63;

/// Opaque handle for a server-level connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(u64);

impl Channel {
    /// The reserved invalid handle.
    pub const INVALID: Channel = Channel(0);

    /// Reconstruct a channel from its raw value.
    pub fn from_raw(raw: u64) -> Self {
        Channel(raw)
    }

    /// The raw 64-bit value.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// A valid channel is anything but `INVALID`.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Whether bit 63 marks this as an outgoing connection.
    pub fn is_outgoing(self) -> bool {
        self.0 & OUTGOING_BIT != 0
    }

    /// The reactor slot owning this channel, stable for its lifetime.
    pub fn slot(self, slot_count: usize) -> usize {
        debug_assert!(slot_count > 0);
        ((self.0 & !OUTGOING_BIT) % slot_count as u64) as usize
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_outgoing() {
            write!(f, "Channel(out:{})", self.0 & !OUTGOING_BIT)
        } else {
            write!(f, "Channel(in:{})", self.0)
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Per-slot channel allocator.
///
/// Seeded at the slot index and stepped by the slot count, so every handle
/// it produces maps back to its slot by modulus. The counter is shared
/// between the accept path (reactor thread) and the connect path (any
/// thread), hence atomic.
pub struct ChannelAllocator {
    next: AtomicU64,
    step: u64,
}

impl ChannelAllocator {
    pub fn new(slot: usize, slot_count: usize) -> Self {
        assert!(slot < slot_count);
        ChannelAllocator {
            next: AtomicU64::new(slot as u64),
            step: slot_count as u64,
        }
    }

    /// Allocate the next handle for this slot.
    pub fn allocate(&self, outgoing: bool) -> Channel {
        let value = self.next.fetch_add(self.step, Ordering::Relaxed) + self.step;
        if outgoing {
            Channel(value | OUTGOING_BIT)
        } else {
            Channel(value)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_channel() {
        assert!(!Channel::INVALID.is_valid());
        assert!(Channel::from_raw(1).is_valid());
    }

    #[test]
    fn test_outgoing_bit() {
        let alloc = ChannelAllocator::new(0, 1);
        let incoming = alloc.allocate(false);
        let outgoing = alloc.allocate(true);
        assert!(!incoming.is_outgoing());
        assert!(outgoing.is_outgoing());
    }

    #[test]
    fn test_slot_stable_under_modulus() {
        let slots = 4;
        for slot in 0..slots {
            let alloc = ChannelAllocator::new(slot, slots);
            for _ in 0..100 {
                let ch = alloc.allocate(false);
                assert_eq!(ch.slot(slots), slot);
                let out = alloc.allocate(true);
                assert_eq!(out.slot(slots), slot, "outgoing bit must not affect routing");
            }
        }
    }

    #[test]
    fn test_never_allocates_invalid() {
        // Slot 0 starts at 0 but the first handle is 0 + step.
        let alloc = ChannelAllocator::new(0, 3);
        let first = alloc.allocate(false);
        assert!(first.is_valid());
        assert_eq!(first.raw(), 3);
    }

    #[test]
    fn test_handles_unique_across_threads() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let alloc = Arc::new(ChannelAllocator::new(1, 2));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || {
                    (0..1000).map(|_| alloc.allocate(true).raw()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for raw in h.join().unwrap() {
                assert!(seen.insert(raw), "duplicate channel {raw:#x}");
            }
        }
    }
}
