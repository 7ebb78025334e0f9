//! Bounded timer wheel with millisecond buckets.
//!
//! The wheel is a circular array of 60 000 buckets, one per millisecond,
//! giving a hard horizon of one minute. Inserting past the horizon is an
//! error; callers with longer delays chain their entries in horizon-sized
//! hops (the reactor does this transparently).
//!
//! `advance(now)` drains every bucket between the wheel's origin and `now`
//! into a single fired list, preserving per-bucket insertion order.

/// One minute of 1 ms buckets.
pub const WHEEL_SIZE: u64 = 60 * 1000;

/// Entry scheduled too far into the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PastHorizon;

pub struct TimerWheel<T> {
    buckets: Vec<Vec<T>>,
    /// Earliest time the wheel currently covers, in ms.
    origin: u64,
    /// Bucket index corresponding to `origin`.
    start_idx: u64,
    len: usize,
}

impl<T> TimerWheel<T> {
    pub fn new(now_ms: u64) -> Self {
        let mut buckets = Vec::with_capacity(WHEEL_SIZE as usize);
        buckets.resize_with(WHEEL_SIZE as usize, Vec::new);
        TimerWheel {
            buckets,
            origin: now_ms,
            start_idx: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Schedule `item` to fire `delta_ms` from `now_ms`.
    ///
    /// `delta_ms` of 0 fires on the next `advance`. Deltas at or beyond the
    /// horizon are rejected.
    pub fn schedule(&mut self, now_ms: u64, delta_ms: u64, item: T) -> Result<(), PastHorizon> {
        debug_assert!(now_ms >= self.origin);
        let diff = now_ms - self.origin + delta_ms;
        if diff >= WHEEL_SIZE {
            return Err(PastHorizon);
        }

        let idx = ((self.start_idx + diff) % WHEEL_SIZE) as usize;
        self.buckets[idx].push(item);
        self.len += 1;
        Ok(())
    }

    /// Largest delta accepted at `now_ms`; shrinks as the wheel origin
    /// falls behind between drains.
    pub fn max_delta(&self, now_ms: u64) -> u64 {
        let lag = now_ms.saturating_sub(self.origin);
        (WHEEL_SIZE - 1).saturating_sub(lag)
    }

    /// Drain every entry due at or before `now_ms` into `fired`.
    pub fn advance(&mut self, now_ms: u64, fired: &mut Vec<T>) {
        if now_ms < self.origin {
            return;
        }

        let mut count = now_ms - self.origin + 1;
        if count > WHEEL_SIZE {
            count = WHEEL_SIZE;
        }

        for i in 0..count {
            let idx = ((self.start_idx + i) % WHEEL_SIZE) as usize;
            let bucket = &mut self.buckets[idx];
            self.len -= bucket.len();
            fired.append(bucket);
        }

        self.origin = now_ms;
        self.start_idx = (self.start_idx + count - 1) % WHEEL_SIZE;
    }

    /// Remove everything without firing.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.len = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
