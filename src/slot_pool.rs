//! Bounded pool of reusable write buffers ("slots") that decouples CPU-bound
//! decompression from I/O-bound device writes.
//!
//! The producer (decoder thread) acquires a free slot, fills it, and hands it
//! to the device writer; the writer releases the slot back to the pool only
//! once the bytes are durably accepted, which may happen on a different
//! thread. The pool is the only state shared between the two execution
//! contexts, so a single mutex plus two condvars covers all transitions.
//!
//! All waits are bounded and cancellation-aware: callers retry short-timeout
//! acquires in a loop, re-checking the cancellation flag each iteration.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::cancel::CancelFlag;

/// Poll granularity used by acquire retry loops throughout the pipeline.
/// Bounds cancellation latency to roughly one interval.
pub const ACQUIRE_POLL: Duration = Duration::from_millis(100);

/// A reusable fixed-capacity byte buffer owned by exactly one party at a
/// time: the pool's free list, the producer filling it, or the device-write
/// completion context. Ownership moves by value, so the Free/Filled/InFlight
/// lifecycle is enforced by the type system rather than a state field.
#[derive(Debug)]
pub struct Slot {
    index: usize,
    buf: Vec<u8>,
    len: usize,
}

impl Slot {
    fn new(index: usize, capacity: usize) -> Self {
        Slot { index, buf: vec![0u8; capacity], len: 0 }
    }

    /// Stable identity of this slot within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Valid bytes, set by the producer after filling.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.buf.len());
        self.len = len;
    }

    /// The valid prefix of the buffer.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Full-capacity mutable view for the producer to fill.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Cumulative diagnostic counters. Incremented whenever an acquire call had
/// to wait rather than succeeding immediately; purely for post-hoc
/// performance analysis, never consulted for correctness.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StarvationStats {
    pub producer_stalls: u64,
    pub consumer_stalls: u64,
    pub producer_wait_ms: u64,
    pub consumer_wait_ms: u64,
}

#[derive(Debug)]
struct PoolState {
    free: Vec<Slot>,
    filled: VecDeque<Slot>,
    stats: StarvationStats,
}

/// Fixed-size pool of [`Slot`]s with timeout-bounded blocking acquire,
/// cross-thread release, cancellation, and starvation accounting.
///
/// Memory ceiling is `slot_count * slot_capacity`; slots are allocated once
/// at construction and never reallocated during the session.
#[derive(Debug)]
pub struct SlotPool {
    state: Mutex<PoolState>,
    free_available: Condvar,
    filled_available: Condvar,
    cancel: CancelFlag,
    slot_count: usize,
    slot_capacity: usize,
}

impl SlotPool {
    pub fn new(slot_count: usize, slot_capacity: usize, cancel: CancelFlag) -> Self {
        assert!(slot_count > 0 && slot_capacity > 0);
        let free = (0..slot_count).map(|i| Slot::new(i, slot_capacity)).collect();
        SlotPool {
            state: Mutex::new(PoolState {
                free,
                filled: VecDeque::with_capacity(slot_count),
                stats: StarvationStats::default(),
            }),
            free_available: Condvar::new(),
            filled_available: Condvar::new(),
            cancel,
            slot_count,
            slot_capacity,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    /// Take a free slot for filling, blocking up to `timeout`.
    ///
    /// Returns `None` on timeout or cancellation. Callers are expected to
    /// retry in a loop, re-checking [`CancelFlag::is_cancelled`], so that
    /// backpressure degrades to "wait a bit and try again" under load.
    pub fn acquire_write_slot(&self, timeout: Duration) -> Option<Slot> {
        self.acquire(timeout, Side::Producer)
    }

    /// Pop the oldest filled slot, blocking up to `timeout`. Used by a
    /// pool-draining consumer; FIFO order matches fill order.
    pub fn acquire_read_slot(&self, timeout: Duration) -> Option<Slot> {
        self.acquire(timeout, Side::Consumer)
    }

    /// Queue a filled slot for the consumer side.
    pub fn commit_read_slot(&self, slot: Slot) {
        let mut state = self.state.lock().unwrap();
        state.filled.push_back(slot);
        drop(state);
        self.filled_available.notify_one();
    }

    /// Return a slot to the free list after its bytes were durably written
    /// (or discarded on error). Safe to call from any thread; this is the
    /// asynchronous write-completion path.
    pub fn release_read_slot(&self, mut slot: Slot) {
        slot.len = 0;
        let mut state = self.state.lock().unwrap();
        state.free.push(slot);
        drop(state);
        self.free_available.notify_one();
    }

    /// Set the shared cancellation flag and wake all waiters so pending
    /// acquires return `None` promptly.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.free_available.notify_all();
        self.filled_available.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn starvation_stats(&self) -> StarvationStats {
        self.state.lock().unwrap().stats
    }

    fn acquire(&self, timeout: Duration, side: Side) -> Option<Slot> {
        let mut state = self.state.lock().unwrap();

        if self.cancel.is_cancelled() {
            return None;
        }
        if let Some(slot) = side.take(&mut state) {
            return Some(slot);
        }

        // Could not succeed immediately: one stall, however long we wait.
        side.record_stall(&mut state.stats);
        let start = Instant::now();
        let deadline = start + timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                side.record_wait(&mut state.stats, start.elapsed());
                return None;
            }
            let (next, _timed_out) = {
                let condvar = match side {
                    Side::Producer => &self.free_available,
                    Side::Consumer => &self.filled_available,
                };
                let wait = condvar.wait_timeout(state, deadline - now).unwrap();
                (wait.0, wait.1.timed_out())
            };
            state = next;

            if self.cancel.is_cancelled() {
                side.record_wait(&mut state.stats, start.elapsed());
                return None;
            }
            if let Some(slot) = side.take(&mut state) {
                side.record_wait(&mut state.stats, start.elapsed());
                return Some(slot);
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    Producer,
    Consumer,
}

impl Side {
    fn take(self, state: &mut PoolState) -> Option<Slot> {
        match self {
            Side::Producer => state.free.pop(),
            Side::Consumer => state.filled.pop_front(),
        }
    }

    fn record_stall(self, stats: &mut StarvationStats) {
        match self {
            Side::Producer => stats.producer_stalls += 1,
            Side::Consumer => stats.consumer_stalls += 1,
        }
    }

    fn record_wait(self, stats: &mut StarvationStats, waited: Duration) {
        let ms = waited.as_millis() as u64;
        match self {
            Side::Producer => stats.producer_wait_ms += ms,
            Side::Consumer => stats.consumer_wait_ms += ms,
        }
    }
}
