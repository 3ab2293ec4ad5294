//! Completion tracking
//!
//! The hardware exposes a 32-bit count of finished jobs per instance. The
//! host extends it to 64 bits by counting wraparounds, and keeps its own
//! count of jobs already waited on. A wait succeeds once the hardware count
//! is ahead of the waited count; jobs complete in submission order, so no
//! per-job identity is needed.
//!
//! One [`InstanceTracker`] per instance pairs the state with a condition
//! variable. The interrupt handler (or the polling loop) is the only writer
//! of the finished count; the waiter is the only writer of the waited count.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Extends the 32-bit hardware completion counter to 64 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionCounter {
    base_multiplier: u32,
    prev_count: u32,
}

impl CompletionCounter {
    /// Counter seeded with the current raw register value
    pub const fn new(raw: u32) -> Self {
        Self {
            base_multiplier: 0,
            prev_count: raw,
        }
    }

    /// Fold in a new raw reading, returning the 64-bit finished count
    ///
    /// A reading below the previous one is taken as exactly one wrap. Each
    /// wrap from `u32::MAX` to 0 is itself one finished job, hence the extra
    /// `+ multiplier`.
    pub fn update(&mut self, raw: u32) -> u64 {
        if raw < self.prev_count {
            self.base_multiplier = self.base_multiplier.wrapping_add(1);
        }
        self.prev_count = raw;
        self.value()
    }

    /// 64-bit finished count for the last reading
    pub const fn value(&self) -> u64 {
        let m = self.base_multiplier as u64;
        (m << 32) + self.prev_count as u64 + m
    }

    /// Wraparounds seen so far
    pub const fn wraps(&self) -> u32 {
        self.base_multiplier
    }
}

/// Per-instance completion state, guarded by [`InstanceTracker`]
#[derive(Debug, Clone)]
pub struct TrackerState {
    /// Wraparound tracking for the hardware counter
    pub counter: CompletionCounter,
    /// Jobs the hardware reports finished (64-bit)
    pub jobs_finished: u64,
    /// Jobs the host has waited on
    pub jobs_waited: u64,
    /// Finished count when the device was opened
    pub baseline: u64,
    /// Last descriptor-diagnostics reading
    pub desc_diagnostics: u32,
}

impl TrackerState {
    /// Record a raw counter and diagnostics reading
    pub fn record(&mut self, raw_count: u32, desc_diagnostics: u32) {
        self.jobs_finished = self.counter.update(raw_count);
        self.desc_diagnostics = desc_diagnostics;
    }

    /// Whether a finished job is waiting to be claimed
    pub const fn has_unclaimed(&self) -> bool {
        self.jobs_finished > self.jobs_waited
    }
}

/// Completion state and wakeup for one instance
#[derive(Debug)]
pub struct InstanceTracker {
    state: Mutex<TrackerState>,
    ready: Condvar,
}

impl InstanceTracker {
    /// Tracker seeded from the raw counter read at open
    ///
    /// Jobs that finished before open count as already waited on.
    pub fn new(raw_count: u32) -> Self {
        let counter = CompletionCounter::new(raw_count);
        let finished = counter.value();
        Self {
            state: Mutex::new(TrackerState {
                counter,
                jobs_finished: finished,
                jobs_waited: finished,
                baseline: finished,
                desc_diagnostics: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Lock the state
    pub fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a reading and wake every waiter
    pub fn record(&self, raw_count: u32, desc_diagnostics: u32) {
        self.lock().record(raw_count, desc_diagnostics);
        self.ready.notify_all();
    }

    /// Block until notified or `timeout` elapses
    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, TrackerState>,
        timeout: Duration,
    ) -> MutexGuard<'a, TrackerState> {
        match self.ready.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Snapshot of the state
    pub fn snapshot(&self) -> TrackerState {
        self.lock().clone()
    }
}
