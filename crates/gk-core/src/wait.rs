// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Suspend/resume bookkeeping for guest threads
//!
//! A blocking call never parks the host thread. It records a start time on
//! the guest thread, arms a timer and hands control back to the scheduler,
//! which re-invokes the call when a descriptor notifies the thread or the
//! timer expires.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::ThreadId;

/// Millisecond clock relative to emulator start
pub trait Clock: Send + Sync {
    fn millis_since_start(&self) -> u64;
}

#[derive(Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn millis_since_start(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Clock advanced explicitly; used by deterministic schedulers and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn millis_since_start(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitPhase {
    /// First invocation of a blocking call
    Fresh,
    /// Re-invoked after having been parked at `start_ms`
    Waiting { start_ms: u64 },
}

/// Per-thread wait deadline; zero means not waiting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitState {
    start_ms: u64,
}

impl WaitState {
    pub fn phase(&self) -> WaitPhase {
        match self.start_ms {
            0 => WaitPhase::Fresh,
            start_ms => WaitPhase::Waiting { start_ms },
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.start_ms != 0
    }

    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }

    /// Enter WAITING. A clock reading of zero is bumped so it is not
    /// mistaken for "not waiting".
    pub fn begin(&mut self, now_ms: u64) -> u64 {
        self.start_ms = now_ms.max(1);
        self.start_ms
    }

    pub fn clear(&mut self) {
        self.start_ms = 0;
    }
}

/// Guest thread state the readiness layer reads and writes
#[derive(Debug)]
pub struct GuestThread {
    pub id: ThreadId,
    pub interrupted: bool,
    pub in_signal: bool,
    pub wait: WaitState,
}

impl GuestThread {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            interrupted: false,
            in_signal: false,
            wait: WaitState::default(),
        }
    }

    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }

    /// Consume a pending interrupt. Interrupts stay pending while a signal
    /// handler runs.
    pub fn take_interrupt(&mut self) -> bool {
        if self.in_signal || !self.interrupted {
            return false;
        }
        self.interrupted = false;
        true
    }
}

/// Timer registrations, at most one per thread
#[derive(Debug, Default)]
pub struct TimerQueue {
    by_thread: HashMap<ThreadId, u64>,
    by_deadline: BTreeSet<(u64, ThreadId)>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timer for `thread`. Returns false and leaves the existing
    /// registration alone if one is already active.
    pub fn arm(&mut self, thread: ThreadId, deadline_ms: u64) -> bool {
        if self.by_thread.contains_key(&thread) {
            return false;
        }
        self.by_thread.insert(thread, deadline_ms);
        self.by_deadline.insert((deadline_ms, thread));
        true
    }

    pub fn cancel(&mut self, thread: ThreadId) -> bool {
        match self.by_thread.remove(&thread) {
            Some(deadline) => {
                self.by_deadline.remove(&(deadline, thread));
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, thread: ThreadId) -> bool {
        self.by_thread.contains_key(&thread)
    }

    pub fn deadline_of(&self, thread: ThreadId) -> Option<u64> {
        self.by_thread.get(&thread).copied()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.by_deadline.iter().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every thread whose deadline is at or before `now_ms`
    pub fn expire(&mut self, now_ms: u64) -> Vec<ThreadId> {
        let mut woken = Vec::new();
        while let Some(&(deadline, thread)) = self.by_deadline.iter().next() {
            if deadline > now_ms {
                break;
            }
            self.by_deadline.remove(&(deadline, thread));
            self.by_thread.remove(&thread);
            woken.push(thread);
        }
        woken
    }

    pub fn len(&self) -> usize {
        self.by_thread.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_thread.is_empty()
    }
}

/// Threads waiting on one descriptor, with the events each cares about
#[derive(Debug, Default)]
pub struct WaitList {
    waiters: Vec<(ThreadId, u16)>,
}

impl WaitList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record interest; repeated registration merges the masks
    pub fn register(&mut self, thread: ThreadId, events: u16) {
        match self.waiters.iter_mut().find(|(t, _)| *t == thread) {
            Some((_, mask)) => *mask |= events,
            None => self.waiters.push((thread, events)),
        }
    }

    /// Release and return the threads interested in any of `events`
    pub fn notify(&mut self, events: u16) -> Vec<ThreadId> {
        let mut woken = Vec::new();
        self.waiters.retain(|(thread, mask)| {
            if mask & events != 0 {
                woken.push(*thread);
                false
            } else {
                true
            }
        });
        woken
    }

    pub fn is_waiting(&self, thread: ThreadId) -> bool {
        self.waiters.iter().any(|(t, _)| *t == thread)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
