//! Virtual-time event queue for the clustering state machine.
//!
//! Thin adapter over "schedule a callback" style timer facilities: entries
//! get a stable handle for cancellation, the owning task polls
//! `next_deadline` to know how long to sleep, and `pop_due` drains ripe
//! entries in deadline order. Keeping the queue inside the machine makes
//! cancellation (a pending claim, or a full stop) synchronous and testable.

use embassy_time::Instant;

/// Stable identifier for one scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

#[derive(Debug)]
struct Entry<E> {
    handle: TimerHandle,
    at: Instant,
    event: E,
}

#[derive(Debug)]
pub struct TimerQueue<E> {
    next_handle: u64,
    entries: Vec<Entry<E>>,
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self {
            next_handle: 0,
            entries: Vec::new(),
        }
    }
}

impl<E> TimerQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: Instant, event: E) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.push(Entry { handle, at, event });
        handle
    }

    /// Remove one entry by handle. Returns whether it was still pending.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.handle != handle);
        self.entries.len() != before
    }

    /// Drop every pending entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|entry| entry.at).min()
    }

    /// Remove and return the earliest entry due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<E> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.at <= now)
            .min_by_key(|(_, entry)| entry.at)
            .map(|(index, _)| index)?;
        Some(self.entries.swap_remove(index).event)
    }
}

impl<E: PartialEq> TimerQueue<E> {
    /// Remove every pending entry equal to `event`.
    pub fn cancel_event(&mut self, event: &E) {
        self.entries.retain(|entry| entry.event != *event);
    }

    pub fn has_event(&self, event: &E) -> bool {
        self.entries.iter().any(|entry| entry.event == *event)
    }
}
