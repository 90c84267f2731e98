//! A single-threaded timer queue. Stage transitions and stimulus delays are
//! queued here as events with a due time and handed back one at a time, so
//! no two of them ever run concurrently.
//!
//! The clock is either real, or virtual: a virtual clock jumps straight to
//! the next due time, which lets simulated sessions and tests run a whole
//! experiment without sleeping.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy)]
enum Clock {
    Real(Instant),
    Virtual(Duration),
}

#[derive(Debug)]
struct Entry<E> {
    due: Duration,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Entry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<E> Eq for Entry<E> {}

impl<E> PartialOrd for Entry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Entry<E> {
    // BinaryHeap is a max-heap; earliest due first, then insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Time-ordered queue of pending events.
#[derive(Debug)]
pub struct Scheduler<E> {
    queue: BinaryHeap<Entry<E>>,
    next_seq: u64,
    clock: Clock,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    /// A scheduler on the wall clock.
    pub fn new() -> Self {
        Scheduler {
            queue: BinaryHeap::new(),
            next_seq: 0,
            clock: Clock::Real(Instant::now()),
        }
    }

    /// A scheduler whose clock only moves when events are taken.
    pub fn virtual_clock() -> Self {
        Scheduler {
            clock: Clock::Virtual(Duration::ZERO),
            ..Self::new()
        }
    }

    /// Whether the clock is virtual.
    pub fn is_virtual(&self) -> bool {
        matches!(self.clock, Clock::Virtual(_))
    }

    /// Time since the scheduler was created, on its own clock.
    pub fn now(&self) -> Duration {
        match self.clock {
            Clock::Real(epoch) => epoch.elapsed(),
            Clock::Virtual(now) => now,
        }
    }

    /// Queues `event` to fire `delay` from now. Events due at the same time
    /// fire in the order they were scheduled.
    pub fn schedule(&mut self, delay: Duration, event: E) {
        let due = self.now() + delay;
        self.queue.push(Entry {
            due,
            seq: self.next_seq,
            event,
        });
        self.next_seq += 1;
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Time until the earliest pending event, zero if it is overdue.
    pub fn next_due(&self) -> Option<Duration> {
        let now = self.now();
        self.queue
            .peek()
            .map(|entry| entry.due.saturating_sub(now))
    }

    /// The earliest event, if it is due.
    pub fn pop_due(&mut self) -> Option<E> {
        let now = self.now();
        match self.queue.peek() {
            Some(entry) if entry.due <= now => self.queue.pop().map(|entry| entry.event),
            _ => None,
        }
    }

    /// The earliest event, waiting for it if needed. A virtual clock jumps
    /// to its due time instead of waiting.
    pub fn pop_next(&mut self) -> Option<E> {
        let entry = self.queue.pop()?;
        match &mut self.clock {
            Clock::Virtual(now) => {
                if entry.due > *now {
                    *now = entry.due;
                }
            }
            Clock::Real(epoch) => {
                let wait = entry.due.saturating_sub(epoch.elapsed());
                if !wait.is_zero() {
                    spin_sleep::sleep(wait);
                }
            }
        }
        Some(entry.event)
    }

    /// Drops every pending event.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_come_out_in_due_order() {
        let mut scheduler = Scheduler::virtual_clock();
        scheduler.schedule(Duration::from_millis(30), "c");
        scheduler.schedule(Duration::from_millis(10), "a");
        scheduler.schedule(Duration::from_millis(20), "b");
        scheduler.schedule(Duration::from_millis(10), "a2");

        let order: Vec<_> = std::iter::from_fn(|| scheduler.pop_next()).collect();
        assert_eq!(order, vec!["a", "a2", "b", "c"]);
        assert_eq!(scheduler.now(), Duration::from_millis(30));
    }

    #[test]
    fn virtual_clock_only_moves_on_pop() {
        let mut scheduler = Scheduler::virtual_clock();
        scheduler.schedule(Duration::from_secs(5), 1);

        assert_eq!(scheduler.pop_due(), None);
        assert_eq!(scheduler.next_due(), Some(Duration::from_secs(5)));
        assert_eq!(scheduler.pop_next(), Some(1));

        scheduler.schedule(Duration::ZERO, 2);
        assert_eq!(scheduler.pop_due(), Some(2));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn real_clock_waits() {
        let mut scheduler = Scheduler::new();
        let start = Instant::now();
        scheduler.schedule(Duration::from_millis(20), ());

        assert_eq!(scheduler.pop_due(), None);
        assert_eq!(scheduler.pop_next(), Some(()));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn clear_drops_everything() {
        let mut scheduler = Scheduler::virtual_clock();
        for i in 0..6 {
            scheduler.schedule(Duration::from_millis(i), i);
        }
        assert_eq!(scheduler.len(), 6);
        scheduler.clear();
        assert_eq!(scheduler.pop_next(), None);
    }
}
