//! Timer service driven by the read loop
//!
//! The scheduler never runs anything itself. The loop calls
//! [`Scheduler::poll_due`] on its idle cycles and executes the returned
//! tasks on its own thread, so tasks must stay cheap.

use std::time::{Duration, Instant};

/// Handle to a scheduled entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Entry<T> {
    id: TimerId,
    due: Instant,
    period: Option<Duration>,
    task: T,
}

#[derive(Debug)]
pub struct Scheduler<T> {
    entries: Vec<Entry<T>>,
    next_id: u64,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

impl<T: Clone> Scheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, due: Instant, period: Option<Duration>, task: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            due,
            period,
            task,
        });
        id
    }

    /// Run `task` once after `delay`
    pub fn call_later(&mut self, delay: Duration, task: T) -> TimerId {
        self.push(Instant::now() + delay, None, task)
    }

    /// Run `task` every `period`, first after one period
    ///
    /// A zero period would fire on every poll, so it is clamped to 1 ms.
    pub fn schedule_regularly(&mut self, period: Duration, task: T) -> TimerId {
        let period = period.max(Duration::from_millis(1));
        self.push(Instant::now() + period, Some(period), task)
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Tasks due at `now`, in deadline order
    ///
    /// One-shot entries are removed; periodic entries are rescheduled one
    /// period after `now`, so a stalled loop does not cause a burst.
    pub fn poll_due(&mut self, now: Instant) -> Vec<T> {
        let mut due: Vec<(Instant, T)> = Vec::new();
        self.entries.retain_mut(|entry| {
            if entry.due > now {
                return true;
            }
            due.push((entry.due, entry.task.clone()));
            match entry.period {
                Some(period) => {
                    entry.due = now + period;
                    true
                }
                None => false,
            }
        });
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, task)| task).collect()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.due).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
