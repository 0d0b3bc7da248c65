//! Ready-queue policies.
//!
//! The kernel consults a [`Scheduler`] implementation to decide which
//! thread runs next. Two policies exist: [`PriorityScheduler`], the
//! default, keeps the ready queue ordered by effective priority
//! (first-in-first-out among equals) and cooperates with priority
//! donation by re-sorting when priorities move; [`RoundRobin`] is the
//! plain circular queue selected by the `-mlfqs` boot flag, under which
//! donation is disabled and the feedback accessors report zero.

use super::Thread;
use std::{collections::VecDeque, sync::Arc};

/// A ready-queue policy. All methods are called with the kernel scheduler
/// state locked.
pub trait Scheduler: Send {
    /// Insert a runnable thread into the ready queue.
    fn push_to_queue(&mut self, thread: Arc<Thread>);

    /// Remove and return the next thread to run.
    fn next_to_run(&mut self) -> Option<Arc<Thread>>;

    /// Effective priority of the thread that would run next.
    fn top_priority(&self) -> Option<u32>;

    /// Restore queue order after a priority change.
    fn resort(&mut self);
}

fn priority_of(t: &Arc<Thread>) -> u32 {
    let sched = t.sched.lock();
    let p = sched.priority;
    sched.unlock();
    p
}

/// Priority scheduling: the ready queue is kept in descending order of
/// effective priority at all times.
pub struct PriorityScheduler {
    queue: Vec<Arc<Thread>>,
}

impl PriorityScheduler {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self { queue: Vec::new() }
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for PriorityScheduler {
    fn push_to_queue(&mut self, thread: Arc<Thread>) {
        let p = priority_of(&thread);
        // Insert after every thread of equal priority, so equals run
        // round-robin.
        let at = self
            .queue
            .iter()
            .position(|t| priority_of(t) < p)
            .unwrap_or(self.queue.len());
        self.queue.insert(at, thread);
    }

    fn next_to_run(&mut self) -> Option<Arc<Thread>> {
        if self.queue.is_empty() {
            None
        } else {
            Some(self.queue.remove(0))
        }
    }

    fn top_priority(&self) -> Option<u32> {
        self.queue.first().map(priority_of)
    }

    fn resort(&mut self) {
        // Stable, so threads of equal priority keep their relative order.
        self.queue.sort_by_key(|t| core::cmp::Reverse(priority_of(t)));
    }
}

/// Round-robin scheduling: a circular queue, no priority ordering.
pub struct RoundRobin {
    queue: VecDeque<Arc<Thread>>,
}

impl RoundRobin {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for RoundRobin {
    fn push_to_queue(&mut self, thread: Arc<Thread>) {
        self.queue.push_back(thread);
    }

    fn next_to_run(&mut self) -> Option<Arc<Thread>> {
        self.queue.pop_front()
    }

    fn top_priority(&self) -> Option<u32> {
        None
    }

    fn resort(&mut self) {}
}
