//! Counting semaphore.
//!
//! A semaphore is a non-negative counter with two operations: [`down`]
//! blocks while the counter is zero and then decrements it, [`up`]
//! increments it and wakes one waiter. When several threads wait, the
//! highest-priority one is woken first. A semaphore initialized to zero
//! serves as an event: the signaling thread `up`s it once the event has
//! happened, the waiting thread `down`s it.
//!
//! [`down`]: Semaphore::down
//! [`up`]: Semaphore::up

use crate::{
    sync::SpinLock,
    thread::{self, Thread, ThreadState},
};
use std::sync::Arc;

struct SemaInner {
    value: usize,
    waiters: Vec<Arc<Thread>>,
}

/// A counting semaphore.
pub struct Semaphore {
    inner: SpinLock<SemaInner>,
}

impl Semaphore {
    /// Create a semaphore with `value` initial permits.
    pub const fn new(value: usize) -> Self {
        Self {
            inner: SpinLock::new(SemaInner {
                value,
                waiters: Vec::new(),
            }),
        }
    }

    /// Decrement the counter, blocking until it is positive.
    pub fn down(&self) {
        thread::preemption_point();
        let ctx = thread::context();
        let me = &ctx.thread;
        loop {
            let sched = ctx.kernel.sched.lock();
            let mut inner = self.inner.lock();
            if inner.value > 0 {
                inner.value -= 1;
                inner.unlock();
                sched.unlock();
                return;
            }
            inner.waiters.push(me.clone());
            inner.unlock();
            {
                let mut ts = me.sched.lock();
                ts.state = ThreadState::Blocked;
                ts.unlock();
            }
            thread::block_current(me, sched);
        }
    }

    /// Decrement the counter if it is positive, without blocking.
    pub fn try_down(&self) -> bool {
        let ctx = thread::context();
        let sched = ctx.kernel.sched.lock();
        let mut inner = self.inner.lock();
        let taken = inner.value > 0;
        if taken {
            inner.value -= 1;
        }
        inner.unlock();
        sched.unlock();
        taken
    }

    /// Increment the counter and wake the highest-priority waiter.
    pub fn up(&self) {
        let ctx = thread::context();
        let mut sched = ctx.kernel.sched.lock();
        let mut inner = self.inner.lock();
        inner.value += 1;
        let best = inner
            .waiters
            .iter()
            .enumerate()
            .max_by_key(|(_, t)| t.priority())
            .map(|(i, _)| i);
        let woken = best.map(|i| inner.waiters.remove(i));
        inner.unlock();
        let grant = woken.and_then(|t| thread::unblock_locked(&mut sched, t));
        sched.unlock();
        if let Some(grant) = grant {
            grant.parker.unpark();
        }
        // A woken waiter may outrank us; give it the CPU promptly.
        thread::preemption_point();
    }

    /// Current number of permits.
    pub fn value(&self) -> usize {
        let inner = self.inner.lock();
        let v = inner.value;
        inner.unlock();
        v
    }
}
