//! Lock with ownership and priority donation.
//!
//! A [`Lock`] is a binary semaphore that remembers its holder. The holder
//! identity powers two things the bare semaphore cannot provide: a
//! release-by-owner assertion, and **priority donation**. When a thread
//! blocks on a lock held by a lower-priority thread, the holder's
//! effective priority is raised to at least the waiter's, so that a
//! middle-priority thread cannot starve the holder and, through it, the
//! waiter. Donation follows the chain of waited-for locks (a donor boosts
//! the holder, the holder's own blocker, and so on) and nests across
//! locks: a thread holding several locks runs at the maximum of its own
//! priority and every waiter's on any lock it holds. Releasing a lock
//! recomputes the holder's effective priority from the locks it still
//! holds, falling back to its origin priority when none remain.
//!
//! Donation is disabled under the `-mlfqs` boot flag.

use crate::{
    sync::SpinLock,
    thread::{self, CurrentCtx, Thread, ThreadState},
};
use std::sync::Arc;

pub(crate) struct LockInner {
    pub locked: bool,
    pub holder: Option<Arc<Thread>>,
    pub waiters: Vec<Arc<Thread>>,
}

/// Shared state of one lock; threads keep references to the locks they
/// hold and the one they wait for.
pub(crate) struct LockCore {
    pub(crate) inner: SpinLock<LockInner>,
}

/// A sleeping mutual exclusion lock with priority donation.
pub struct Lock {
    core: Arc<LockCore>,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    /// Create an unheld lock.
    pub fn new() -> Self {
        Self {
            core: Arc::new(LockCore {
                inner: SpinLock::new(LockInner {
                    locked: false,
                    holder: None,
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    /// Acquire the lock, donating priority to the holder chain while
    /// blocked.
    pub fn acquire(&self) {
        thread::preemption_point();
        let ctx = thread::context();
        let me = &ctx.thread;
        loop {
            let sched = ctx.kernel.sched.lock();
            let mut li = self.core.inner.lock();
            if !li.locked {
                li.locked = true;
                li.holder = Some(me.clone());
                li.unlock();
                let mut ts = me.sched.lock();
                ts.waiting_for = None;
                ts.owned.push(self.core.clone());
                ts.unlock();
                sched.unlock();
                return;
            }
            assert!(
                !li.holder.as_ref().is_some_and(|h| Arc::ptr_eq(h, me)),
                "thread {:?} acquired a lock it already holds",
                me.name
            );
            li.waiters.push(me.clone());
            let holder = li.holder.clone();
            li.unlock();
            {
                let mut ts = me.sched.lock();
                ts.waiting_for = Some(self.core.clone());
                ts.state = ThreadState::Blocked;
                ts.unlock();
            }
            let mut sched = sched;
            if sched.donation {
                donate_chain(&mut sched, me.priority(), holder);
            }
            thread::block_current(me, sched);
        }
    }

    /// Try to acquire the lock without blocking.
    pub fn try_acquire(&self) -> bool {
        let ctx = thread::context();
        let me = &ctx.thread;
        let sched = ctx.kernel.sched.lock();
        let mut li = self.core.inner.lock();
        let taken = !li.locked;
        if taken {
            li.locked = true;
            li.holder = Some(me.clone());
        }
        li.unlock();
        if taken {
            let mut ts = me.sched.lock();
            ts.owned.push(self.core.clone());
            ts.unlock();
        }
        sched.unlock();
        taken
    }

    /// Release the lock, waking its highest-priority waiter and shedding
    /// any donation it carried.
    pub fn release(&self) {
        let ctx = thread::context();
        let mut sched = ctx.kernel.sched.lock();
        let grant = release_core(&mut sched, &self.core, &ctx.thread);
        sched.unlock();
        if let Some(grant) = grant {
            grant.parker.unpark();
        }
        // The woken waiter may outrank us now that the donation is gone.
        thread::preemption_point();
    }

    /// Whether the current thread holds this lock.
    pub fn held_by_current(&self) -> bool {
        let me = thread::current();
        let li = self.core.inner.lock();
        let held = li.holder.as_ref().is_some_and(|h| Arc::ptr_eq(h, &me));
        li.unlock();
        held
    }
}

/// Boost the priority of the holder of the lock the donor blocks on, and
/// transitively of whatever that holder itself waits for. Caller holds the
/// scheduler lock.
fn donate_chain(
    sched: &mut crate::thread::Sched,
    donor_priority: u32,
    holder: Option<Arc<Thread>>,
) {
    let mut cur = holder;
    // A cycle of waited-for locks is a deadlock; bound the walk so a bug
    // surfaces as a stuck test rather than a spin.
    for _ in 0..64 {
        let Some(h) = cur else {
            break;
        };
        let mut hs = h.sched.lock();
        if hs.priority >= donor_priority {
            hs.unlock();
            break;
        }
        hs.priority = donor_priority;
        let next = hs.waiting_for.clone();
        hs.unlock();
        cur = next.and_then(|lock| {
            let li = lock.inner.lock();
            let holder = li.holder.clone();
            li.unlock();
            holder
        });
    }
    sched.ready.resort();
}

/// Release `core` on behalf of `me`, recomputing `me`'s effective priority
/// and waking the best waiter. Caller holds the scheduler lock; the
/// returned thread must be unparked after it is released.
pub(crate) fn release_core(
    sched: &mut crate::thread::Sched,
    core: &Arc<LockCore>,
    me: &Arc<Thread>,
) -> Option<Arc<Thread>> {
    let mut li = core.inner.lock();
    assert!(
        li.holder.as_ref().is_some_and(|h| Arc::ptr_eq(h, me)),
        "lock released by a non-holder"
    );
    li.holder = None;
    li.locked = false;
    let best = li
        .waiters
        .iter()
        .enumerate()
        .max_by_key(|(_, t)| t.priority())
        .map(|(i, _)| i);
    let woken = best.map(|i| li.waiters.remove(i));
    li.unlock();
    {
        let mut ts = me.sched.lock();
        ts.owned.retain(|l| !Arc::ptr_eq(l, core));
        ts.unlock();
    }
    thread::recompute_effective(sched.donation, me);
    sched.ready.resort();
    woken.and_then(|t| {
        let mut ts = t.sched.lock();
        ts.waiting_for = None;
        ts.unlock();
        thread::unblock_locked(sched, t)
    })
}

/// Release every lock held by the current thread. Used on process exit.
pub(crate) fn release_all(ctx: &CurrentCtx) {
    loop {
        let core = {
            let ts = ctx.thread.sched.lock();
            let core = ts.owned.last().cloned();
            ts.unlock();
            core
        };
        let Some(core) = core else {
            break;
        };
        let mut sched = ctx.kernel.sched.lock();
        let grant = release_core(&mut sched, &core, &ctx.thread);
        sched.unlock();
        if let Some(grant) = grant {
            grant.parker.unpark();
        }
    }
}
