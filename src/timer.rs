//! Timer.
//!
//! The host ticker calls [`tick`] once per millisecond, the kernel's
//! timer interrupt. Each tick advances the tick counter, wakes any
//! sleeper that has become due, charges the tick to idle, kernel or user
//! time, and raises a pending yield once the running thread has used up
//! its time slice.
//!
//! [`sleep`] never busy-waits: the caller records its wakeup tick, enters
//! the sleep queue (kept ordered by wakeup tick) and blocks until the
//! tick that wakes it.

use crate::{
    kernel::Kernel,
    thread::{self, ThreadState},
};
use std::sync::Arc;

/// Ticks a thread may run before it is preempted.
pub const TIME_SLICE: u32 = 4;
/// Host milliseconds per tick.
pub const TICK_MS: u64 = 1;

/// Number of timer ticks since boot.
pub fn ticks(kernel: &Kernel) -> u64 {
    let sched = kernel.sched.lock();
    let now = sched.ticks;
    sched.unlock();
    now
}

/// Suspend the current thread for at least `ticks` timer ticks.
pub fn sleep(ticks: u64) {
    thread::preemption_point();
    let ctx = crate::thread::context();
    if ticks == 0 {
        thread::yield_now();
        return;
    }
    let me = &ctx.thread;
    let mut sched = ctx.kernel.sched.lock();
    let wakeup = sched.ticks + ticks;
    {
        let mut ts = me.sched.lock();
        ts.wakeup_tick = wakeup;
        ts.state = ThreadState::Blocked;
        ts.unlock();
    }
    let at = sched
        .sleepers
        .iter()
        .position(|t| {
            let ts = t.sched.lock();
            let later = ts.wakeup_tick > wakeup;
            ts.unlock();
            later
        })
        .unwrap_or(sched.sleepers.len());
    sched.sleepers.insert(at, me.clone());
    thread::block_current(me, sched);
}

/// The timer interrupt entry, driven by the host ticker.
pub(crate) fn tick(kernel: &Arc<Kernel>) {
    let mut sched = kernel.sched.lock();
    sched.ticks += 1;
    let now = sched.ticks;

    let running = sched.current.clone();
    match running {
        None => sched.stats.idle_ticks += 1,
        Some(t) if t.task.get().is_some() => sched.stats.user_ticks += 1,
        Some(_) => sched.stats.kernel_ticks += 1,
    }

    // Wake every sleeper that is due.
    let mut grants = Vec::new();
    loop {
        let due = match sched.sleepers.first() {
            Some(t) => {
                let ts = t.sched.lock();
                let due = ts.wakeup_tick <= now;
                ts.unlock();
                due
            }
            None => false,
        };
        if !due {
            break;
        }
        let t = sched.sleepers.remove(0);
        if let Some(grant) = thread::unblock_locked(&mut sched, t) {
            grants.push(grant);
        }
    }

    // Enforce preemption at the quantum, and promptly when a wakeup put a
    // higher-priority thread in the queue.
    if let Some(current) = sched.current.clone() {
        sched.slice += 1;
        let expired = sched.slice >= TIME_SLICE;
        let outranked = sched
            .ready
            .top_priority()
            .is_some_and(|top| top > current.priority());
        if expired || outranked {
            sched.yield_pending = true;
        }
    }
    sched.unlock();
    for grant in grants {
        grant.parker.unpark();
    }
}
