//! Thread core.
//!
//! A thread is the kernel's unit of execution. At most one thread runs at
//! any time; every other live thread is ready (queued for the CPU),
//! blocked (waiting on a semaphore, lock or timer), or dying. The
//! scheduler state, every thread-state transition, and the donation
//! bookkeeping are all serialized by one spinlock, the kernel's analog of
//! disabling interrupts.
//!
//! Each kernel thread is carried by a host thread, parked whenever it does
//! not own the CPU. A context switch is a permit transfer: the outgoing
//! thread publishes the next thread as current, unparks it and parks
//! itself. Preemption is cooperative: the timer tick raises a pending
//! yield after the time slice expires, and the running thread honors it at
//! its next preemption point (any synchronization call, sleep, or
//! system-call entry).
//!
//! Threads are created with [`ThreadBuilder`], which hands back a
//! [`JoinHandle`]. A new thread starts blocked and is inserted into the
//! ready queue; its creator is preempted right away if the newcomer has
//! the higher priority. A thread ends at [`exit`], which unwinds the
//! thread's stack and reports its status to joiners.

pub mod scheduler;

use crate::{
    kernel::Kernel,
    sync::{lock::LockCore, Semaphore, SpinLock, SpinLockGuard},
};
use scheduler::Scheduler;
use std::{
    any::Any,
    cell::RefCell,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, OnceLock,
    },
};

/// Thread identifier.
pub type Tid = u64;

/// Lowest priority.
pub const PRI_MIN: u32 = 0;
/// Default priority.
pub const PRI_DEFAULT: u32 = 31;
/// Highest priority.
pub const PRI_MAX: u32 = 63;

/// A possible state of a thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Thread is on the CPU.
    Running,
    /// Thread is in the ready queue.
    Ready,
    /// Thread is waiting for an event.
    Blocked,
    /// Thread is on its way out.
    Dying,
}

pub(crate) struct ThreadSched {
    pub state: ThreadState,
    /// Effective priority, including donations.
    pub priority: u32,
    /// Priority assigned by the thread itself, donation aside.
    pub origin_priority: u32,
    /// Tick at which a sleeping thread becomes due.
    pub wakeup_tick: u64,
    /// The lock this thread is blocked on, if any.
    pub waiting_for: Option<Arc<LockCore>>,
    /// Locks currently held by this thread.
    pub owned: Vec<Arc<LockCore>>,
}

pub(crate) struct Parker {
    permit: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            permit: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn park(&self) {
        let mut permit = self.permit.lock().unwrap();
        while !*permit {
            permit = self.cv.wait(permit).unwrap();
        }
        *permit = false;
    }

    pub(crate) fn unpark(&self) {
        *self.permit.lock().unwrap() = true;
        self.cv.notify_one();
    }
}

type Outcome = Result<i32, Box<dyn Any + Send + 'static>>;

pub(crate) struct ExitCell {
    outcome: Mutex<Option<Outcome>>,
    cv: Condvar,
}

impl ExitCell {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn complete(&self, outcome: Outcome) {
        *self.outcome.lock().unwrap() = Some(outcome);
        self.cv.notify_all();
    }

    fn try_take(&self) -> Option<Outcome> {
        self.outcome.lock().unwrap().take()
    }

    fn wait_take(&self) -> Outcome {
        let mut guard = self.outcome.lock().unwrap();
        loop {
            if let Some(outcome) = guard.take() {
                return outcome;
            }
            guard = self.cv.wait(guard).unwrap();
        }
    }
}

/// A kernel thread.
pub struct Thread {
    /// Thread id.
    pub tid: Tid,
    /// Thread name.
    pub name: String,
    pub(crate) sched: SpinLock<ThreadSched>,
    pub(crate) parker: Parker,
    pub(crate) exit: ExitCell,
    pub(crate) exit_sema: Semaphore,
    /// The process attached to this thread, if it carries one.
    pub(crate) task: OnceLock<Arc<crate::proc::Process>>,
    pub(crate) kill_requested: AtomicBool,
    pub(crate) exiting: AtomicBool,
}

impl Thread {
    fn new(tid: Tid, name: String, priority: u32) -> Self {
        Self {
            tid,
            name,
            sched: SpinLock::new(ThreadSched {
                state: ThreadState::Blocked,
                priority,
                origin_priority: priority,
                wakeup_tick: 0,
                waiting_for: None,
                owned: Vec::new(),
            }),
            parker: Parker::new(),
            exit: ExitCell::new(),
            exit_sema: Semaphore::new(0),
            task: OnceLock::new(),
            kill_requested: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
        }
    }

    /// The process attached to this thread, if any.
    pub fn process(&self) -> Option<Arc<crate::proc::Process>> {
        self.task.get().cloned()
    }

    /// Current state of the thread.
    pub fn state(&self) -> ThreadState {
        let sched = self.sched.lock();
        let s = sched.state;
        sched.unlock();
        s
    }

    /// Effective priority of the thread.
    pub fn priority(&self) -> u32 {
        let sched = self.sched.lock();
        let p = sched.priority;
        sched.unlock();
        p
    }

    /// Ask the thread to exit with status -1 at its next preemption point.
    pub fn request_kill(&self) {
        self.kill_requested.store(true, Ordering::SeqCst);
    }
}

/// Scheduler state: the ready queue, the sleep queue and tick accounting.
/// Its spinlock is the kernel's "interrupts disabled" domain.
pub(crate) struct Sched {
    pub ready: Box<dyn Scheduler>,
    pub current: Option<Arc<Thread>>,
    /// Sleeping threads, ordered by wakeup tick.
    pub sleepers: Vec<Arc<Thread>>,
    pub ticks: u64,
    pub slice: u32,
    pub yield_pending: bool,
    /// Whether priority donation is in effect (off under `-mlfqs`).
    pub donation: bool,
    pub stats: TickStats,
}

/// Counters of where timer ticks were spent.
#[derive(Default, Clone, Copy)]
pub struct TickStats {
    /// Ticks with no thread on the CPU.
    pub idle_ticks: u64,
    /// Ticks spent in kernel-only threads.
    pub kernel_ticks: u64,
    /// Ticks spent in threads carrying a process.
    pub user_ticks: u64,
}

impl Sched {
    pub(crate) fn new(ready: Box<dyn Scheduler>, donation: bool) -> Self {
        Self {
            ready,
            current: None,
            sleepers: Vec::new(),
            ticks: 0,
            slice: 0,
            yield_pending: false,
            donation,
            stats: TickStats::default(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct CurrentCtx {
    pub kernel: Arc<Kernel>,
    pub thread: Arc<Thread>,
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentCtx>> = const { RefCell::new(None) };
}

pub(crate) fn try_context() -> Option<CurrentCtx> {
    CURRENT.with(|c| c.borrow().clone())
}

pub(crate) fn context() -> CurrentCtx {
    try_context().expect("not running on a kernel thread")
}

/// The running thread.
pub fn current() -> Arc<Thread> {
    context().thread
}

/// The running thread's id.
pub fn current_tid() -> Tid {
    current().tid
}

// Context switching.

/// Hand the CPU to `next` and release the scheduler lock. The caller parks
/// itself afterwards if it is giving the CPU away.
fn dispatch(mut sched: SpinLockGuard<'_, Sched>, next: Arc<Thread>) {
    let mut ts = next.sched.lock();
    ts.state = ThreadState::Running;
    ts.unlock();
    sched.slice = 0;
    // The fresh slice owns its own preemption fate.
    sched.yield_pending = false;
    sched.current = Some(next.clone());
    sched.unlock();
    next.parker.unpark();
}

fn on_resume(me: &Arc<Thread>) {
    if me.kill_requested.load(Ordering::SeqCst) && !me.exiting.load(Ordering::SeqCst) {
        crate::proc::exit_killed();
    }
}

/// Block the current thread, which the caller has already marked
/// [`ThreadState::Blocked`] and parked on some wait list, and schedule
/// another. Returns when the thread is unblocked.
pub(crate) fn block_current(me: &Arc<Thread>, mut sched: SpinLockGuard<'_, Sched>) {
    match sched.ready.next_to_run() {
        Some(next) => dispatch(sched, next),
        None => {
            // Nothing runnable: the CPU goes idle until an unblock.
            sched.current = None;
            sched.slice = 0;
            sched.unlock();
        }
    }
    me.parker.park();
    on_resume(me);
}

/// Transition a blocked thread to ready, granting it the CPU at once when
/// the CPU is idle. Returns the thread to unpark after the scheduler lock
/// is released. Does not preempt the running thread.
pub(crate) fn unblock_locked(sched: &mut Sched, t: Arc<Thread>) -> Option<Arc<Thread>> {
    let mut ts = t.sched.lock();
    debug_assert_eq!(ts.state, ThreadState::Blocked);
    if sched.current.is_none() {
        ts.state = ThreadState::Running;
        ts.unlock();
        sched.current = Some(t.clone());
        sched.slice = 0;
        sched.yield_pending = false;
        Some(t)
    } else {
        ts.state = ThreadState::Ready;
        ts.unlock();
        sched.ready.push_to_queue(t);
        None
    }
}

/// Transition a blocked thread to ready.
pub(crate) fn unblock(kernel: &Kernel, t: &Arc<Thread>) {
    let mut sched = kernel.sched.lock();
    let grant = unblock_locked(&mut sched, t.clone());
    sched.unlock();
    if let Some(g) = grant {
        g.parker.unpark();
    }
}

/// Yield the CPU with the scheduler lock already held.
fn yield_with(me: &Arc<Thread>, mut sched: SpinLockGuard<'_, Sched>) {
    sched.yield_pending = false;
    let mut ts = me.sched.lock();
    ts.state = ThreadState::Ready;
    ts.unlock();
    sched.ready.push_to_queue(me.clone());
    let next = sched
        .ready
        .next_to_run()
        .expect("ready queue lost the yielding thread");
    if Arc::ptr_eq(&next, me) {
        let mut ts = me.sched.lock();
        ts.state = ThreadState::Running;
        ts.unlock();
        sched.slice = 0;
        sched.unlock();
        return;
    }
    dispatch(sched, next);
    me.parker.park();
    on_resume(me);
}

/// Move the current thread to the ready queue and schedule another.
pub fn yield_now() {
    let ctx = context();
    let sched = ctx.kernel.sched.lock();
    yield_with(&ctx.thread, sched);
}

/// A preemption point: honor a pending kill, a tick-raised yield, or a
/// higher-priority ready thread. Called on every synchronization
/// operation and at system-call entry.
pub(crate) fn preemption_point() {
    let Some(ctx) = try_context() else {
        return;
    };
    let me = &ctx.thread;
    if me.kill_requested.load(Ordering::SeqCst) && !me.exiting.load(Ordering::SeqCst) {
        crate::proc::exit_killed();
    }
    let sched = ctx.kernel.sched.lock();
    let should = sched.yield_pending
        || sched
            .ready
            .top_priority()
            .is_some_and(|top| top > me.priority());
    if should {
        yield_with(me, sched);
    } else {
        sched.unlock();
    }
}

/// Recompute a thread's effective priority from its origin priority and
/// the waiters of every lock it holds. Caller holds the scheduler lock.
pub(crate) fn recompute_effective(donation: bool, t: &Arc<Thread>) {
    let (origin, owned) = {
        let ts = t.sched.lock();
        let pair = (ts.origin_priority, ts.owned.clone());
        ts.unlock();
        pair
    };
    let mut effective = origin;
    if donation {
        for lock in owned {
            let li = lock.inner.lock();
            let waiters = li.waiters.clone();
            li.unlock();
            for w in waiters {
                effective = effective.max(w.priority());
            }
        }
    }
    let mut ts = t.sched.lock();
    ts.priority = effective;
    ts.unlock();
}

/// Set the current thread's origin priority, recompute its effective
/// priority from donation state, and yield when a ready thread now
/// outranks it.
pub fn set_priority(priority: u32) {
    assert!((PRI_MIN..=PRI_MAX).contains(&priority));
    let ctx = context();
    let me = &ctx.thread;
    let sched = ctx.kernel.sched.lock();
    {
        let mut ts = me.sched.lock();
        ts.origin_priority = priority;
        ts.unlock();
    }
    let donation = sched.donation;
    recompute_effective(donation, me);
    let mut sched = sched;
    sched.ready.resort();
    let should = sched
        .ready
        .top_priority()
        .is_some_and(|top| top >= me.priority());
    if should {
        yield_with(me, sched);
    } else {
        sched.unlock();
    }
}

/// The current thread's effective priority.
pub fn get_priority() -> u32 {
    current().priority()
}

/// Nice value of the current thread. The feedback scheduler leaves this
/// unimplemented; the accessor exists for the `-mlfqs` surface.
pub fn get_nice() -> i32 {
    0
}

/// Set the nice value. See [`get_nice`].
pub fn set_nice(_nice: i32) {}

/// 100 times the system load average. See [`get_nice`].
pub fn get_load_avg() -> i32 {
    0
}

/// 100 times the current thread's recent CPU usage. See [`get_nice`].
pub fn get_recent_cpu() -> i32 {
    0
}

/// Tick accounting so far.
pub fn stats(kernel: &Kernel) -> TickStats {
    let sched = kernel.sched.lock();
    let stats = sched.stats;
    sched.unlock();
    stats
}

// Thread creation and exit.

struct ThreadExit(i32);

/// Whether an unwind payload is an orderly thread exit rather than a
/// genuine panic.
pub(crate) fn is_exit_payload(payload: &(dyn Any + Send)) -> bool {
    payload.is::<ThreadExit>()
}

/// Keep the host panic hook quiet about the unwind that carries a thread
/// exit; real panics still reach the previous hook.
pub(crate) fn install_exit_hook() {
    static HOOK: std::sync::Once = std::sync::Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ThreadExit>().is_none() {
                previous(info);
            }
        }));
    });
}

/// Terminate the current thread with `code`, unwinding its stack.
///
/// Kernel objects on the stack release their resources as the stack
/// unwinds; the thread then reports `code` to its joiners and gives up the
/// CPU for good.
pub fn exit(code: i32) -> ! {
    let ctx = context();
    ctx.thread.exiting.store(true, Ordering::SeqCst);
    std::panic::panic_any(ThreadExit(code));
}

fn thread_main(kernel: Arc<Kernel>, me: Arc<Thread>, body: Box<dyn FnOnce() + Send>) {
    CURRENT.with(|c| {
        *c.borrow_mut() = Some(CurrentCtx {
            kernel: kernel.clone(),
            thread: me.clone(),
        })
    });
    // Wait for the first dispatch. A kill requested this early is caught
    // at the body's first preemption point.
    me.parker.park();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
    let outcome: Outcome = match result {
        Ok(()) => Ok(0),
        Err(payload) => match payload.downcast::<ThreadExit>() {
            Ok(e) => Ok(e.0),
            Err(other) => Err(other),
        },
    };
    me.exiting.store(true, Ordering::SeqCst);
    me.exit.complete(outcome);
    // Joiners running on kernel threads wait on this semaphore; host
    // joiners wait on the exit cell.
    me.exit_sema.up();

    let mut sched = kernel.sched.lock();
    {
        let mut ts = me.sched.lock();
        ts.state = ThreadState::Dying;
        ts.unlock();
    }
    match sched.ready.next_to_run() {
        Some(next) => dispatch(sched, next),
        None => {
            sched.current = None;
            sched.unlock();
        }
    }
    // The host thread ends here; the stack page goes with it.
}

/// A builder for a new kernel thread.
pub struct ThreadBuilder {
    name: String,
    priority: u32,
}

impl ThreadBuilder {
    /// Create a builder for a thread called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: PRI_DEFAULT,
        }
    }

    /// Set the initial priority.
    pub fn priority(mut self, priority: u32) -> Self {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        self.priority = priority;
        self
    }

    /// Spawn the thread on `kernel` and make it runnable. The creator is
    /// preempted right away if the new thread has the higher priority.
    pub fn spawn(
        self,
        kernel: &Arc<Kernel>,
        body: impl FnOnce() + Send + 'static,
    ) -> JoinHandle {
        let thread = Arc::new(Thread::new(kernel.alloc_tid(), self.name, self.priority));
        let k = kernel.clone();
        let t = thread.clone();
        let body: Box<dyn FnOnce() + Send> = Box::new(body);
        std::thread::Builder::new()
            .name(thread.name.clone())
            .spawn(move || thread_main(k, t, body))
            .expect("failed to spawn a host thread");
        unblock(kernel, &thread);
        preemption_point();
        JoinHandle {
            tid: thread.tid,
            thread,
        }
    }
}

/// A handle to join a thread.
pub struct JoinHandle {
    /// Thread id of the joined thread.
    pub tid: Tid,
    thread: Arc<Thread>,
}

impl JoinHandle {
    /// Wait for the thread to exit and return its status. A panic in the
    /// thread body resurfaces in the joiner.
    pub fn join(self) -> i32 {
        let outcome = if try_context().is_some() {
            self.thread.exit_sema.down();
            self.thread
                .exit
                .try_take()
                .expect("exit semaphore raised without an outcome")
        } else {
            self.thread.exit.wait_take()
        };
        match outcome {
            Ok(code) => code,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// The joined thread.
    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }
}
