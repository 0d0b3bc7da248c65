//! The assembled machine.
//!
//! A [`Kernel`] owns every global subsystem: the scheduler state, the
//! user-frame pool, the frame table, the swap area, the mounted file
//! system, the console, and the registry of user-program bodies.
//! [`KernelBuilder`] plays the role of the boot command line: `-f`
//! formats the file system, `-mlfqs` selects the round-robin feedback
//! policy (disabling priority donation), and the sizing knobs describe
//! the machine. Building the kernel starts the host ticker that drives
//! the timer; mounting a file-system disk starts the write-behind
//! daemon.

use crate::{
    console::Console,
    dev::{Disk, MemDisk},
    fs::FileSys,
    mm::{frame::FrameTable, swap::SwapTable, UserPool},
    proc::user::UserProgram,
    sync::{Lock, SpinLock},
    thread::{
        self,
        scheduler::{PriorityScheduler, RoundRobin, Scheduler},
        Sched, ThreadBuilder, Tid,
    },
    timer, KernelError,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

/// Ticks between write-behind flushes of the buffer cache.
pub const WRITE_BEHIND_PERIOD: u64 = 64;

/// The kernel.
pub struct Kernel {
    pub(crate) sched: SpinLock<Sched>,
    next_tid: AtomicU64,
    console: Console,
    pool: UserPool,
    frames: FrameTable,
    swap: SwapTable,
    fs: SpinLock<Option<Arc<FileSys>>>,
    programs: SpinLock<BTreeMap<String, UserProgram>>,
    file_lock: Lock,
    halted: AtomicBool,
}

impl Kernel {
    pub(crate) fn alloc_tid(&self) -> Tid {
        self.next_tid.fetch_add(1, Ordering::SeqCst)
    }

    /// The kernel console.
    pub fn console(&self) -> &Console {
        &self.console
    }

    /// The user-frame pool.
    pub fn pool(&self) -> &UserPool {
        &self.pool
    }

    /// The global frame table.
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// The swap area.
    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// The mounted file system.
    pub fn filesys(&self) -> Result<Arc<FileSys>, KernelError> {
        let fs = self.fs.lock();
        let got = fs.clone();
        fs.unlock();
        got.ok_or(KernelError::NotSupportedOperation)
    }

    /// The global file-syscall lock.
    pub(crate) fn file_lock(&self) -> &Lock {
        &self.file_lock
    }

    /// Number of timer ticks since boot.
    pub fn ticks(&self) -> u64 {
        timer::ticks(self)
    }

    /// Whether the machine has been halted.
    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Register the body run "in user mode" by processes loaded from the
    /// executable called `name`.
    pub fn register_program(
        &self,
        name: &str,
        body: impl Fn(&mut crate::proc::user::UserCtx) -> i32 + Send + Sync + 'static,
    ) {
        let mut programs = self.programs.lock();
        programs.insert(name.to_string(), Arc::new(body));
        programs.unlock();
    }

    pub(crate) fn lookup_program(&self, name: &str) -> Option<UserProgram> {
        let programs = self.programs.lock();
        let body = programs.get(name).cloned();
        programs.unlock();
        body
    }

    /// Mount the file system on `disk` and start the write-behind daemon.
    pub fn mount(self: &Arc<Self>, disk: Disk, format: bool) -> Result<(), KernelError> {
        let fs = FileSys::mount(disk, format)?;
        {
            let mut slot = self.fs.lock();
            *slot = Some(fs);
            slot.unlock();
        }
        let kernel = self.clone();
        ThreadBuilder::new("write-behind").spawn(self, move || loop {
            timer::sleep(WRITE_BEHIND_PERIOD);
            if kernel.halted() {
                break;
            }
            if let Ok(fs) = kernel.filesys() {
                // A failed flush is retried next period; the dirty marks
                // are still set.
                let _ = fs.flush();
            }
        });
        Ok(())
    }

    /// Orderly power-off: persist the free map, flush the cache, and stop
    /// the timer.
    pub fn halt(&self) {
        if let Ok(fs) = self.filesys() {
            let _ = fs.sync();
        }
        self.halted.store(true, Ordering::SeqCst);
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.halted.store(true, Ordering::SeqCst);
    }
}

/// Boot-time configuration of a [`Kernel`].
pub struct KernelBuilder {
    format: bool,
    mlfqs: bool,
    user_pages: usize,
    fs_disk: Option<Disk>,
    swap_disk: Option<Disk>,
    mirror_console: bool,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBuilder {
    /// Start from the default machine: 64 user frames, no disks.
    pub fn new() -> Self {
        Self {
            format: false,
            mlfqs: false,
            user_pages: 64,
            fs_disk: None,
            swap_disk: None,
            mirror_console: false,
        }
    }

    /// Apply boot command-line flags: `-f` formats the file system,
    /// `-mlfqs` selects the feedback scheduling policy.
    pub fn parse_args(mut self, args: &str) -> Self {
        for arg in args.split_whitespace() {
            match arg {
                "-f" => self.format = true,
                "-mlfqs" => self.mlfqs = true,
                other => panic!("unknown boot argument {:?}", other),
            }
        }
        self
    }

    /// Format the file system at boot.
    pub fn format(mut self) -> Self {
        self.format = true;
        self
    }

    /// Select the feedback scheduling policy.
    pub fn mlfqs(mut self) -> Self {
        self.mlfqs = true;
        self
    }

    /// Number of user frames in the pool.
    pub fn user_pages(mut self, pages: usize) -> Self {
        self.user_pages = pages;
        self
    }

    /// Attach the file-system disk.
    pub fn filesys_disk(mut self, disk: Disk) -> Self {
        self.fs_disk = Some(disk);
        self
    }

    /// Attach the file-system disk as a fresh in-memory disk of
    /// `sectors` sectors, formatted at boot.
    pub fn fresh_filesys(self, sectors: usize) -> Self {
        self.filesys_disk(Disk::new(MemDisk::new(sectors))).format()
    }

    /// Attach the swap disk.
    pub fn swap_disk(mut self, disk: Disk) -> Self {
        self.swap_disk = Some(disk);
        self
    }

    /// Attach a fresh in-memory swap disk holding `slots` page slots.
    pub fn fresh_swap(self, slots: usize) -> Self {
        self.swap_disk(Disk::new(MemDisk::new(
            slots * crate::mm::swap::SECTORS_PER_PAGE,
        )))
    }

    /// Mirror console output to the host standard output.
    pub fn mirror_console(mut self) -> Self {
        self.mirror_console = true;
        self
    }

    /// Boot: assemble the kernel, start the ticker, and mount the file
    /// system when a disk was attached.
    pub fn build(self) -> Result<Arc<Kernel>, KernelError> {
        thread::install_exit_hook();
        let policy: Box<dyn Scheduler> = if self.mlfqs {
            Box::new(RoundRobin::new())
        } else {
            Box::new(PriorityScheduler::new())
        };
        let swap_disk = self
            .swap_disk
            .unwrap_or_else(|| Disk::new(MemDisk::new(0)));
        let kernel = Arc::new(Kernel {
            sched: SpinLock::new(Sched::new(policy, !self.mlfqs)),
            next_tid: AtomicU64::new(1),
            console: Console::new(self.mirror_console),
            pool: UserPool::new(self.user_pages),
            frames: FrameTable::new(),
            swap: SwapTable::new(swap_disk),
            fs: SpinLock::new(None),
            programs: SpinLock::new(BTreeMap::new()),
            file_lock: Lock::new(),
            halted: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&kernel);
        std::thread::Builder::new()
            .name("ticker".to_string())
            .spawn(move || loop {
                std::thread::sleep(std::time::Duration::from_millis(timer::TICK_MS));
                let Some(kernel) = weak.upgrade() else {
                    break;
                };
                if kernel.halted() {
                    break;
                }
                timer::tick(&kernel);
            })
            .expect("failed to start the timer");

        if let Some(disk) = self.fs_disk {
            kernel.mount(disk, self.format)?;
        }
        Ok(kernel)
    }
}
