//! Process lifecycle.
//!
//! A process is a thread carrying an address space (page directory plus
//! supplemental page table), a file-descriptor table, its memory mappings,
//! a working directory, and the bookkeeping that ties it to its parent.
//!
//! `exec` creates a child thread running the loader and blocks on a
//! creation semaphore; the parent learns whether the load succeeded before
//! `exec` returns, and on success registers a child record it can later
//! `wait` on. A child record is waited on at most once: `wait` removes it,
//! so a second `wait` on the same pid reports failure. `exit` tears the
//! process down in a fixed order (children first, then locks, files,
//! mappings, the write-denied executable, frames, supplemental entries and
//! the page directory) and finally signals the parent's record.

pub mod elf;
pub(crate) mod load;
pub(crate) mod mmap;
pub mod user;

use crate::{
    dev::Sector,
    fs::{dir::Directory, file::File, ROOT_SECTOR},
    kernel::Kernel,
    mm::{fault, pagedir::PageDir, pagedir::WriteOutcome, page::SuppTable, Va, PAGE_SIZE},
    sync::{Semaphore, SpinLock},
    thread::{self, Thread, ThreadBuilder, Tid},
    KernelError,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
        Arc,
    },
};

/// Most open files a process may hold.
const FD_LIMIT: usize = 128;

/// A file-descriptor table entry.
pub(crate) enum FdEntry {
    /// An open regular file.
    File(Arc<File>),
    /// An open directory with its readdir cursor.
    Dir { dir: Directory, pos: usize },
}

struct FdTable {
    next_fd: i32,
    map: BTreeMap<i32, FdEntry>,
}

/// The record a parent holds for each child it has not waited on.
pub(crate) struct ChildRec {
    pub tid: Tid,
    pub sema: Semaphore,
    pub status: AtomicI32,
    pub thread: Arc<Thread>,
}

/// Per-process state, attached to the process thread.
pub struct Process {
    /// Process id; equals the thread id of the process thread.
    pub pid: Tid,
    name: String,
    /// The process page directory.
    pub pagedir: Arc<PageDir>,
    /// The supplemental page table.
    pub supp: SuppTable,
    files: SpinLock<FdTable>,
    pub(crate) mmaps: SpinLock<mmap::MmapTable>,
    children: SpinLock<Vec<Arc<ChildRec>>>,
    cwd: SpinLock<Sector>,
    user_esp: AtomicUsize,
    exec_file: SpinLock<Option<Arc<File>>>,
    parent_rec: SpinLock<Option<Arc<ChildRec>>>,
}

impl Process {
    pub(crate) fn new(_kernel: &Arc<Kernel>, pid: Tid, name: &str, cwd: Sector) -> Arc<Process> {
        Arc::new(Process {
            pid,
            name: name.to_string(),
            pagedir: Arc::new(PageDir::new()),
            supp: SuppTable::new(),
            files: SpinLock::new(FdTable {
                next_fd: 2,
                map: BTreeMap::new(),
            }),
            mmaps: SpinLock::new(mmap::MmapTable::new()),
            children: SpinLock::new(Vec::new()),
            cwd: SpinLock::new(cwd),
            user_esp: AtomicUsize::new(crate::mm::PHYS_BASE),
            exec_file: SpinLock::new(None),
            parent_rec: SpinLock::new(None),
        })
    }

    /// Name of the process, the executable's first command-line token.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Working-directory sector.
    pub fn cwd(&self) -> Sector {
        let cwd = self.cwd.lock();
        let s = *cwd;
        cwd.unlock();
        s
    }

    pub(crate) fn set_cwd(&self, sector: Sector) {
        let mut cwd = self.cwd.lock();
        *cwd = sector;
        cwd.unlock();
    }

    /// The last recorded user stack pointer.
    pub fn user_esp(&self) -> usize {
        self.user_esp.load(Ordering::SeqCst)
    }

    /// Record the user stack pointer from a trap into the kernel, and mark
    /// its page as the current stack page for the eviction clock.
    pub fn record_esp(&self, esp: usize) {
        self.user_esp.store(esp, Ordering::SeqCst);
        let page = Va(esp).page_base();
        if self.pagedir.is_present(page) {
            self.pagedir.set_stack_mark(page);
        }
    }

    pub(crate) fn set_exec_file(&self, file: Arc<File>) {
        let mut exec_file = self.exec_file.lock();
        *exec_file = Some(file);
        exec_file.unlock();
    }

    pub(crate) fn install_fd(&self, entry: FdEntry) -> Result<i32, KernelError> {
        let mut files = self.files.lock();
        if files.map.len() >= FD_LIMIT {
            files.unlock();
            return Err(KernelError::TooManyOpenFile);
        }
        let fd = files.next_fd;
        files.next_fd += 1;
        files.map.insert(fd, entry);
        files.unlock();
        Ok(fd)
    }

    pub(crate) fn with_fd<R>(
        &self,
        fd: i32,
        f: impl FnOnce(&mut FdEntry) -> R,
    ) -> Result<R, KernelError> {
        let mut files = self.files.lock();
        let r = files.map.get_mut(&fd).map(f);
        files.unlock();
        r.ok_or(KernelError::BadFileDescriptor)
    }

    pub(crate) fn take_fd(&self, fd: i32) -> Option<FdEntry> {
        let mut files = self.files.lock();
        let entry = files.map.remove(&fd);
        files.unlock();
        entry
    }

    /// Copy user memory into `buf`, faulting pages in on demand.
    pub(crate) fn read_user_raw(
        self: &Arc<Self>,
        kernel: &Arc<Kernel>,
        va: Va,
        buf: &mut [u8],
    ) -> Result<(), KernelError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = Va(va.0.wrapping_add(done));
            if !addr.is_user() {
                return Err(KernelError::BadAddress);
            }
            let chunk = (PAGE_SIZE - addr.page_offset()).min(buf.len() - done);
            if self.pagedir.read(addr, &mut buf[done..done + chunk]) {
                done += chunk;
            } else {
                fault::handle(kernel, self, addr, false)?;
            }
        }
        Ok(())
    }

    /// Copy `bytes` into user memory, faulting pages in on demand.
    pub(crate) fn write_user_raw(
        self: &Arc<Self>,
        kernel: &Arc<Kernel>,
        va: Va,
        bytes: &[u8],
    ) -> Result<(), KernelError> {
        let mut done = 0;
        while done < bytes.len() {
            let addr = Va(va.0.wrapping_add(done));
            if !addr.is_user() {
                return Err(KernelError::BadAddress);
            }
            let chunk = (PAGE_SIZE - addr.page_offset()).min(bytes.len() - done);
            match self.pagedir.write(addr, &bytes[done..done + chunk]) {
                WriteOutcome::Done => done += chunk,
                WriteOutcome::NotPresent | WriteOutcome::ReadOnly => {
                    fault::handle(kernel, self, addr, true)?;
                }
            }
        }
        Ok(())
    }

    /// Read a NUL-terminated string out of user memory.
    pub(crate) fn read_user_cstr(
        self: &Arc<Self>,
        kernel: &Arc<Kernel>,
        va: Va,
    ) -> Result<String, KernelError> {
        let mut out = Vec::new();
        for i in 0..PAGE_SIZE {
            let mut byte = [0u8];
            self.read_user_raw(kernel, Va(va.0.wrapping_add(i)), &mut byte)?;
            if byte[0] == 0 {
                return String::from_utf8(out).map_err(|_| KernelError::InvalidArgument);
            }
            out.push(byte[0]);
        }
        Err(KernelError::NameTooLong)
    }
}

struct ExecSync {
    load_done: Semaphore,
    registered: Semaphore,
    ok: AtomicBool,
    rec: SpinLock<Option<Arc<ChildRec>>>,
}

/// Run `cmdline` as a child of the current process. Returns the child's
/// pid once the child has loaded, or an error when the load failed.
pub fn exec(cmdline: &str) -> Result<Tid, KernelError> {
    let ctx = thread::context();
    let parent = ctx
        .thread
        .process()
        .ok_or(KernelError::OperationNotPermitted)?;
    let program = cmdline
        .split_whitespace()
        .next()
        .ok_or(KernelError::InvalidArgument)?
        .to_string();
    // The child works on its own copy of the command line.
    let cmdline = cmdline.to_string();
    let sync = Arc::new(ExecSync {
        load_done: Semaphore::new(0),
        registered: Semaphore::new(0),
        ok: AtomicBool::new(false),
        rec: SpinLock::new(None),
    });
    let child_sync = sync.clone();
    let kernel = ctx.kernel.clone();
    let cwd = parent.cwd();
    let handle = ThreadBuilder::new(program.clone()).spawn(&ctx.kernel, move || {
        start_process(kernel, cmdline, program, cwd, child_sync)
    });

    sync.load_done.down();
    if !sync.ok.load(Ordering::SeqCst) {
        // Let the failed child run to its exit.
        sync.registered.up();
        return Err(KernelError::NoExec);
    }
    let rec = Arc::new(ChildRec {
        tid: handle.tid,
        sema: Semaphore::new(0),
        status: AtomicI32::new(-1),
        thread: handle.thread().clone(),
    });
    {
        let mut children = parent.children.lock();
        children.push(rec.clone());
        children.unlock();
    }
    {
        let mut slot = sync.rec.lock();
        *slot = Some(rec);
        slot.unlock();
    }
    sync.registered.up();
    Ok(handle.tid)
}

fn start_process(
    kernel: Arc<Kernel>,
    cmdline: String,
    program: String,
    cwd: Sector,
    sync: Arc<ExecSync>,
) {
    let me = thread::current();
    let process = Process::new(&kernel, me.tid, &program, cwd);
    me.task
        .set(process.clone())
        .unwrap_or_else(|_| panic!("process attached twice"));

    let loaded = load::load(&kernel, &process, &cmdline);
    sync.ok.store(loaded.is_ok(), Ordering::SeqCst);
    sync.load_done.up();
    sync.registered.down();
    {
        let mut slot = sync.rec.lock();
        let rec = slot.take();
        slot.unlock();
        let mut parent_rec = process.parent_rec.lock();
        *parent_rec = rec;
        parent_rec.unlock();
    }

    let Ok(result) = loaded else {
        exit(-1);
    };

    // Transfer to "user mode": run the registered body for this program
    // over the freshly built address space.
    let status = match kernel.lookup_program(process.name()) {
        Some(body) => {
            let mut uctx = user::UserCtx::new(kernel.clone(), process, result.entry, result.esp);
            let run = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(&mut uctx)));
            match run {
                Ok(status) => status,
                // An orderly exit unwound through the body; let it finish.
                Err(payload) if thread::is_exit_payload(payload.as_ref()) => {
                    std::panic::resume_unwind(payload)
                }
                // A fault in "user code": the process dies like any other
                // killed process, and its parent observes -1.
                Err(_) => {
                    exit(-1);
                }
            }
        }
        None => 0,
    };
    exit(status);
}

/// Wait for child `pid` to exit and return its status. Returns -1 for a
/// pid that is not an un-waited child of the caller.
pub fn wait(pid: Tid) -> i32 {
    let ctx = thread::context();
    let Some(process) = ctx.thread.process() else {
        return -1;
    };
    let rec = {
        let mut children = process.children.lock();
        let at = children.iter().position(|r| r.tid == pid);
        let rec = at.map(|i| children.remove(i));
        children.unlock();
        rec
    };
    let Some(rec) = rec else {
        return -1;
    };
    rec.sema.down();
    rec.status.load(Ordering::SeqCst)
}

fn request_kill_tree(thread: &Arc<Thread>) {
    if let Some(process) = thread.process() {
        let children = process.children.lock();
        let recs: Vec<_> = children.iter().cloned().collect();
        children.unlock();
        for rec in recs {
            request_kill_tree(&rec.thread);
        }
    }
    thread.request_kill();
}

/// Terminate the current process with `status`: print the exit line,
/// reap every live child, release held locks, close files and mappings,
/// free the address space, signal the parent, and stop the thread.
pub fn exit(status: i32) -> ! {
    let ctx = thread::context();
    ctx.thread.exiting.store(true, Ordering::SeqCst);
    let Some(process) = ctx.thread.process() else {
        thread::exit(status);
    };
    let kernel = &ctx.kernel;
    kernel
        .console()
        .write_line(&format!("{}: exit({})", process.name(), status));

    // Children go first: ask the whole subtree to stop, then join each
    // direct child.
    loop {
        let rec = {
            let mut children = process.children.lock();
            let rec = children.pop();
            children.unlock();
            rec
        };
        let Some(rec) = rec else {
            break;
        };
        request_kill_tree(&rec.thread);
        rec.sema.down();
    }

    crate::sync::lock::release_all(&ctx);

    // Open files, then mappings (writing dirty pages home), then the
    // write-denied executable.
    {
        let mut files = process.files.lock();
        let all = core::mem::take(&mut files.map);
        files.unlock();
        drop(all);
    }
    mmap::munmap_all(kernel, &process);
    {
        let mut exec_file = process.exec_file.lock();
        let file = exec_file.take();
        exec_file.unlock();
        drop(file);
    }

    // The address space: frame records, swap slots still held by
    // supplemental entries, then the page directory and its frames.
    kernel.frames().delete_all_for(&process.pagedir);
    for (_, entry) in process.supp.take_all() {
        if entry.swapped {
            kernel.swap().set(entry.swap_slot, false);
        }
    }
    process.pagedir.destroy();

    // Tell the parent.
    {
        let mut parent_rec = process.parent_rec.lock();
        let rec = parent_rec.take();
        parent_rec.unlock();
        if let Some(rec) = rec {
            rec.status.store(status, Ordering::SeqCst);
            rec.sema.up();
        }
    }
    thread::exit(status);
}

/// Exit with status -1 on behalf of a thread the kernel decided to kill.
pub(crate) fn exit_killed() -> ! {
    let ctx = thread::context();
    ctx.thread.exiting.store(true, Ordering::SeqCst);
    if ctx.thread.process().is_some() {
        exit(-1);
    } else {
        thread::exit(-1);
    }
}

/// Spawn the initial process: a kernel thread with an empty address space
/// whose "user code" is the given body. Everything a user program can do
/// through [`user::UserCtx`] is available to it.
pub fn spawn_init(
    kernel: &Arc<Kernel>,
    body: impl FnOnce(&mut user::UserCtx) -> i32 + Send + 'static,
) -> crate::thread::JoinHandle {
    let k = kernel.clone();
    ThreadBuilder::new("init").spawn(kernel, move || {
        let me = thread::current();
        let process = Process::new(&k, me.tid, "init", ROOT_SECTOR);
        me.task
            .set(process.clone())
            .unwrap_or_else(|_| panic!("process attached twice"));
        let mut uctx = user::UserCtx::new(k, process, 0, 0);
        let status = body(&mut uctx);
        exit(status);
    })
}
