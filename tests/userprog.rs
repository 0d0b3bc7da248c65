//! Process-lifecycle scenarios: exec and wait, argument passing, the
//! console exit line, kill on bad pointers, and the file system-call
//! surface.

use seos::{
    fs::ROOT_SECTOR,
    proc::{self, elf::ImageBuilder, user::UserCtx},
    syscall::SysNo,
    Kernel, KernelBuilder,
};
use std::sync::Arc;

/// Write a minimal executable called `name` into the file system.
fn install_program(kernel: &Arc<Kernel>, name: &str) {
    let image = ImageBuilder::new().entry(0x0804_8000).build();
    let fs = kernel.filesys().unwrap();
    fs.create(ROOT_SECTOR, name, 0).unwrap();
    let f = fs.open_file(ROOT_SECTOR, name).unwrap();
    assert_eq!(f.write(&image), image.len());
}

fn boot() -> Arc<Kernel> {
    KernelBuilder::new()
        .fresh_filesys(512)
        .fresh_swap(16)
        .build()
        .unwrap()
}

fn push_cstr(ctx: &mut UserCtx, s: &str) -> usize {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    ctx.push(&bytes)
}

#[test]
fn exec_wait_status_propagation() {
    let kernel = boot();
    install_program(&kernel, "parent");
    install_program(&kernel, "child");
    kernel.register_program("child", |ctx| {
        ctx.syscall(SysNo::Exit, [42, 0, 0]);
        unreachable!()
    });
    kernel.register_program("parent", |ctx| {
        let cmd = push_cstr(ctx, "child");
        let pid = ctx.syscall(SysNo::Exec, [cmd, 0, 0]);
        assert!(pid > 0, "exec failed: {pid}");
        assert_eq!(ctx.syscall(SysNo::Wait, [pid as usize, 0, 0]), 42);
        // A second wait on the same pid reports failure.
        assert_eq!(ctx.syscall(SysNo::Wait, [pid as usize, 0, 0]), -1);
        0
    });
    let init = proc::spawn_init(&kernel, |_| {
        let pid = proc::exec("parent").unwrap();
        assert_eq!(proc::wait(pid), 0);
        0
    });
    assert_eq!(init.join(), 0);
    let console = kernel.console().contents();
    assert!(console.contains("child: exit(42)"), "console: {console}");
    assert!(console.contains("parent: exit(0)"), "console: {console}");
}

#[test]
fn exec_of_missing_program_fails() {
    let kernel = boot();
    let init = proc::spawn_init(&kernel, |_| {
        assert!(proc::exec("does-not-exist").is_err());
        0
    });
    assert_eq!(init.join(), 0);
}

#[test]
fn argv_reaches_the_program() {
    let kernel = boot();
    install_program(&kernel, "echo");
    kernel.register_program("echo", |ctx| {
        // The convention: esp -> [ret, argc, argv], argv[argc] == NULL.
        let esp = ctx.esp();
        assert_eq!(ctx.read_u32(esp), 0, "return address");
        assert_eq!(ctx.arg_count(), 3);
        assert_eq!(ctx.arg_str(0), "echo");
        assert_eq!(ctx.arg_str(1), "alpha");
        assert_eq!(ctx.arg_str(2), "beta");
        let argv = ctx.read_u32(esp + 8) as usize;
        assert_eq!(ctx.read_u32(argv + 4 * 3), 0, "argv sentinel");
        0
    });
    let init = proc::spawn_init(&kernel, |_| {
        let pid = proc::exec("echo alpha beta").unwrap();
        proc::wait(pid)
    });
    assert_eq!(init.join(), 0);
}

#[test]
fn bad_pointer_kills_the_process() {
    let kernel = boot();
    install_program(&kernel, "bad");
    kernel.register_program("bad", |ctx| {
        // A write whose buffer sits on the null page never returns.
        ctx.syscall(SysNo::Write, [1, 0x10, 4]);
        unreachable!()
    });
    let init = proc::spawn_init(&kernel, |_| {
        let pid = proc::exec("bad").unwrap();
        assert_eq!(proc::wait(pid), -1);
        0
    });
    assert_eq!(init.join(), 0);
    assert!(kernel.console().contents().contains("bad: exit(-1)"));
}

#[test]
fn unknown_syscall_number_kills() {
    let kernel = boot();
    install_program(&kernel, "wild");
    kernel.register_program("wild", |ctx| {
        ctx.syscall_raw(777, [0, 0, 0]);
        unreachable!()
    });
    let init = proc::spawn_init(&kernel, |_| {
        let pid = proc::exec("wild").unwrap();
        assert_eq!(proc::wait(pid), -1);
        0
    });
    assert_eq!(init.join(), 0);
}

#[test]
fn file_syscalls_round_trip() {
    let kernel = boot();
    install_program(&kernel, "fio");
    kernel.register_program("fio", |ctx| {
        let name = push_cstr(ctx, "a");
        assert_eq!(ctx.syscall(SysNo::Create, [name, 0, 0]), 1);
        // Creating the same name twice fails.
        assert_eq!(ctx.syscall(SysNo::Create, [name, 0, 0]), 0);

        let fd = ctx.syscall(SysNo::Open, [name, 0, 0]);
        assert!(fd >= 2);
        let data = ctx.push(b"ABCDE");
        assert_eq!(ctx.syscall(SysNo::Write, [fd as usize, data, 5]), 5);
        assert_eq!(ctx.syscall(SysNo::Close, [fd as usize, 0, 0]), 0);

        let fd = ctx.syscall(SysNo::Open, [name, 0, 0]) as usize;
        assert_eq!(ctx.syscall(SysNo::Filesize, [fd, 0, 0]), 5);
        let buf = ctx.push(&[0u8; 10]);
        assert_eq!(ctx.syscall(SysNo::Read, [fd, buf, 10]), 5);
        let mut out = [0u8; 5];
        ctx.read(buf, &mut out);
        assert_eq!(&out, b"ABCDE");
        // Reads at end of file return 0; negative lengths do nothing.
        assert_eq!(ctx.syscall(SysNo::Read, [fd, buf, 10]), 0);
        assert_eq!(
            ctx.syscall(SysNo::Read, [fd, buf, (-3isize) as usize]),
            0
        );

        ctx.syscall(SysNo::Seek, [fd, 2, 0]);
        assert_eq!(ctx.syscall(SysNo::Tell, [fd, 0, 0]), 2);
        assert_eq!(ctx.syscall(SysNo::Read, [fd, buf, 1]), 1);
        let mut one = [0u8; 1];
        ctx.read(buf, &mut one);
        assert_eq!(&one, b"C");
        assert_eq!(ctx.syscall(SysNo::Close, [fd, 0, 0]), 0);

        assert_eq!(ctx.syscall(SysNo::Remove, [name, 0, 0]), 1);
        assert_eq!(ctx.syscall(SysNo::Open, [name, 0, 0]), -1);
        7
    });
    let init = proc::spawn_init(&kernel, |_| {
        let pid = proc::exec("fio").unwrap();
        proc::wait(pid)
    });
    assert_eq!(init.join(), 7);
}

#[test]
fn directory_syscalls() {
    let kernel = boot();
    install_program(&kernel, "dirs");
    kernel.register_program("dirs", |ctx| {
        let d = push_cstr(ctx, "d");
        assert_eq!(ctx.syscall(SysNo::Mkdir, [d, 0, 0]), 1);
        assert_eq!(ctx.syscall(SysNo::Chdir, [d, 0, 0]), 1);
        let x = push_cstr(ctx, "x");
        assert_eq!(ctx.syscall(SysNo::Create, [x, 16, 0]), 1);
        // The file resolves through an absolute path too.
        let abs = push_cstr(ctx, "/d/x");
        let fd = ctx.syscall(SysNo::Open, [abs, 0, 0]);
        assert!(fd >= 2);
        assert_eq!(ctx.syscall(SysNo::Isdir, [fd as usize, 0, 0]), 0);

        let root = push_cstr(ctx, "/");
        let rfd = ctx.syscall(SysNo::Open, [root, 0, 0]) as usize;
        assert_eq!(ctx.syscall(SysNo::Isdir, [rfd, 0, 0]), 1);
        assert_eq!(ctx.syscall(SysNo::Inumber, [rfd, 0, 0]), 1);
        // Enumerate the root: "d" and "dirs" and nothing else; dot
        // entries are skipped.
        let name_buf = ctx.push(&[0u8; 32]);
        let mut seen = Vec::new();
        while ctx.syscall(SysNo::Readdir, [rfd, name_buf, 0]) == 1 {
            let mut raw = [0u8; 32];
            ctx.read(name_buf, &mut raw);
            let end = raw.iter().position(|&b| b == 0).unwrap();
            seen.push(String::from_utf8_lossy(&raw[..end]).to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["d".to_string(), "dirs".to_string()]);

        // A non-empty directory refuses removal; empty it first.
        let dabs = push_cstr(ctx, "/d");
        assert_eq!(ctx.syscall(SysNo::Remove, [dabs, 0, 0]), 0);
        assert_eq!(ctx.syscall(SysNo::Remove, [abs, 0, 0]), 1);
        0
    });
    let init = proc::spawn_init(&kernel, |_| {
        let pid = proc::exec("dirs").unwrap();
        proc::wait(pid)
    });
    assert_eq!(init.join(), 0);
}
