//! Boot a SeOS machine and run a small demonstration workload: format
//! the file system, load a user program, let it exercise files, a
//! directory, a memory mapping and a child process, and power off.

use seos::{
    proc::{self, elf::ImageBuilder, user::UserCtx},
    syscall::SysNo,
    KernelBuilder,
};

fn push_cstr(ctx: &mut UserCtx, s: &str) -> usize {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    ctx.push(&bytes)
}

fn main() {
    let kernel = KernelBuilder::new()
        .parse_args("-f")
        .fresh_filesys(2048)
        .fresh_swap(64)
        .user_pages(64)
        .mirror_console()
        .build()
        .expect("boot failed");

    // Seed the file system with the two executables.
    let image = ImageBuilder::new().entry(0x0804_8000).build();
    let fs = kernel.filesys().expect("no file system");
    for name in ["shell", "greeter"] {
        fs.create(seos::fs::ROOT_SECTOR, name, 0).unwrap();
        let f = fs.open_file(seos::fs::ROOT_SECTOR, name).unwrap();
        assert_eq!(f.write(&image), image.len());
    }

    kernel.register_program("greeter", |ctx| {
        let who = ctx.arg_str(1);
        let line = format!("hello, {who}!\n");
        let buf = ctx.push(line.as_bytes());
        ctx.syscall(SysNo::Write, [1, buf, line.len()]);
        42
    });

    kernel.register_program("shell", |ctx| {
        // A file round trip.
        let name = push_cstr(ctx, "notes.txt");
        ctx.syscall(SysNo::Create, [name, 0, 0]);
        let fd = ctx.syscall(SysNo::Open, [name, 0, 0]) as usize;
        let text = push_cstr(ctx, "written through the cache");
        ctx.syscall(SysNo::Write, [fd, text, 25]);

        // A directory.
        let dir = push_cstr(ctx, "logs");
        ctx.syscall(SysNo::Mkdir, [dir, 0, 0]);

        // A memory mapping over the file.
        let mid = ctx.syscall(SysNo::Mmap, [fd, 0x9000_0000, 0]);
        if mid >= 0 {
            let mut head = [0u8; 7];
            ctx.read(0x9000_0000, &mut head);
            assert_eq!(&head, b"written");
            ctx.syscall(SysNo::Munmap, [mid as usize, 0, 0]);
        }
        ctx.syscall(SysNo::Close, [fd, 0, 0]);

        // A child process, joined for its status.
        let cmd = push_cstr(ctx, "greeter world");
        let pid = ctx.syscall(SysNo::Exec, [cmd, 0, 0]);
        ctx.syscall(SysNo::Wait, [pid as usize, 0, 0]) as i32
    });

    let init = proc::spawn_init(&kernel, |_| {
        let pid = proc::exec("shell").expect("shell did not load");
        proc::wait(pid)
    });
    let status = init.join();
    println!("init returned {status}");
    kernel.halt();
}
