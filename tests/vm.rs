//! Virtual-memory scenarios: lazy segment loading, stack growth, swap
//! round trips under memory pressure, and memory-mapped files.

use seos::{
    fs::ROOT_SECTOR,
    mm::PAGE_SIZE,
    proc::{self, elf::ImageBuilder, user::UserCtx},
    syscall::SysNo,
    Kernel, KernelBuilder,
};
use std::sync::Arc;

const SEG_BASE: usize = 0x0804_8000;

fn install_image(kernel: &Arc<Kernel>, name: &str, image: &[u8]) {
    let fs = kernel.filesys().unwrap();
    fs.create(ROOT_SECTOR, name, 0).unwrap();
    let f = fs.open_file(ROOT_SECTOR, name).unwrap();
    assert_eq!(f.write(image), image.len());
}

fn push_cstr(ctx: &mut UserCtx, s: &str) -> usize {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    ctx.push(&bytes)
}

fn seg_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 13 % 251) as u8).collect()
}

#[test]
fn segments_load_lazily_and_read_back() {
    let kernel = KernelBuilder::new()
        .fresh_filesys(512)
        .fresh_swap(16)
        .build()
        .unwrap();
    let data = seg_pattern(5000);
    let image = ImageBuilder::new()
        .entry(SEG_BASE as u32)
        .segment(SEG_BASE as u32, data.clone(), 8192, false)
        .build();
    install_image(&kernel, "seg", &image);
    kernel.register_program("seg", move |ctx| {
        assert_eq!(ctx.entry, SEG_BASE);
        // Nothing is resident before the first touch.
        assert_eq!(ctx.process().pagedir.resident_count(), 1, "stack only");
        let mut got = vec![0u8; 5000];
        ctx.read(SEG_BASE, &mut got);
        assert_eq!(got, seg_pattern(5000));
        // The tail of the last page is zero-filled bss.
        let mut tail = [0xffu8; 16];
        ctx.read(SEG_BASE + 6000, &mut tail);
        assert_eq!(tail, [0u8; 16]);
        // The running executable refuses writes.
        let name = push_cstr(ctx, "seg");
        let fd = ctx.syscall(SysNo::Open, [name, 0, 0]);
        assert!(fd >= 2);
        let junk = push_cstr(ctx, "junk");
        assert_eq!(ctx.syscall(SysNo::Write, [fd as usize, junk, 4]), 0);
        0
    });
    let init = proc::spawn_init(&kernel, |_| {
        let pid = proc::exec("seg").unwrap();
        proc::wait(pid)
    });
    assert_eq!(init.join(), 0);
}

#[test]
fn write_to_readonly_segment_kills() {
    let kernel = KernelBuilder::new()
        .fresh_filesys(512)
        .fresh_swap(16)
        .build()
        .unwrap();
    let image = ImageBuilder::new()
        .entry(SEG_BASE as u32)
        .segment(SEG_BASE as u32, seg_pattern(100), 4096, false)
        .build();
    install_image(&kernel, "wseg", &image);
    kernel.register_program("wseg", |ctx| {
        let mut byte = [0u8];
        ctx.read(SEG_BASE, &mut byte);
        // The page is resident and read-only; storing to it is a rights
        // violation.
        ctx.write(SEG_BASE, b"!");
        unreachable!()
    });
    let init = proc::spawn_init(&kernel, |_| {
        let pid = proc::exec("wseg").unwrap();
        assert_eq!(proc::wait(pid), -1);
        0
    });
    assert_eq!(init.join(), 0);
}

#[test]
fn stack_growth_heuristic() {
    let kernel = KernelBuilder::new()
        .fresh_filesys(512)
        .fresh_swap(16)
        .build()
        .unwrap();
    install_image(
        &kernel,
        "stackgrow",
        &ImageBuilder::new().entry(SEG_BASE as u32).build(),
    );
    install_image(
        &kernel,
        "stackkill",
        &ImageBuilder::new().entry(SEG_BASE as u32).build(),
    );
    kernel.register_program("stackgrow", |ctx| {
        // An access 32 bytes below the stack pointer grows the stack.
        ctx.set_esp(0xbfff_f000);
        ctx.write(0xbfff_efe0, b"push");
        let mut back = [0u8; 4];
        ctx.read(0xbfff_efe0, &mut back);
        assert_eq!(&back, b"push");
        0
    });
    kernel.register_program("stackkill", |ctx| {
        // An access far below the stack pointer is no stack growth.
        ctx.set_esp(0xbfff_f000);
        let mut junk = [0u8; 4];
        ctx.read(0xbffe_0000, &mut junk);
        unreachable!()
    });
    let init = proc::spawn_init(&kernel, |_| {
        let grow = proc::exec("stackgrow").unwrap();
        assert_eq!(proc::wait(grow), 0);
        let kill = proc::exec("stackkill").unwrap();
        assert_eq!(proc::wait(kill), -1);
        0
    });
    assert_eq!(init.join(), 0);
}

#[test]
fn swap_round_trip_under_pressure() {
    // 8 user frames, 17 stack pages touched: eviction must kick in and
    // every byte must survive the trip through swap.
    let kernel = KernelBuilder::new()
        .fresh_filesys(512)
        .fresh_swap(64)
        .user_pages(8)
        .build()
        .unwrap();
    install_image(
        &kernel,
        "thrash",
        &ImageBuilder::new().entry(SEG_BASE as u32).build(),
    );
    let kernel2 = kernel.clone();
    kernel.register_program("thrash", move |ctx| {
        const PAGES: usize = 16;
        let top = 0xbfff_f000usize;
        for i in 0..PAGES {
            let esp = top - i * PAGE_SIZE;
            ctx.set_esp(esp);
            let marker = [(i as u8) ^ 0x5a; 64];
            ctx.write(esp, &marker);
        }
        assert!(
            kernel2.swap().used_count() > 0,
            "no page ever went to swap"
        );
        for i in 0..PAGES {
            let addr = top - i * PAGE_SIZE;
            let mut got = [0u8; 64];
            ctx.read(addr, &mut got);
            assert_eq!(got, [(i as u8) ^ 0x5a; 64], "page {i}");
        }
        0
    });
    let init = proc::spawn_init(&kernel, |_| {
        let pid = proc::exec("thrash").unwrap();
        proc::wait(pid)
    });
    assert_eq!(init.join(), 0);
    // Exit returned every resource: no resident frames, a full pool, an
    // empty swap.
    assert_eq!(kernel.frames().len(), 0);
    assert_eq!(kernel.pool().available(), kernel.pool().capacity());
    assert_eq!(kernel.swap().used_count(), 0);
}

#[test]
fn mmap_round_trip() {
    let kernel = KernelBuilder::new()
        .fresh_filesys(512)
        .fresh_swap(16)
        .build()
        .unwrap();
    install_image(
        &kernel,
        "mapper",
        &ImageBuilder::new().entry(SEG_BASE as u32).build(),
    );
    kernel.register_program("mapper", |ctx| {
        const MAP: usize = 0x9000_0000;
        let name = push_cstr(ctx, "m.dat");
        assert_eq!(ctx.syscall(SysNo::Create, [name, 0, 0]), 1);
        let fd = ctx.syscall(SysNo::Open, [name, 0, 0]) as usize;
        let content = seg_pattern(5000);
        let buf = ctx.push(&content);
        assert_eq!(
            ctx.syscall(SysNo::Write, [fd, buf, content.len()]),
            content.len() as isize
        );

        // Bad mappings are refused.
        assert_eq!(ctx.syscall(SysNo::Mmap, [fd, MAP + 7, 0]), -1);
        assert_eq!(ctx.syscall(SysNo::Mmap, [fd, 0, 0]), -1);

        let mid = ctx.syscall(SysNo::Mmap, [fd, MAP, 0]);
        assert!(mid >= 0);
        // The same range cannot be mapped twice.
        assert_eq!(ctx.syscall(SysNo::Mmap, [fd, MAP, 0]), -1);

        // Reads through the mapping see the file.
        let mut got = vec![0u8; 5000];
        ctx.read(MAP, &mut got);
        assert_eq!(got, seg_pattern(5000));

        // Writes through the mapping reach the file after munmap.
        ctx.write(MAP + 200, b"MMAP");
        assert_eq!(ctx.syscall(SysNo::Munmap, [mid as usize, 0, 0]), 0);
        ctx.syscall(SysNo::Seek, [fd, 200, 0]);
        let back = ctx.push(&[0u8; 4]);
        assert_eq!(ctx.syscall(SysNo::Read, [fd, back, 4]), 4);
        let mut four = [0u8; 4];
        ctx.read(back, &mut four);
        assert_eq!(&four, b"MMAP");
        0
    });
    let init = proc::spawn_init(&kernel, |_| {
        let pid = proc::exec("mapper").unwrap();
        proc::wait(pid)
    });
    assert_eq!(init.join(), 0);
}
