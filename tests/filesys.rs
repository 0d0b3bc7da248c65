//! File-system scenarios over the public surface: the write-behind
//! daemon, orderly shutdown, and the write-denial protocol.

use seos::{
    dev::{Disk, MemDisk, Sector, SECTOR_SIZE},
    fs::{FileSys, ROOT_SECTOR},
    KernelBuilder,
};

#[test]
fn sparse_write_truncated_read() {
    let fs = FileSys::mount(Disk::new(MemDisk::new(256)), true).unwrap();
    fs.create(ROOT_SECTOR, "a", 0).unwrap();
    let f = fs.open_file(ROOT_SECTOR, "a").unwrap();
    assert_eq!(f.write(b"ABCDE"), 5);
    drop(f);
    let f = fs.open_file(ROOT_SECTOR, "a").unwrap();
    let mut out = [0u8; 10];
    assert_eq!(f.read(&mut out), 5);
    assert_eq!(&out[..5], b"ABCDE");
    assert_eq!(&out[5..], &[0; 5]);
}

#[test]
fn write_behind_daemon_flushes() {
    let disk = Disk::new(MemDisk::new(256));
    let kernel = KernelBuilder::new()
        .filesys_disk(disk.clone())
        .format()
        .build()
        .unwrap();
    let fs = kernel.filesys().unwrap();
    fs.create(ROOT_SECTOR, "wb", 0).unwrap();
    let f = fs.open_file(ROOT_SECTOR, "wb").unwrap();
    let pattern = [0xEEu8; SECTOR_SIZE];
    assert_eq!(f.write(&pattern), SECTOR_SIZE);

    // No explicit flush: the write-behind thread must carry the sector to
    // the disk within a couple of periods.
    let mut found = false;
    for _ in 0..40 {
        std::thread::sleep(std::time::Duration::from_millis(50));
        for s in 0..disk.sector_count() {
            let mut raw = [0u8; SECTOR_SIZE];
            disk.read(Sector(s as u32), &mut raw).unwrap();
            if raw == pattern {
                found = true;
                break;
            }
        }
        if found {
            break;
        }
    }
    assert!(found, "dirty sector never reached the disk");
    kernel.halt();
}

#[test]
fn halt_persists_everything() {
    let disk = Disk::new(MemDisk::new(256));
    {
        let kernel = KernelBuilder::new()
            .filesys_disk(disk.clone())
            .format()
            .build()
            .unwrap();
        let fs = kernel.filesys().unwrap();
        fs.mkdir(ROOT_SECTOR, "sub").unwrap();
        fs.create(ROOT_SECTOR, "/sub/keep", 0).unwrap();
        let f = fs.open_file(ROOT_SECTOR, "/sub/keep").unwrap();
        f.write(b"over a power cycle");
        drop(f);
        kernel.halt();
    }
    // A fresh mount without formatting sees the same tree and contents,
    // and the free map still accounts every live sector.
    let fs = FileSys::mount(disk, false).unwrap();
    let f = fs.open_file(ROOT_SECTOR, "/sub/keep").unwrap();
    let mut out = vec![0u8; 64];
    let n = f.read(&mut out);
    assert_eq!(&out[..n], b"over a power cycle");
    drop(f);
    fs.create(ROOT_SECTOR, "/sub/more", 2048).unwrap();
    let f = fs.open_file(ROOT_SECTOR, "/sub/more").unwrap();
    assert_eq!(f.length(), 2048);
}

#[test]
fn deny_write_protocol() {
    let fs = FileSys::mount(Disk::new(MemDisk::new(256)), true).unwrap();
    fs.create(ROOT_SECTOR, "x", 0).unwrap();
    let denier = fs.open_file(ROOT_SECTOR, "x").unwrap();
    denier.deny_write();
    let other = fs.open_file(ROOT_SECTOR, "x").unwrap();
    assert_eq!(other.write(b"nope"), 0);
    // Dropping the denying handle re-enables writes.
    drop(denier);
    assert_eq!(other.write(b"yes!"), 4);
}

#[test]
fn image_file_round_trip() {
    // The same tree a kernel would build survives in a host image file.
    let path = std::env::temp_dir().join(format!("seos-image-{}", std::process::id()));
    {
        let disk = Disk::new(seos::dev::FileDisk::create(&path, 256).unwrap());
        let fs = FileSys::mount(disk, true).unwrap();
        fs.create(ROOT_SECTOR, "img", 0).unwrap();
        let f = fs.open_file(ROOT_SECTOR, "img").unwrap();
        assert_eq!(f.write(b"on real bytes"), 13);
        drop(f);
        fs.sync().unwrap();
    }
    {
        let disk = Disk::new(seos::dev::FileDisk::open(&path).unwrap());
        let fs = FileSys::mount(disk, false).unwrap();
        let f = fs.open_file(ROOT_SECTOR, "img").unwrap();
        let mut out = [0u8; 13];
        assert_eq!(f.read(&mut out), 13);
        assert_eq!(&out, b"on real bytes");
    }
    let _ = std::fs::remove_file(&path);
}
