//! Build a SeOS file-system image on the host.
//!
//! ```text
//! mkfs IMAGE SECTORS [FILE..]
//! ```
//!
//! Formats `IMAGE` as a disk of `SECTORS` sectors and copies each named
//! host file into the root directory under its base name. The resulting
//! image mounts unformatted on a booted kernel.

use seos::{
    dev::{Disk, FileDisk},
    fs::{FileSys, ROOT_SECTOR},
};
use std::path::Path;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        eprintln!("usage: mkfs IMAGE SECTORS [FILE..]");
        std::process::exit(1);
    }
    let image = Path::new(&args[0]);
    let sectors: usize = args[1].parse().unwrap_or_else(|_| {
        eprintln!("mkfs: bad sector count {:?}", args[1]);
        std::process::exit(1);
    });

    let disk = FileDisk::create(image, sectors).unwrap_or_else(|e| {
        eprintln!("mkfs: cannot create {}: {e}", image.display());
        std::process::exit(1);
    });
    let fs = FileSys::mount(Disk::new(disk), true).unwrap_or_else(|e| {
        eprintln!("mkfs: format failed: {e:?}");
        std::process::exit(1);
    });

    for path in &args[2..] {
        let path = Path::new(path);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_else(|| {
                eprintln!("mkfs: bad file name {}", path.display());
                std::process::exit(1);
            });
        let bytes = std::fs::read(path).unwrap_or_else(|e| {
            eprintln!("mkfs: cannot read {}: {e}", path.display());
            std::process::exit(1);
        });
        fs.create(ROOT_SECTOR, name, 0).unwrap_or_else(|e| {
            eprintln!("mkfs: cannot create {name}: {e:?}");
            std::process::exit(1);
        });
        let f = fs.open_file(ROOT_SECTOR, name).unwrap();
        if f.write(&bytes) != bytes.len() {
            eprintln!("mkfs: image full while writing {name}");
            std::process::exit(1);
        }
        println!("{name}: {} bytes", bytes.len());
    }

    fs.sync().unwrap_or_else(|e| {
        eprintln!("mkfs: flush failed: {e:?}");
        std::process::exit(1);
    });
    println!(
        "{}: {} sectors, {} files",
        image.display(),
        sectors,
        args.len() - 2
    );
}
