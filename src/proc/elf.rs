//! ELF executables.
//!
//! The Executable and Linkable Format is the standard container for
//! executables, object code and shared libraries. The loader only cares
//! about the executable view: the file header, which identifies the class
//! and machine and locates the program-header table, and the program
//! headers, which describe the segments to map at run time.

use crate::{fs::file::File, KernelError};
use static_assertions::const_assert_eq;
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes};

/// Loadable segment.
pub const PT_LOAD: u32 = 1;
/// Dynamic linking information; rejected in executables here.
pub const PT_DYNAMIC: u32 = 2;
/// Interpreter path; rejected in executables here.
pub const PT_INTERP: u32 = 3;
/// Reserved; rejected in executables here.
pub const PT_SHLIB: u32 = 5;

bitflags::bitflags! {
    /// Segment permission flags of a program header.
    pub struct PFlags: u32 {
        /// Segment is executable.
        const EXECUTABLE = 1 << 0;
        /// Segment is writable.
        const WRITE = 1 << 1;
        /// Segment is readable.
        const READ = 1 << 2;
    }
}

/// The ELF file header, 32-bit class.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct ElfHeader {
    /// Identification bytes: magic, class, endianness, version, ABI.
    pub e_ident: [u8; 16],
    /// Object file type; `2` is an executable.
    pub e_type: u16,
    /// Target instruction set.
    pub e_machine: u16,
    /// ELF version.
    pub e_version: u32,
    /// Entry point virtual address.
    pub e_entry: u32,
    /// Offset of the program-header table.
    pub e_phoff: u32,
    /// Offset of the section-header table.
    pub e_shoff: u32,
    /// Processor-specific flags.
    pub e_flags: u32,
    /// Size of this header.
    pub e_ehsize: u16,
    /// Size of one program-header entry.
    pub e_phentsize: u16,
    /// Number of program-header entries.
    pub e_phnum: u16,
    /// Size of one section-header entry.
    pub e_shentsize: u16,
    /// Number of section-header entries.
    pub e_shnum: u16,
    /// Index of the section-name section.
    pub e_shstrndx: u16,
}
const_assert_eq!(core::mem::size_of::<ElfHeader>(), 52);

/// One program header, 32-bit class.
#[repr(C)]
#[derive(Clone, Copy, Debug, AsBytes, FromBytes)]
pub struct Phdr {
    /// Segment type.
    pub p_type: u32,
    /// Offset of the segment in the file.
    pub p_offset: u32,
    /// Virtual address the segment maps at.
    pub p_vaddr: u32,
    /// Physical address; unused.
    pub p_paddr: u32,
    /// Bytes of the segment present in the file.
    pub p_filesz: u32,
    /// Bytes of the segment in memory.
    pub p_memsz: u32,
    /// Permission flags.
    pub p_flags: u32,
    /// Alignment.
    pub p_align: u32,
}
const_assert_eq!(core::mem::size_of::<Phdr>(), 32);

impl Phdr {
    /// Whether the segment is writable in memory.
    pub fn writable(&self) -> bool {
        PFlags::from_bits_truncate(self.p_flags).contains(PFlags::WRITE)
    }
}

/// An executable backed by a file in the file system.
pub struct Elf {
    /// The parsed file header.
    pub header: ElfHeader,
    /// The backing file.
    pub file: Arc<File>,
}

impl Elf {
    /// Parse and validate the header of `file`.
    ///
    /// # Validity checks
    /// - ELF magic (`0x7f 'E' 'L' 'F'`), 32-bit class, little-endian.
    /// - Executable type (`e_type == 2`) for the x86 machine
    ///   (`e_machine == 3`).
    /// - A sane program-header table: entry size 32, at most 1024 entries.
    pub fn from_file(file: Arc<File>) -> Result<Elf, KernelError> {
        let mut header = ElfHeader::zeroed();
        if file.read_at(header.as_bytes_mut(), 0) != core::mem::size_of::<ElfHeader>() {
            return Err(KernelError::NoExec);
        }
        let ident_ok = header.e_ident[..7] == *b"\x7fELF\x01\x01\x01";
        if !ident_ok
            || header.e_type != 2
            || header.e_machine != 3
            || header.e_version != 1
            || header.e_phentsize as usize != core::mem::size_of::<Phdr>()
            || header.e_phnum > 1024
        {
            return Err(KernelError::NoExec);
        }
        Ok(Elf { header, file })
    }

    /// Read the program-header table.
    pub fn phdrs(&self) -> Result<Vec<Phdr>, KernelError> {
        let mut out = Vec::with_capacity(self.header.e_phnum as usize);
        let mut offset = self.header.e_phoff as usize;
        if offset > self.file.length() {
            return Err(KernelError::NoExec);
        }
        for _ in 0..self.header.e_phnum {
            let mut phdr = Phdr::zeroed();
            if self.file.read_at(phdr.as_bytes_mut(), offset) != core::mem::size_of::<Phdr>() {
                return Err(KernelError::NoExec);
            }
            offset += core::mem::size_of::<Phdr>();
            out.push(phdr);
        }
        Ok(out)
    }
}

impl ElfHeader {
    fn zeroed() -> Self {
        Self {
            e_ident: [0; 16],
            e_type: 0,
            e_machine: 0,
            e_version: 0,
            e_entry: 0,
            e_phoff: 0,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: 0,
            e_phentsize: 0,
            e_phnum: 0,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }
}

impl Phdr {
    fn zeroed() -> Self {
        Self {
            p_type: 0,
            p_offset: 0,
            p_vaddr: 0,
            p_paddr: 0,
            p_filesz: 0,
            p_memsz: 0,
            p_flags: 0,
            p_align: 0,
        }
    }
}

/// Assembles a minimal executable image in memory. The image tools and
/// the test suite use this to seed the file system with programs.
pub struct ImageBuilder {
    segments: Vec<(u32, Vec<u8>, u32, bool)>,
    entry: u32,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// Start an image with entry point 0.
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            entry: 0,
        }
    }

    /// Set the entry point.
    pub fn entry(mut self, entry: u32) -> Self {
        self.entry = entry;
        self
    }

    /// Add a loadable segment at `vaddr` whose file bytes are `data`,
    /// occupying `memsz` bytes in memory.
    pub fn segment(mut self, vaddr: u32, data: Vec<u8>, memsz: u32, writable: bool) -> Self {
        self.segments.push((vaddr, data, memsz, writable));
        self
    }

    /// Produce the image bytes.
    pub fn build(self) -> Vec<u8> {
        let ehsize = core::mem::size_of::<ElfHeader>() as u32;
        let phsize = core::mem::size_of::<Phdr>() as u32;
        let phnum = self.segments.len() as u16;
        // Layout: header, program headers, then segment data page-aligned
        // so that p_offset and p_vaddr share their page offset.
        let mut data_offset = ehsize + phsize * phnum as u32;
        let mut phdrs = Vec::new();
        let mut blobs = Vec::new();
        for (vaddr, data, memsz, writable) in &self.segments {
            let align_to = vaddr % crate::mm::PAGE_SIZE as u32;
            let page = crate::mm::PAGE_SIZE as u32;
            let mut at = data_offset;
            if at % page != align_to {
                at += (align_to + page - at % page) % page;
            }
            let mut flags = PFlags::READ;
            if *writable {
                flags |= PFlags::WRITE;
            }
            phdrs.push(Phdr {
                p_type: PT_LOAD,
                p_offset: at,
                p_vaddr: *vaddr,
                p_paddr: *vaddr,
                p_filesz: data.len() as u32,
                p_memsz: *memsz,
                p_flags: flags.bits(),
                p_align: page,
            });
            blobs.push((at, data.clone()));
            data_offset = at + data.len() as u32;
        }
        let header = ElfHeader {
            e_ident: *b"\x7fELF\x01\x01\x01\0\0\0\0\0\0\0\0\0",
            e_type: 2,
            e_machine: 3,
            e_version: 1,
            e_entry: self.entry,
            e_phoff: ehsize,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: ehsize as u16,
            e_phentsize: phsize as u16,
            e_phnum: phnum,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        let mut image = Vec::new();
        image.extend_from_slice(header.as_bytes());
        for phdr in &phdrs {
            image.extend_from_slice(phdr.as_bytes());
        }
        for (at, data) in blobs {
            if image.len() < at as usize {
                image.resize(at as usize, 0);
            }
            image.extend_from_slice(&data);
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dev::{Disk, MemDisk},
        fs::{FileSys, ROOT_SECTOR},
        mm::PAGE_SIZE,
    };

    fn image_in_fs(image: &[u8]) -> Arc<File> {
        let fs = FileSys::mount(Disk::new(MemDisk::new(512)), true).unwrap();
        fs.create(ROOT_SECTOR, "prog", 0).unwrap();
        let f = fs.open_file(ROOT_SECTOR, "prog").unwrap();
        assert_eq!(f.write(image), image.len());
        Arc::new(f)
    }

    #[test]
    fn builder_output_parses_back() {
        let data: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let image = ImageBuilder::new()
            .entry(0x0804_8000)
            .segment(0x0804_8000, data.clone(), 4096, false)
            .segment(0x0805_0000, vec![1, 2, 3], 8192, true)
            .build();
        let elf = Elf::from_file(image_in_fs(&image)).unwrap();
        assert_eq!(elf.header.e_entry, 0x0804_8000);
        let phdrs = elf.phdrs().unwrap();
        assert_eq!(phdrs.len(), 2);
        for phdr in &phdrs {
            assert_eq!(phdr.p_type, PT_LOAD);
            // Offset and address agree within the page, so lazy loading
            // can map file pages straight onto virtual pages.
            assert_eq!(
                phdr.p_offset as usize % PAGE_SIZE,
                phdr.p_vaddr as usize % PAGE_SIZE
            );
        }
        assert_eq!(phdrs[0].p_filesz, 300);
        assert!(!phdrs[0].writable());
        assert!(phdrs[1].writable());
        // The segment bytes land where the header says.
        let mut got = vec![0u8; 300];
        assert_eq!(
            elf.file.read_at(&mut got, phdrs[0].p_offset as usize),
            300
        );
        assert_eq!(got, data);
    }

    #[test]
    fn malformed_headers_are_rejected() {
        // Truncated file.
        assert!(Elf::from_file(image_in_fs(b"\x7fELF")).is_err());
        // Wrong machine.
        let mut image = ImageBuilder::new().build();
        image[18] = 0x3e;
        assert!(Elf::from_file(image_in_fs(&image)).is_err());
        // Wrong class.
        let mut image = ImageBuilder::new().build();
        image[4] = 2;
        assert!(Elf::from_file(image_in_fs(&image)).is_err());
    }
}
