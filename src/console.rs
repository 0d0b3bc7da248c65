//! Kernel console.
//!
//! All kernel messages, including the mandatory process exit line, go
//! through the [`Console`]. Output is mirrored to the host standard output
//! and captured in a buffer so that a harness can inspect what the kernel
//! printed.

use crate::sync::SpinLock;

/// The kernel console.
pub struct Console {
    captured: SpinLock<String>,
    mirror: bool,
}

impl Console {
    pub(crate) fn new(mirror: bool) -> Self {
        Self {
            captured: SpinLock::new(String::new()),
            mirror,
        }
    }

    /// Writes a line to the console.
    pub fn write_line(&self, line: &str) {
        if self.mirror {
            println!("{}", line);
        }
        let mut guard = self.captured.lock();
        guard.push_str(line);
        guard.push('\n');
        guard.unlock();
    }

    /// Writes raw bytes to the console, as the `write` system call on the
    /// standard output does. Invalid UTF-8 is rendered lossily.
    pub fn write_bytes(&self, bytes: &[u8]) {
        let s = String::from_utf8_lossy(bytes);
        if self.mirror {
            print!("{}", s);
        }
        let mut guard = self.captured.lock();
        guard.push_str(&s);
        guard.unlock();
    }

    /// Returns a copy of everything written so far.
    pub fn contents(&self) -> String {
        let guard = self.captured.lock();
        let out = guard.clone();
        guard.unlock();
        out
    }

    /// Drains the capture buffer and returns it.
    pub fn take(&self) -> String {
        let mut guard = self.captured.lock();
        let out = core::mem::take(&mut *guard);
        guard.unlock();
        out
    }
}
