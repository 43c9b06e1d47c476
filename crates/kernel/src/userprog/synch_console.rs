//! Thread-safe blocking console.
//!
//! Wraps the raw byte-at-a-time device: one lock serializes readers, one
//! serializes writers, and two semaphores carry the device's read-avail
//! and write-done completions back to the blocked requester.

use crate::kernel::Kernel;
use crate::machine::console::Console;
use crate::threads::lock::Lock;
use crate::threads::semaphore::Semaphore;

pub struct SynchConsole {
    console: Console,
    read_avail: Semaphore,
    write_done: Semaphore,
    lock_read: Lock,
    lock_write: Lock,
}

impl SynchConsole {
    pub fn new(console: Console) -> Self {
        Self {
            console,
            read_avail: Semaphore::new("read avail", 0),
            write_done: Semaphore::new("write done", 0),
            lock_read: Lock::new("read console"),
            lock_write: Lock::new("write console"),
        }
    }

    /// Write `buf`, one byte per device round trip.
    pub fn write(&self, k: &Kernel, buf: &[u8]) {
        self.lock_write.acquire(k);
        for &byte in buf {
            self.console.put_char(byte, || self.write_done.v(k));
            self.write_done.p(k);
        }
        self.lock_write.release(k);
    }

    /// Fill `buf`, one byte per device round trip.  End of input reads as
    /// NUL bytes.
    pub fn read(&self, k: &Kernel, buf: &mut [u8]) {
        self.lock_read.acquire(k);
        for byte in buf.iter_mut() {
            self.console.fetch_char(|| self.read_avail.v(k));
            self.read_avail.p(k);
            *byte = self.console.get_char();
        }
        self.lock_read.release(k);
    }
}
