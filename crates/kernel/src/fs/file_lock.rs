//! Reader/writer lock for one open file.
//!
//! Writer-priority with bounded reader starvation: writers hold the
//! turnstile across their critical section, so a stream of new readers
//! cannot pass a waiting writer forever: readers only touch the turnstile
//! long enough to be blocked while a writer is queued on it.

use crate::kernel::Kernel;
use crate::threads::lock::Lock;
use crate::threads::semaphore::Semaphore;

pub struct FileLock {
    readers_lock: Lock,
    room: Semaphore,
    turnstile: Semaphore,
    readers: spin::Mutex<u32>,
}

impl FileLock {
    pub fn new() -> Self {
        Self {
            readers_lock: Lock::new("file readers"),
            room: Semaphore::new("file room", 1),
            turnstile: Semaphore::new("file turnstile", 1),
            readers: spin::Mutex::new(0),
        }
    }

    pub fn write_acquire(&self, k: &Kernel) {
        self.turnstile.p(k);
        self.room.p(k);
    }

    pub fn write_release(&self, k: &Kernel) {
        self.turnstile.v(k);
        self.room.v(k);
    }

    pub fn read_acquire(&self, k: &Kernel) {
        self.turnstile.p(k);
        self.turnstile.v(k);
        self.readers_lock.acquire(k);
        let first = {
            let mut readers = self.readers.lock();
            *readers += 1;
            *readers == 1
        };
        if first {
            self.room.p(k);
        }
        self.readers_lock.release(k);
    }

    pub fn read_release(&self, k: &Kernel) {
        self.readers_lock.acquire(k);
        let last = {
            let mut readers = self.readers.lock();
            *readers -= 1;
            *readers == 0
        };
        if last {
            self.room.v(k);
        }
        self.readers_lock.release(k);
    }
}

impl Default for FileLock {
    fn default() -> Self {
        Self::new()
    }
}
