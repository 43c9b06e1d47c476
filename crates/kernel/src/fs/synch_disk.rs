//! Synchronous disk access.
//!
//! Serializes threads onto the raw sector device: one request at a time,
//! and the requester sleeps until the device signals completion.

use crate::kernel::Kernel;
use crate::machine::disk::{Disk, SECTOR_SIZE};
use crate::threads::lock::Lock;
use crate::threads::semaphore::Semaphore;

pub struct SynchDisk {
    disk: Disk,
    lock: Lock,
    request_done: Semaphore,
}

impl SynchDisk {
    pub fn new(disk: Disk) -> Self {
        Self {
            disk,
            lock: Lock::new("synch disk"),
            request_done: Semaphore::new("synch disk done", 0),
        }
    }

    pub fn read_sector(&self, k: &Kernel, sector: usize, data: &mut [u8]) {
        assert_eq!(data.len(), SECTOR_SIZE);
        self.lock.acquire(k);
        self.disk.read_sector(sector, data, || self.request_done.v(k));
        self.request_done.p(k);
        self.lock.release(k);
    }

    pub fn write_sector(&self, k: &Kernel, sector: usize, data: &[u8]) {
        assert_eq!(data.len(), SECTOR_SIZE);
        self.lock.acquire(k);
        self.disk.write_sector(sector, data, || self.request_done.v(k));
        self.request_done.p(k);
        self.lock.release(k);
    }
}
