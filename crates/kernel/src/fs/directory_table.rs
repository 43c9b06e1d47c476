//! Process-global registry of open directories.
//!
//! Same shape as the file table but simpler: one mutual-exclusion lock per
//! directory, used to serialize structural changes (entry add/remove)
//! against opens and creates inside that directory.  The coarse table lock
//! is taken per call and covers only the lookup/insert/remove bookkeeping
//! window, never disk I/O.

use std::collections::HashMap;
use std::sync::Arc;

use crate::kernel::Kernel;
use crate::threads::lock::Lock;

struct DirectoryTableEntry {
    opened: u32,
    dir_lock: Arc<Lock>,
}

pub struct DirectoryTable {
    lock: Lock,
    entries: spin::Mutex<HashMap<u32, DirectoryTableEntry>>,
}

impl DirectoryTable {
    pub fn new() -> Self {
        Self {
            lock: Lock::new("directory table"),
            entries: spin::Mutex::new(HashMap::new()),
        }
    }

    /// Register one more open of the directory at `sector` and hand back
    /// its structural lock.
    pub fn open_directory(&self, k: &Kernel, sector: u32) -> Arc<Lock> {
        self.lock.acquire(k);
        let dir_lock = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(sector).or_insert_with(|| DirectoryTableEntry {
                opened: 0,
                dir_lock: Arc::new(Lock::new("directory")),
            });
            entry.opened += 1;
            Arc::clone(&entry.dir_lock)
        };
        self.lock.release(k);
        dir_lock
    }

    pub fn close_directory(&self, k: &Kernel, sector: u32) {
        self.lock.acquire(k);
        {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(&sector)
                .expect("close of a directory that is not in the table");
            entry.opened -= 1;
            if entry.opened == 0 {
                entries.remove(&sector);
            }
        }
        self.lock.release(k);
    }

    /// True when the caller's open is the only one, so the directory can
    /// be removed without yanking it from under another thread.
    pub fn sole_opener(&self, k: &Kernel, sector: u32) -> bool {
        self.lock.acquire(k);
        let sole = self
            .entries
            .lock()
            .get(&sector)
            .is_some_and(|entry| entry.opened == 1);
        self.lock.release(k);
        sole
    }
}
