//! Process-global registry of open files.
//!
//! Keyed by header sector.  An entry carries the open count, the pending
//! removal flag, and the reader/writer lock shared by every handle on the
//! file.  The coarse table lock is taken per call and guards only the
//! bookkeeping window; file I/O serializes on the per-file lock, and the
//! remove/close flows serialize on the parent directory's lock.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::fs::file_lock::FileLock;
use crate::kernel::Kernel;
use crate::threads::lock::Lock;

struct FileTableEntry {
    opened: u32,
    to_remove: bool,
    rw_lock: Arc<FileLock>,
}

pub struct FileTable {
    lock: Lock,
    entries: spin::Mutex<HashMap<u32, FileTableEntry>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            lock: Lock::new("file table"),
            entries: spin::Mutex::new(HashMap::new()),
        }
    }

    /// Register one more open of the file at `sector` and hand back its
    /// reader/writer lock.  `None` if a removal is pending: the file is on
    /// its way out and takes no new opens.
    pub fn open_file(&self, k: &Kernel, sector: u32) -> Option<Arc<FileLock>> {
        self.lock.acquire(k);
        let result = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&sector) {
                Some(entry) if entry.to_remove => None,
                Some(entry) => {
                    entry.opened += 1;
                    Some(Arc::clone(&entry.rw_lock))
                }
                None => {
                    let rw_lock = Arc::new(FileLock::new());
                    entries.insert(
                        sector,
                        FileTableEntry {
                            opened: 1,
                            to_remove: false,
                            rw_lock: Arc::clone(&rw_lock),
                        },
                    );
                    Some(rw_lock)
                }
            }
        };
        self.lock.release(k);
        result
    }

    /// Drop one open.  Returns true when this was the last handle and a
    /// removal was pending: the caller must now unlink the file on disk.
    pub fn close_file(&self, k: &Kernel, sector: u32) -> bool {
        self.lock.acquire(k);
        let unlink = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(&sector)
                .expect("close of a file that is not in the table");
            entry.opened -= 1;
            if entry.opened == 0 {
                let pending = entry.to_remove;
                entries.remove(&sector);
                pending
            } else {
                false
            }
        };
        self.lock.release(k);
        unlink
    }

    /// Ask to remove the file at `sector`.  True means nobody holds it and
    /// the caller may unlink at once; false marks the entry so the last
    /// close unlinks instead.  The flag never clears once set.
    pub fn set_remove(&self, k: &Kernel, sector: u32) -> bool {
        self.lock.acquire(k);
        let now = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&sector) {
                Some(entry) => {
                    debug!(target: "fs", "removal of sector {sector} deferred to last close");
                    entry.to_remove = true;
                    false
                }
                None => true,
            }
        };
        self.lock.release(k);
        now
    }
}
