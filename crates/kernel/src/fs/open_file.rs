//! Open-file handles.
//!
//! A handle binds a header sector, a seek position, and (for files opened
//! through the facade) the shared reader/writer lock and the full path
//! needed to unlink on a deferred removal.  Internal files (free map, root
//! and intermediate directories, swap files) use raw handles with no table
//! registration.
//!
//! `read`/`write` take the file lock for the duration of the I/O and move
//! the seek position; `read_at`/`write_at` are the raw sector engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::fs::file_header::FileHeader;
use crate::fs::file_lock::FileLock;
use crate::fs::path::Path;
use crate::kernel::Kernel;
use crate::machine::disk::SECTOR_SIZE;

pub struct OpenFile {
    sector: u32,
    hdr: spin::Mutex<FileHeader>,
    pos: spin::Mutex<u32>,
    file_lock: Option<Arc<FileLock>>,
    path: Option<Path>,
    closed: AtomicBool,
}

impl OpenFile {
    /// Raw handle on the file whose header lives at `sector`; no open-table
    /// bookkeeping, no reader/writer locking.
    pub(crate) fn new_raw(k: &Kernel, sector: u32) -> Self {
        let mut hdr = FileHeader::new();
        hdr.fetch_from(k, sector);
        Self {
            sector,
            hdr: spin::Mutex::new(hdr),
            pos: spin::Mutex::new(0),
            file_lock: None,
            path: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Handle registered in the file table, sharing `file_lock` with every
    /// other open of the same file.
    pub(crate) fn new_registered(
        k: &Kernel,
        sector: u32,
        file_lock: Arc<FileLock>,
        path: Path,
    ) -> Self {
        let mut file = Self::new_raw(k, sector);
        file.file_lock = Some(file_lock);
        file.path = Some(path);
        file
    }

    pub fn sector(&self) -> u32 {
        self.sector
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_ref()
    }

    pub fn length(&self) -> u32 {
        self.hdr.lock().file_length()
    }

    pub fn seek(&self, position: u32) {
        *self.pos.lock() = position;
    }

    pub(crate) fn with_header_mut<R>(&self, f: impl FnOnce(&mut FileHeader) -> R) -> R {
        f(&mut self.hdr.lock())
    }

    pub(crate) fn write_header_back(&self, k: &Kernel) {
        let hdr = self.hdr.lock().clone();
        hdr.write_back(k, self.sector);
    }

    /// Read from the seek position, as a reader of the shared file lock.
    pub fn read(&self, k: &Kernel, buf: &mut [u8]) -> usize {
        if let Some(lock) = &self.file_lock {
            lock.read_acquire(k);
        }
        let offset = *self.pos.lock();
        let read = self.read_at(k, buf, offset);
        *self.pos.lock() = offset + read as u32;
        if let Some(lock) = &self.file_lock {
            lock.read_release(k);
        }
        read
    }

    /// Write at the seek position, as a writer of the shared file lock.
    /// Writing past EOF extends the file through the façade; if the disk
    /// cannot cover the extension the write is truncated at EOF.
    pub fn write(&self, k: &Kernel, buf: &[u8]) -> usize {
        if let Some(lock) = &self.file_lock {
            lock.write_acquire(k);
        }
        let offset = *self.pos.lock();
        let mut writable = buf.len();
        let length = self.length();
        if offset + buf.len() as u32 > length {
            let grow = offset + buf.len() as u32 - length;
            if k.file_system().extend_open_file(k, self, grow).is_err() {
                writable = length.saturating_sub(offset) as usize;
            }
        }
        let written = self.write_at(k, &buf[..writable], offset);
        *self.pos.lock() = offset + written as u32;
        if let Some(lock) = &self.file_lock {
            lock.write_release(k);
        }
        written
    }

    /// Read up to `buf.len()` bytes at `offset`, clamped to the file
    /// length.  Returns the byte count actually read.
    pub fn read_at(&self, k: &Kernel, buf: &mut [u8], offset: u32) -> usize {
        let hdr = self.hdr.lock().clone();
        let length = hdr.file_length();
        if offset >= length || buf.is_empty() {
            return 0;
        }
        let count = buf.len().min((length - offset) as usize);
        let first = offset as usize / SECTOR_SIZE;
        let last = (offset as usize + count - 1) / SECTOR_SIZE;

        let mut covered = vec![0u8; (last - first + 1) * SECTOR_SIZE];
        for (i, sector_index) in (first..=last).enumerate() {
            let sector = hdr.get_sector(sector_index);
            k.synch_disk.read_sector(
                k,
                sector as usize,
                &mut covered[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE],
            );
        }
        let skew = offset as usize % SECTOR_SIZE;
        buf[..count].copy_from_slice(&covered[skew..skew + count]);
        count
    }

    /// Write up to `buf.len()` bytes at `offset`, clamped to the file
    /// length.  Partial boundary sectors are read, patched and rewritten.
    pub fn write_at(&self, k: &Kernel, buf: &[u8], offset: u32) -> usize {
        let hdr = self.hdr.lock().clone();
        let length = hdr.file_length();
        if offset >= length || buf.is_empty() {
            return 0;
        }
        let count = buf.len().min((length - offset) as usize);
        let first = offset as usize / SECTOR_SIZE;
        let last = (offset as usize + count - 1) / SECTOR_SIZE;
        let skew = offset as usize % SECTOR_SIZE;

        let mut covered = vec![0u8; (last - first + 1) * SECTOR_SIZE];
        if skew != 0 {
            k.synch_disk.read_sector(
                k,
                hdr.get_sector(first) as usize,
                &mut covered[..SECTOR_SIZE],
            );
        }
        if (skew + count) % SECTOR_SIZE != 0 {
            let tail = covered.len() - SECTOR_SIZE;
            k.synch_disk.read_sector(
                k,
                hdr.get_sector(last) as usize,
                &mut covered[tail..],
            );
        }
        covered[skew..skew + count].copy_from_slice(&buf[..count]);
        for (i, sector_index) in (first..=last).enumerate() {
            let sector = hdr.get_sector(sector_index);
            k.synch_disk.write_sector(
                k,
                sector as usize,
                &covered[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE],
            );
        }
        count
    }

    /// Run the open-table close protocol.  Idempotent; raw handles have
    /// nothing to do.
    pub fn close(&self, k: &Kernel) {
        if self.file_lock.is_none() || self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        k.file_system().close_open_file(k, self);
    }
}
